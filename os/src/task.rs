// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task handles and per-task bookkeeping.

use core::fmt;
use core::ptr::NonNull;

use crate::arch::Arch;
use crate::STACK_CANARY;

/// Handle to a task. This is an index into the scheduler's task table, and
/// stays valid (if not very useful) after the task exits.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Task(pub(crate) usize);

impl Task {
    /// Position of this task in the task table.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Whether a task is executing, or could be.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RunState {
    /// Current on some core, or about to be.
    Running,
    /// Current on some core, and somebody has called
    /// [`resume`][crate::Scheduler::resume] on it. Its next pause returns
    /// immediately.
    Resuming,
    /// Switched away from. Its context is saved and it can be resumed.
    Paused,
}

impl RunState {
    /// Checks whether `self -> next` is one of the transitions the scheduler
    /// is allowed to make.
    pub fn can_become(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Running, Paused) | (Paused, Running) | (Running, Resuming) | (Resuming, Running)
        )
    }
}

/// Which list, if any, a task is linked into. They all share the same link
/// words, so a task may only be on one.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Queued {
    No,
    Run,
    Sleep,
    /// Some futex's waiter list. Only that futex may unlink it.
    Futex,
}

/// Lifecycle of a task table slot. Slots are not reused after exit, because
/// the stack that goes with them isn't either.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Slot {
    Vacant,
    /// Claimed by a spawn that's off allocating a stack.
    Reserved,
    Live,
    Exited,
}

/// Everything the scheduler knows about one task. Only touched with the
/// scheduler lock held.
pub(crate) struct TaskState<A: Arch> {
    pub run_state: RunState,
    /// Valid while `run_state` is not `Running`.
    pub context: A::Context,
    /// Lowest word of the task's stack. Not an owning pointer.
    pub canary: Option<NonNull<usize>>,
    /// Wake deadline while on the sleep queue.
    pub wake_data: u64,
    pub queued: Queued,
    pub slot: Slot,
}

// Safety: the canary pointer is only read, with the scheduler lock held.
unsafe impl<A: Arch> Send for TaskState<A> {}

impl<A: Arch> TaskState<A> {
    pub const VACANT: Self = Self {
        run_state: RunState::Paused,
        context: A::EMPTY,
        canary: None,
        wake_data: 0,
        queued: Queued::No,
        slot: Slot::Vacant,
    };

    pub fn set_run_state(&mut self, next: RunState) {
        debug_assert!(
            self.run_state.can_become(next),
            "illegal run state change {:?} -> {:?}",
            self.run_state,
            next,
        );
        self.run_state = next;
    }

    pub fn canary_intact(&self) -> bool {
        match self.canary {
            // Safety: the canary points at the base of a stack that is never
            // freed.
            Some(p) => unsafe { p.as_ptr().read_volatile() == STACK_CANARY },
            None => true,
        }
    }
}
