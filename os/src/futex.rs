// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wait on a memory cell until somebody says it changed.

use core::ops::Deref;
use portable_atomic::{AtomicU32, Ordering};

use crate::platform::Platform;
use crate::queue::TaskStack;
use crate::scheduler::Scheduler;

/// A 32-bit cell plus a list of tasks waiting for it to change.
///
/// The futex never modifies the value itself. Wakers update the value and
/// then call [`wake`][Futex::wake] or [`wake_all`][Futex::wake_all]; waiters
/// re-check the value after [`wait`][Futex::wait] returns.
///
/// Waiters wake in LIFO order: the task that started waiting most recently
/// goes first.
///
/// Only the futex can end a wait. [`Scheduler::resume`] on a waiting task
/// does nothing, and a resume that was already pending when the task started
/// waiting stays pending until after the wait.
pub struct Futex {
    value: AtomicU32,
    waiters: TaskStack,
}

impl Futex {
    /// Creates a futex holding `value`, with no waiters.
    pub const fn new(value: u32) -> Self {
        Self {
            value: AtomicU32::new(value),
            waiters: TaskStack::new(),
        }
    }

    /// If the value still equals `expected`, pauses the current task until
    /// it's woken through this futex and returns `true`. Otherwise returns
    /// `false` without blocking.
    ///
    /// A `true` return always means a deliberate wake; there are no spurious
    /// wakeups. It does not mean the value changed, only that someone asked
    /// us to look again.
    pub fn wait<P: Platform, const N: usize>(
        &self,
        sched: &Scheduler<P, N>,
        expected: u32,
    ) -> bool {
        let guard = sched.futex_lock().lock(sched.platform());
        if self.value.load(Ordering::Acquire) != expected {
            return false;
        }
        let pending = sched.park(|links, me| self.waiters.push(links, me));
        drop(guard);

        // A wake may land between here and the pause; `pause` handles that.
        sched.pause();
        if pending {
            sched.resume(sched.current());
        }
        true
    }

    /// Wakes the most recent waiter, if there is one.
    pub fn wake<P: Platform, const N: usize>(&self, sched: &Scheduler<P, N>) {
        let _guard = sched.futex_lock().lock(sched.platform());
        if let Some(task) = self.waiters.pop(sched.links()) {
            sched.wake_parked(task);
        }
    }

    /// Wakes every waiter.
    pub fn wake_all<P: Platform, const N: usize>(&self, sched: &Scheduler<P, N>) {
        let _guard = sched.futex_lock().lock(sched.platform());
        while let Some(task) = self.waiters.pop(sched.links()) {
            sched.wake_parked(task);
        }
    }

    /// Checks for waiters without taking the lock, so the answer may be
    /// stale by the time you look at it.
    pub fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }
}

impl Deref for Futex {
    type Target = AtomicU32;

    fn deref(&self) -> &AtomicU32 {
        &self.value
    }
}
