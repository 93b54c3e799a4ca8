// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types, and the fatal-error path.

/// Conditions the scheduler refuses to continue past.
///
/// Each of these means either a programming error in task code or memory
/// corruption, and there is no defined way to recover the concurrency state
/// afterwards. They are reported through [`fatal`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Fatal {
    /// The canary at the bottom of a task stack was overwritten.
    #[error("task stack overflow")]
    StackOverflow,
    /// A blocking operation was attempted from an interrupt handler.
    #[error("blocked inside interrupt")]
    PauseInInterrupt,
    /// A spinlock was released that nobody held.
    #[error("spinlock released while not held")]
    UnlockNotHeld,
    /// A semaphore was released more times than it was acquired.
    #[error("semaphore released more times than acquired")]
    SemaphoreOverRelease,
    /// A task operation ran on a core that has no current task.
    #[error("no current task on this core")]
    NoCurrentTask,
    /// A core entered the scheduler but the task table had no room to track
    /// it.
    #[error("no task slot left for this core")]
    NoSlotForCore,
}

/// Halts on an unrecoverable condition.
///
/// This logs the condition and panics; on target the panic handler is
/// expected to stop the system.
#[cold]
#[track_caller]
pub fn fatal(cause: Fatal) -> ! {
    error!("fatal: {}", cause);
    panic!("{}", cause)
}

/// Reasons [`Scheduler::spawn`][crate::Scheduler::spawn] can fail.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpawnError {
    /// The platform allocator could not supply a stack of this many bytes.
    #[error("could not allocate a {0} byte task stack")]
    OutOfMemory(usize),
    /// Every slot in the task table is in use.
    #[error("task table is full")]
    TooManyTasks,
}

/// Reasons [`launch`][crate::multicore::launch] can fail.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LaunchError {
    /// The secondary core never echoed the full launch sequence.
    #[error("secondary core not responding after {0} attempts")]
    NotResponding(u32),
}
