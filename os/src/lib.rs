// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A cooperative, multicore-aware task scheduler for bare-metal targets.
//!
//! `cosched` runs lightweight tasks, each with its own stack, on one or more
//! physical cores with no operating system underneath. Tasks are never
//! preempted by the scheduler: they run until they call into a blocking
//! operation ([`Scheduler::pause`], [`Scheduler::sleep`], [`Futex::wait`],
//! [`Semaphore::acquire`]), at which point the core switches directly to the
//! next runnable task.
//!
//! # Structure
//!
//! All scheduler state lives in a single [`Scheduler`] value, normally placed
//! in a `static` by the chip support crate. It is generic over a [`Platform`],
//! which supplies the hardware pieces the scheduler cannot do itself:
//!
//! - interrupt masking and "wait for event" ([`Cpu`]),
//! - a monotonic tick counter with a low-power sleep ([`Clock`]),
//! - test-and-set registers for the cross-core spinlocks ([`HwSpinlocks`]),
//! - raw memory for task stacks ([`StackAllocator`]),
//! - the register-level context switch ([`Arch`]).
//!
//! Shared state is guarded by three independent spinlocks (see
//! [`LockId`]). A spinlock acquisition also masks interrupts on the local
//! core, so interrupt handlers may safely call [`Scheduler::resume`] and
//! [`Futex::wake`].
//!
//! # Ordering
//!
//! The run queue and each futex's waiter list are LIFO: the most recently
//! woken task runs next. There is no fairness guarantee. The sleep queue is
//! kept sorted by deadline, so sleepers fire in deadline order.
//!
//! # Secondary cores
//!
//! Cores other than the boot core are started with the RP2040-style mailbox
//! handshake in [`multicore`], and then enter [`Scheduler::run_core`].

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

#[macro_use]
mod fmt;

pub mod arch;
mod error;
mod futex;
pub mod multicore;
mod percore;
mod platform;
mod queue;
mod scheduler;
mod semaphore;
mod spinlock;
mod task;

#[cfg(test)]
mod sim;

pub use arch::{Arch, TaskStart};
pub use error::{fatal, Fatal, LaunchError, SpawnError};
pub use futex::Futex;
pub use percore::{PerCore, CORES};
pub use platform::{Clock, Cpu, HwSpinlocks, LockId, Platform, StackAllocator};
pub use scheduler::{Scheduler, TaskEntry};
pub use semaphore::Semaphore;
pub use spinlock::{SpinGuard, SpinLock};
pub use task::{RunState, Task};

/// Re-export of the atomics crate used throughout, so that platform crates
/// agree with us on the types.
pub use portable_atomic;

/// Value written to the lowest word of every task stack, and checked each
/// time the task pauses. If it changes, the task has run off the end of its
/// stack.
pub const STACK_CANARY: usize = 0x670c_1333_b83b_f575_u64 as usize;

/// Alignment of task stacks and of the initial stack pointer.
pub const STACK_ALIGN: usize = 8;

/// Smallest stack we'll hand to a task, in bytes. Requests below this are
/// rounded up.
pub const MIN_STACK_SIZE: usize = 256;
