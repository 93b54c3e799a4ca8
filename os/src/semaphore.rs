// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Counting semaphore on top of [`Futex`].

use portable_atomic::Ordering;

use crate::error::{fatal, Fatal};
use crate::futex::Futex;
use crate::platform::Platform;
use crate::scheduler::Scheduler;

/// A counting semaphore.
///
/// The futex value is the number of available permits. A semaphore also
/// knows how many permits it was built with, and releasing past that count
/// is a fatal error: it means somebody released a permit they never held.
pub struct Semaphore {
    futex: Futex,
    max: u32,
}

impl Semaphore {
    /// Creates a semaphore with `initial` permits available out of `max`.
    ///
    /// # Panics
    ///
    /// If `initial > max`.
    pub const fn new(initial: u32, max: u32) -> Self {
        assert!(initial <= max);
        Self {
            futex: Futex::new(initial),
            max,
        }
    }

    /// Creates an available semaphore with a single permit, i.e. a lock.
    pub const fn binary() -> Self {
        Self::new(1, 1)
    }

    /// Number of permits available right now. Racy.
    pub fn available(&self) -> u32 {
        self.futex.load(Ordering::Relaxed)
    }

    /// Takes a permit if one is available, without blocking.
    pub fn try_acquire(&self) -> bool {
        let mut current = self.futex.load(Ordering::Relaxed);
        while current > 0 {
            match self.futex.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Takes a permit, pausing the current task until one is available.
    pub fn acquire<P: Platform, const N: usize>(&self, sched: &Scheduler<P, N>) {
        while !self.try_acquire() {
            self.futex.wait(sched, 0);
        }
    }

    /// Returns a permit and wakes one waiting acquirer.
    ///
    /// # Panics
    ///
    /// Halts via [`fatal`] if every permit is already available.
    pub fn release<P: Platform, const N: usize>(&self, sched: &Scheduler<P, N>) {
        let max = self.max;
        let returned = self
            .futex
            .fetch_update(Ordering::Release, Ordering::Relaxed, |n| {
                (n < max).then_some(n + 1)
            });
        if returned.is_err() {
            fatal(Fatal::SemaphoreOverRelease);
        }
        self.futex.wake(sched);
    }
}
