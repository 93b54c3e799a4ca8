// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cross-core spinlocks that also mask local interrupts.
//!
//! A lock is a hardware test-and-set register polled in a busy loop. Before
//! spinning we mask interrupts on the local core, so that an interrupt
//! handler can't try to take a lock its own core already holds. The prior
//! interrupt state is restored on release.
//!
//! On single-core builds there is nobody to spin against, so a lock is just
//! interrupt masking plus bookkeeping.
//!
//! # Holding a lock across a context switch
//!
//! The scheduler lock is deliberately held *across* task switches: the task
//! that switches away takes it, and the task that gets switched in drops it.
//! This works because the hardware registers are not owned by any particular
//! core or stack. See [`SpinLock::adopt`] for the entry point that picks up a
//! lock taken elsewhere.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use portable_atomic::{AtomicBool, Ordering};

use crate::error::{fatal, Fatal};
use crate::percore::CORES;
use crate::platform::{Cpu, HwSpinlocks, LockId};

/// A value guarded by one of the hardware spinlocks.
pub struct SpinLock<T> {
    id: LockId,
    /// Tracks whether the lock is claimed, so that releasing an unclaimed
    /// lock can be caught.
    held: AtomicBool,
    data: UnsafeCell<T>,
}

// Safety: access to `data` is serialized by the hardware lock.
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a lock guarding `data` with hardware lock `id`.
    ///
    /// Two `SpinLock`s must not share an `id` unless they are never held at
    /// the same time.
    pub const fn new(id: LockId, data: T) -> Self {
        Self {
            id,
            held: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Checks whether somebody holds the lock right now.
    ///
    /// This is racy and only meant for diagnostics.
    pub fn is_locked(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }

    /// Masks interrupts, then spins until the lock is ours.
    ///
    /// The returned guard releases the lock and restores the interrupt state
    /// when dropped. Never call [`Scheduler::pause`][crate::Scheduler::pause]
    /// (or anything that blocks) while holding a guard, or every other core
    /// will spin forever.
    pub fn lock<'a, P>(&'a self, platform: &'a P) -> SpinGuard<'a, T, P>
    where
        P: Cpu + HwSpinlocks,
    {
        let irq_was_enabled = self.acquire(platform);
        SpinGuard {
            lock: self,
            platform,
            irq_was_enabled,
        }
    }

    /// Produces a guard for a lock that was claimed by someone else, who is
    /// handing it over to us.
    ///
    /// `irq_was_enabled` is the interrupt state the guard will restore when
    /// it drops.
    ///
    /// # Safety
    ///
    /// The party that claimed the lock must not release it. It either
    /// [leaked][SpinGuard::leak] its guard, or is suspended in a context
    /// switch that will be balanced by a future handoff back to it.
    pub unsafe fn adopt<'a, P>(
        &'a self,
        platform: &'a P,
        irq_was_enabled: bool,
    ) -> SpinGuard<'a, T, P>
    where
        P: Cpu + HwSpinlocks,
    {
        if !self.held.load(Ordering::Acquire) {
            fatal(Fatal::UnlockNotHeld);
        }
        SpinGuard {
            lock: self,
            platform,
            irq_was_enabled,
        }
    }

    fn acquire<P: Cpu + HwSpinlocks>(&self, platform: &P) -> bool {
        let irq_was_enabled = platform.interrupts_disable();
        if CORES > 1 {
            while !platform.try_claim(self.id) {
                core::hint::spin_loop();
            }
        }
        self.held.store(true, Ordering::Release);
        irq_was_enabled
    }

    /// # Safety
    ///
    /// The caller must own the current claim on the lock.
    unsafe fn release<P: Cpu + HwSpinlocks>(&self, platform: &P, irq_was_enabled: bool) {
        // Plain loads and stores only: on cores without CAS, read-modify-write
        // atomics are emulated with a critical section, which may itself be
        // built on one of these locks.
        if !self.held.load(Ordering::Acquire) {
            fatal(Fatal::UnlockNotHeld);
        }
        self.held.store(false, Ordering::Release);
        if CORES > 1 {
            platform.release(self.id);
        }
        if irq_was_enabled {
            // Safety: this undoes the masking done in `acquire`, which found
            // interrupts on.
            unsafe { platform.interrupts_enable() }
        }
    }
}

/// Proof that a [`SpinLock`] is held. Dropping it releases the lock.
#[must_use = "dropping the guard releases the lock immediately"]
pub struct SpinGuard<'a, T, P: Cpu + HwSpinlocks> {
    lock: &'a SpinLock<T>,
    platform: &'a P,
    irq_was_enabled: bool,
}

impl<T, P: Cpu + HwSpinlocks> SpinGuard<'_, T, P> {
    /// Releases the lock for the duration of `body`, then takes it back.
    ///
    /// The lock is re-taken even if `body` panics, so the guard's drop stays
    /// balanced during unwinding.
    pub fn unlocked<R>(&mut self, body: impl FnOnce() -> R) -> R {
        // Safety: we hold the claim, by virtue of being the guard.
        unsafe { self.lock.release(self.platform, self.irq_was_enabled) };
        let _relock = scopeguard::guard(self, |guard| {
            guard.irq_was_enabled = guard.lock.acquire(guard.platform);
        });
        body()
    }

    /// Forgets the guard without releasing the lock, returning the interrupt
    /// state it would have restored. Pair with [`SpinLock::adopt`].
    pub fn leak(self) -> bool {
        let irq_was_enabled = self.irq_was_enabled;
        core::mem::forget(self);
        irq_was_enabled
    }
}

impl<T, P: Cpu + HwSpinlocks> Deref for SpinGuard<'_, T, P> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard's existence means we hold the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T, P: Cpu + HwSpinlocks> DerefMut for SpinGuard<'_, T, P> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard's existence means we hold the lock, and `&mut
        // self` means nobody else is using the guard.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T, P: Cpu + HwSpinlocks> Drop for SpinGuard<'_, T, P> {
    fn drop(&mut self) {
        // Safety: we hold the claim.
        unsafe { self.lock.release(self.platform, self.irq_was_enabled) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimPlatform;
    use std::sync::Arc;

    #[test]
    fn lock_masks_interrupts_until_dropped() {
        let platform = SimPlatform::new();
        let lock = SpinLock::new(LockId::Scheduler, 0u32);

        assert!(platform.interrupts_enabled());
        let mut guard = lock.lock(&platform);
        *guard += 1;
        assert!(!platform.interrupts_enabled());
        assert!(platform.is_claimed(LockId::Scheduler));
        drop(guard);

        assert!(platform.interrupts_enabled());
        assert!(!platform.is_claimed(LockId::Scheduler));
        assert!(!lock.is_locked());
    }

    #[test]
    fn nested_locks_restore_outer_state() {
        let platform = SimPlatform::new();
        let futex = SpinLock::new(LockId::Futex, ());
        let sched = SpinLock::new(LockId::Scheduler, ());

        let outer = futex.lock(&platform);
        let inner = sched.lock(&platform);
        drop(inner);
        // The inner guard found interrupts already masked, so it must leave
        // them that way.
        assert!(!platform.interrupts_enabled());
        drop(outer);
        assert!(platform.interrupts_enabled());
    }

    #[test]
    fn unlocked_releases_for_the_body_only() {
        let platform = SimPlatform::new();
        let lock = SpinLock::new(LockId::Atomic, ());

        let mut guard = lock.lock(&platform);
        let claimed_inside = guard.unlocked(|| platform.is_claimed(LockId::Atomic));
        assert!(!claimed_inside);
        assert!(platform.is_claimed(LockId::Atomic));
        assert!(!platform.interrupts_enabled());
        drop(guard);
        assert!(platform.interrupts_enabled());
    }

    #[test]
    fn leak_and_adopt_hand_the_lock_over() {
        let platform = SimPlatform::new();
        let lock = SpinLock::new(LockId::Scheduler, 7u8);

        let irq = lock.lock(&platform).leak();
        assert!(lock.is_locked());
        let guard = unsafe { lock.adopt(&platform, irq) };
        assert_eq!(*guard, 7);
        drop(guard);
        assert!(!lock.is_locked());
        assert!(platform.interrupts_enabled());
    }

    #[test]
    #[should_panic(expected = "spinlock released while not held")]
    fn adopting_a_free_lock_is_fatal() {
        let platform = SimPlatform::new();
        let lock = SpinLock::new(LockId::Scheduler, ());
        let _guard = unsafe { lock.adopt(&platform, true) };
    }

    #[test]
    fn contended_counter_is_exact() {
        let platform = Arc::new(SimPlatform::new());
        let lock = Arc::new(SpinLock::new(LockId::Scheduler, 0u64));

        let workers: Vec<_> = (0..CORES)
            .map(|core| {
                let platform = platform.clone();
                let lock = lock.clone();
                std::thread::spawn(move || {
                    crate::sim::set_core(core);
                    for _ in 0..10_000 {
                        *lock.lock(&*platform) += 1;
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        assert_eq!(*lock.lock(&*platform), 10_000 * CORES as u64);
    }
}
