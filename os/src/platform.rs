// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The hardware interface the scheduler is written against.
//!
//! A chip support crate implements these traits for a single zero-sized type
//! and hands it to [`Scheduler::new`][crate::Scheduler::new].

use core::ptr::NonNull;

use crate::arch::Arch;

/// Names the three cross-core spinlocks. Each guards disjoint data, so they
/// can be held in a nested fashion without deadlock as long as everybody
/// nests them the same way (futex before scheduler).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum LockId {
    /// Emulated atomic read-modify-write operations.
    Atomic = 0,
    /// Futex waiter lists.
    Futex = 1,
    /// Run queue, sleep queue, and every task's run state.
    Scheduler = 2,
}

impl LockId {
    /// Index of the hardware register backing this lock.
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Per-core control operations.
pub trait Cpu {
    /// Returns the index of the core executing this call, in `0..CORES`.
    fn cpuid(&self) -> usize;

    /// Checks whether the caller is running in an interrupt handler.
    fn in_interrupt(&self) -> bool;

    /// Masks interrupts on this core, returning `true` if they were enabled
    /// before the call.
    fn interrupts_disable(&self) -> bool;

    /// Unmasks interrupts on this core.
    ///
    /// # Safety
    ///
    /// Only call this to undo a matching [`Cpu::interrupts_disable`] that
    /// found interrupts enabled.
    unsafe fn interrupts_enable(&self);

    /// Blocks this core until any event or interrupt occurs. May return
    /// spuriously.
    fn wait_for_events(&self);

    /// Signals an event to every core, breaking them out of
    /// [`Cpu::wait_for_events`].
    fn send_event(&self);
}

/// The monotonic time source.
pub trait Clock {
    /// Current tick count. Never goes backwards.
    fn ticks(&self) -> u64;

    /// Waits in a low-power state for `duration` ticks. May return early if
    /// an event fires, in which case the caller re-checks.
    fn sleep_ticks(&self, duration: u64);
}

/// Hardware test-and-set registers, one per [`LockId`].
pub trait HwSpinlocks {
    /// Attempts to claim the lock, returning `true` on success. Must not
    /// block. A successful claim is an acquire barrier.
    fn try_claim(&self, lock: LockId) -> bool;

    /// Releases a lock previously claimed with [`HwSpinlocks::try_claim`].
    /// This is a release barrier.
    fn release(&self, lock: LockId);
}

/// Raw memory for task stacks.
pub trait StackAllocator {
    /// Returns the base (lowest address) of a fresh region of at least `size`
    /// bytes, aligned to [`STACK_ALIGN`][crate::STACK_ALIGN], or `None` when
    /// out of memory. Regions are never handed back.
    fn allocate_stack(&self, size: usize) -> Option<NonNull<u8>>;
}

/// Everything the scheduler needs from the hardware, bundled.
pub trait Platform: Cpu + Clock + HwSpinlocks + StackAllocator + Sync {
    /// How this platform switches between task stacks.
    type Arch: Arch;
}
