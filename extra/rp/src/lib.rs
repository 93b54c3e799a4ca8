//! RP2040 support for `cosched`.
//!
//! Provides [`Rp2040`], which implements the platform traits on top of the
//! SIO block (core id, spinlocks, inter-core FIFO), PRIMASK, WFE/SEV and the
//! 64-bit microsecond timer, plus a global [`SCHED`] and free functions that
//! forward to it.
//!
//! A program calls [`init`] early, then [`start`], which never returns:
//!
//! ```ignore
//! #[cortex_m_rt::entry]
//! fn main() -> ! {
//!     unsafe { cosched_rp::init() };
//!     cosched_rp::start(app, 0, 4096)
//! }
//! ```
//!
//! Ticks are microseconds, provided the watchdog tick generator has been set
//! up to feed the timer at 1 MHz (the usual clock setup does this).

// Nothing here makes sense off the chip.
#![cfg(all(target_arch = "arm", target_os = "none"))]
#![no_std]
#![deny(dead_code)]

mod critical_section_impl;
#[cfg(feature = "multicore")]
pub mod multicore;
mod stacks;
mod timer;

extern crate rp_pac as pac;

use core::ptr::NonNull;
use core::sync::atomic::{compiler_fence, Ordering};

use cortex_m::peripheral::scb::VectActive;
use cortex_m::peripheral::SCB;
use cosched::arch::CortexM;
use cosched::{Cpu, HwSpinlocks, LockId, Platform, Scheduler};

pub use cosched::{Futex, RunState, Semaphore, SpawnError, Task, TaskEntry};

/// Capacity of the task table, including one slot per core.
pub const MAX_TASKS: usize = 16;

/// Bytes set aside for task stacks.
pub const STACK_POOL_SIZE: usize = 32 * 1024;

/// The RP2040, as seen by the scheduler.
#[derive(Copy, Clone, Debug, Default)]
pub struct Rp2040;

/// The scheduler for this chip.
pub static SCHED: Scheduler<Rp2040, MAX_TASKS> = Scheduler::new(Rp2040);

impl Cpu for Rp2040 {
    fn cpuid(&self) -> usize {
        pac::SIO.cpuid().read() as usize
    }

    fn in_interrupt(&self) -> bool {
        SCB::vect_active() != VectActive::ThreadMode
    }

    fn interrupts_disable(&self) -> bool {
        let was_enabled = cortex_m::register::primask::read().is_active();
        cortex_m::interrupt::disable();
        was_enabled
    }

    unsafe fn interrupts_enable(&self) {
        // Safety: our caller is undoing its own `interrupts_disable`.
        unsafe { cortex_m::interrupt::enable() }
    }

    fn wait_for_events(&self) {
        cortex_m::asm::wfe();
    }

    fn send_event(&self) {
        cortex_m::asm::sev();
    }
}

impl HwSpinlocks for Rp2040 {
    fn try_claim(&self, lock: LockId) -> bool {
        // Reading a SIO spinlock claims it, and returns nonzero if we got it.
        let claimed = pac::SIO.spinlock(lock.index()).read() != 0;
        if claimed {
            // The RP2040 has no caches, so keeping the compiler in line is
            // enough.
            compiler_fence(Ordering::Acquire);
        }
        claimed
    }

    fn release(&self, lock: LockId) {
        compiler_fence(Ordering::Release);
        pac::SIO.spinlock(lock.index()).write_value(1);
    }
}

impl Platform for Rp2040 {
    type Arch = CortexM;
}

/// Gets the chip into a known state. Call this first thing.
///
/// # Safety
///
/// Resets core 1 and the SIO block, so nothing else may be using either.
pub unsafe fn init() {
    // SIO does not get reset when core0 is reset with either `scb::sys_reset()` or with SWD.
    // The scheduler's spinlocks live in SIO, so a reset in the middle of a
    // locked region would leave the next boot spinning forever on a lock
    // nobody holds.
    //
    // Important info from PSM logic:
    //
    //     The logic is, each PSM stage is reset if either of the following is true:
    //     - The previous stage is in reset and FRCE_ON is false
    //     - FRCE_OFF is true
    //
    // The PSM order is SIO -> PROC0 -> PROC1.
    // So, we have to force-on PROC0 to prevent it from getting reset when resetting SIO.
    pac::PSM.frce_on().write_and_wait(|w| {
        w.set_proc0(true);
    });
    // Then reset SIO and PROC1.
    pac::PSM.frce_off().write_and_wait(|w| {
        w.set_sio(true);
        w.set_proc1(true);
    });
    // clear force_off first, force_on second. The other way around would reset PROC0.
    pac::PSM.frce_off().write_and_wait(|_| {});
    pac::PSM.frce_on().write_and_wait(|_| {});

    timer::init();
}

/// Starts the scheduler on core 0 (and core 1, with the `multicore`
/// feature), with `main(arg)` as the first task.
///
/// The boot stack is not used after this, apart from its bottom word, which
/// holds the canary for core 0's idle context.
pub fn start(main: TaskEntry, arg: usize, stack_size: usize) -> ! {
    extern "C" {
        static mut _stack_end: usize;
    }

    if let Err(e) = SCHED.spawn(main, arg, stack_size) {
        panic!("can't start main task: {}", e);
    }

    #[cfg(feature = "multicore")]
    if let Err(e) = multicore::spawn_core1() {
        panic!("{}", e);
    }

    // Safety: `_stack_end` is the lowest word of the boot stack, which we are
    // on, and this is the first scheduler call from core 0.
    unsafe {
        let bottom = NonNull::new_unchecked(core::ptr::addr_of_mut!(_stack_end));
        SCHED.run_core(bottom)
    }
}

/// See [`Scheduler::spawn`].
pub fn spawn(entry: TaskEntry, arg: usize, stack_size: usize) -> Result<Task, SpawnError> {
    SCHED.spawn(entry, arg, stack_size)
}

/// See [`Scheduler::spawn_fn`].
pub fn spawn_fn(
    body: impl FnOnce() + Send + 'static,
    stack_size: usize,
) -> Result<Task, SpawnError> {
    SCHED.spawn_fn(body, stack_size)
}

/// See [`Scheduler::pause`].
pub fn pause() {
    SCHED.pause()
}

/// See [`Scheduler::resume`].
pub fn resume(task: Task) {
    SCHED.resume(task)
}

/// See [`Scheduler::sleep`]. Durations are in microseconds.
pub fn sleep(duration: u64) {
    SCHED.sleep(duration)
}

/// See [`Scheduler::sleep_until`].
pub fn sleep_until(deadline: u64) {
    SCHED.sleep_until(deadline)
}

/// See [`Scheduler::yield_now`].
pub fn yield_now() {
    SCHED.yield_now()
}

/// See [`Scheduler::current`].
pub fn current() -> Task {
    SCHED.current()
}

/// Microseconds since the timer started.
pub fn ticks() -> u64 {
    SCHED.ticks()
}

/// Extension trait for PAC regs, adding atomic bitset/bitclear writes.
trait RegExt<T: Copy> {
    fn write_set<R>(&self, f: impl FnOnce(&mut T) -> R) -> R;
    fn write_clear<R>(&self, f: impl FnOnce(&mut T) -> R) -> R;
    fn write_and_wait<R>(&self, f: impl FnOnce(&mut T) -> R) -> R
    where
        T: PartialEq;
}

impl<T: Default + Copy, A: pac::common::Write> RegExt<T> for pac::common::Reg<T, A> {
    fn write_set<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut val = Default::default();
        let res = f(&mut val);
        // Safety: the set alias sits at +0x2000 from every peripheral
        // register.
        unsafe {
            let ptr = (self.as_ptr() as *mut u8).add(0x2000) as *mut T;
            ptr.write_volatile(val);
        }
        res
    }

    fn write_clear<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut val = Default::default();
        let res = f(&mut val);
        // Safety: the clear alias sits at +0x3000.
        unsafe {
            let ptr = (self.as_ptr() as *mut u8).add(0x3000) as *mut T;
            ptr.write_volatile(val);
        }
        res
    }

    fn write_and_wait<R>(&self, f: impl FnOnce(&mut T) -> R) -> R
    where
        T: PartialEq,
    {
        let mut val = Default::default();
        let res = f(&mut val);
        unsafe {
            self.as_ptr().write_volatile(val);
            while self.as_ptr().read_volatile() != val {}
        }
        res
    }
}
