//! Bringing up the second core.
//!
//! Core 1 gets a fixed boot stack, enters the scheduler, and from then on
//! behaves exactly like core 0: it runs whatever task is ready, or idles.

use core::ptr::{addr_of_mut, NonNull};
use core::sync::atomic::{compiler_fence, Ordering};

use cosched::multicore::{launch, Launch, Mailbox};
use cosched::LaunchError;

use crate::{timer, Rp2040, SCHED};

/// Size of core 1's idle stack. It only ever runs the scheduler loop.
pub const CORE1_STACK_SIZE: usize = 1024;

/// The SIO FIFO pair as seen from core 0.
struct SioFifo;

impl Mailbox for SioFifo {
    fn can_write(&self) -> bool {
        pac::SIO.fifo().st().read().rdy()
    }

    fn write(&self, word: u32) {
        pac::SIO.fifo().wr().write_value(word);
    }

    fn can_read(&self) -> bool {
        pac::SIO.fifo().st().read().vld()
    }

    fn read(&self) -> u32 {
        pac::SIO.fifo().rd().read()
    }
}

/// Data type for a properly aligned stack of N bytes
#[repr(C, align(32))]
struct Stack<const SIZE: usize> {
    mem: [u8; SIZE],
}

static mut CORE1_STACK: Stack<CORE1_STACK_SIZE> = Stack {
    mem: [0; CORE1_STACK_SIZE],
};

/// Resets core 1 and starts the scheduler on it.
///
/// Call once, from core 0, before core 0 enters the scheduler.
pub fn spawn_core1() -> Result<(), LaunchError> {
    // Reset the core
    let psm = pac::PSM;
    psm.frce_off().modify(|w| w.set_proc1(true));
    while !psm.frce_off().read().proc1() {
        cortex_m::asm::nop();
    }
    psm.frce_off().modify(|w| w.set_proc1(false));

    // Safety: core 1 is held in reset, so nothing is using its stack.
    let stack_top = unsafe { addr_of_mut!(CORE1_STACK.mem).cast::<u8>().add(CORE1_STACK_SIZE) };

    // Safety: reading VTOR has no side effects.
    let vector_table = unsafe { cortex_m::Peripherals::steal().SCB.vtor.read() };

    let params = Launch {
        vector_table,
        stack_top: stack_top as u32,
        entry: core1_entry as usize as u32,
    };

    // Make sure the scheduler's statics are written out before core 1 can
    // start reading them.
    compiler_fence(Ordering::Release);

    launch(&SioFifo, &Rp2040, &params)
}

extern "C" fn core1_entry() -> ! {
    timer::init_core();

    // Safety: the bottom of the stack we're running on, which belongs to
    // core 1 alone.
    unsafe {
        let bottom = NonNull::new_unchecked(addr_of_mut!(CORE1_STACK.mem).cast::<usize>());
        SCHED.run_core(bottom)
    }
}
