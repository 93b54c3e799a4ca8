//! The 64-bit microsecond timer, as the scheduler's clock.
//!
//! Sleeping uses alarm 0 with its interrupt enabled in the timer but never
//! taken: with SEVONPEND set, the pending interrupt raises an event, which
//! is what WFE is waiting for. SEVONPEND and the NVIC are per core, so every
//! core that can end up sleeping on the clock runs [`init_core`].

use cortex_m::peripheral::NVIC;
use cosched::Clock;
use pac::Interrupt;

use crate::{RegExt, Rp2040};

/// The alarm only compares the low 32 bits, so one sleep can cover at most
/// this many ticks. Longer sleeps return early and the caller goes again.
const MAX_ALARM_SPAN: u64 = (u32::MAX / 2) as u64;

pub(crate) fn init() {
    init_core();
    disarm();
}

/// Lets a pending alarm interrupt wake this core from WFE.
pub(crate) fn init_core() {
    // Safety: SEVONPEND is only ever set, from here, on the calling core's
    // own SCB.
    let mut cp = unsafe { cortex_m::Peripherals::steal() };
    cp.SCB.set_sevonpend();
}

impl Clock for Rp2040 {
    fn ticks(&self) -> u64 {
        // The raw registers don't latch, so re-read the high half until it
        // holds still across the low read.
        let timer = pac::TIMER;
        loop {
            let hi = timer.timerawh().read();
            let lo = timer.timerawl().read();
            if timer.timerawh().read() == hi {
                return (u64::from(hi) << 32) | u64::from(lo);
            }
        }
    }

    fn sleep_ticks(&self, duration: u64) {
        let timer = pac::TIMER;
        let start = self.ticks();
        let target = start + duration.min(MAX_ALARM_SPAN);

        // The other core may have left TIMER_IRQ_0 pending in our NVIC. A new
        // event only comes from a fresh pending edge, so clear it first.
        NVIC::unpend(Interrupt::TIMER_IRQ_0);
        timer.inte().write_set(|w| w.set_alarm(0, true));
        timer.alarm(0).write_value(target as u32);
        // If the alarm fired between arming and here, its pending bit has
        // already set the event flag and WFE falls straight through.
        if self.ticks() < target {
            cortex_m::asm::wfe();
        }
        disarm();
    }
}

fn disarm() {
    let timer = pac::TIMER;
    timer.armed().write(|w| w.set_armed(1));
    timer.inte().write_clear(|w| w.set_alarm(0, true));
    timer.intr().write(|w| w.set_alarm(0, true));
    NVIC::unpend(Interrupt::TIMER_IRQ_0);
}
