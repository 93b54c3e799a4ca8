// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Starting a secondary core through an inter-core mailbox.
//!
//! Out of reset, the RP2040's second core sits in the boot ROM reading words
//! from the SIO FIFO and echoing each one back. Feeding it the sequence
//!
//! ```text
//! 0, 0, 1, vector table, stack pointer, entry point
//! ```
//!
//! with every word echoed correctly makes it install the vector table and
//! stack pointer and jump to the entry point. A wrong echo means the other
//! side lost track (it may still have been booting, or it saw a stale word),
//! so the sequence starts over. The zeros resynchronize it.

use crate::error::LaunchError;
use crate::platform::Cpu;

/// Restarts of the launch sequence we put up with before deciding the other
/// core is not listening.
pub const MAX_LAUNCH_RETRIES: u32 = 16;

/// One direction of a hardware FIFO pair between two cores.
pub trait Mailbox {
    /// Checks whether there is room to write a word.
    fn can_write(&self) -> bool;
    /// Writes a word. Only call when [`Mailbox::can_write`] is `true`.
    fn write(&self, word: u32);
    /// Checks whether a word is waiting to be read.
    fn can_read(&self) -> bool;
    /// Reads a word. Only call when [`Mailbox::can_read`] is `true`.
    fn read(&self) -> u32;
}

/// Pushes a word into the mailbox, spinning until there's space, and wakes
/// the other core in case it's waiting for events.
pub fn fifo_write(mailbox: &impl Mailbox, cpu: &impl Cpu, word: u32) {
    while !mailbox.can_write() {
        core::hint::spin_loop();
    }
    mailbox.write(word);
    cpu.send_event();
}

/// Pops a word from the mailbox, idling until one shows up.
pub fn fifo_read(mailbox: &impl Mailbox, cpu: &impl Cpu) -> u32 {
    while !mailbox.can_read() {
        cpu.wait_for_events();
    }
    mailbox.read()
}

/// Throws away everything waiting in the mailbox.
pub fn fifo_drain(mailbox: &impl Mailbox) {
    while mailbox.can_read() {
        let _ = mailbox.read();
    }
}

/// Where a freshly launched core should start.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Launch {
    /// Address of the vector table the core should install.
    pub vector_table: u32,
    /// Initial stack pointer.
    pub stack_top: u32,
    /// Address of the entry function.
    pub entry: u32,
}

impl Launch {
    /// The words to send, in order.
    pub fn sequence(&self) -> [u32; 6] {
        [0, 0, 1, self.vector_table, self.stack_top, self.entry]
    }
}

/// Runs the launch handshake against whatever is on the other end of
/// `mailbox`.
///
/// Returns once every word of the sequence has been echoed back in order, at
/// which point the other core is running `params.entry`.
pub fn launch(
    mailbox: &impl Mailbox,
    cpu: &impl Cpu,
    params: &Launch,
) -> Result<(), LaunchError> {
    let sequence = params.sequence();
    let mut fails = 0;
    let mut seq = 0;
    while seq < sequence.len() {
        let word = sequence[seq];
        if word == 0 {
            // Don't let a stale echo from an earlier attempt confuse us, and
            // kick the other core in case it's in WFE.
            fifo_drain(mailbox);
            cpu.send_event();
        }
        fifo_write(mailbox, cpu, word);

        let echo = fifo_read(mailbox, cpu);
        if echo == word {
            seq += 1;
        } else {
            fails += 1;
            warn!("launch: sent {} but got {} back, restarting", word, echo);
            if fails > MAX_LAUNCH_RETRIES {
                error!("launch: other core not responding");
                return Err(LaunchError::NotResponding(fails));
            }
            seq = 0;
        }
    }
    debug!("launch: core started at {}", params.entry);
    Ok(())
}
