// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Context switching for Cortex-M in Thumb mode.
//!
//! Only instructions available on ARMv6-M are used, so this runs on M0/M0+
//! parts like the RP2040 as well as on larger cores. Floating point registers
//! are not saved; tasks on FPU-enabled targets must not keep live FP state
//! across a switch.
//!
//! A suspended context is just its stack pointer. The stack holds the
//! callee-saved registers and the resume address, in this order from the
//! lowest address up:
//!
//! ```text
//! sp -> r8 r9 r10 r11 r4 r5 r6 r7 pc
//! ```

use core::ptr::NonNull;

use super::{Arch, TaskStart};
use crate::STACK_ALIGN;

/// Saved stack pointer of a suspended context.
#[derive(Debug)]
#[repr(transparent)]
pub struct StackPointer(*mut u32);

// Safety: a StackPointer is only dereferenced by the context switch, under
// the scheduler lock, and the memory it points to belongs to exactly one
// suspended task.
unsafe impl Send for StackPointer {}

/// Cortex-M Thumb context switching.
pub struct CortexM;

/// Number of words in a saved frame.
const FRAME_WORDS: usize = 9;

extern "C" {
    fn cosched_switch(from: *mut StackPointer, to: *mut u32);
    fn cosched_task_entry();
}

impl Arch for CortexM {
    type Context = StackPointer;

    const EMPTY: StackPointer = StackPointer(core::ptr::null_mut());

    unsafe fn prepare(
        stack: NonNull<u8>,
        len: usize,
        start: TaskStart,
        args: [usize; 3],
    ) -> StackPointer {
        let top = (stack.as_ptr() as usize + len) & !(STACK_ALIGN - 1);
        let frame = (top - FRAME_WORDS * 4) as *mut u32;

        // The high registers are junk on first entry. r4-r7 carry the
        // arguments and start address to `cosched_task_entry`.
        let words: [u32; FRAME_WORDS] = [
            0,
            0,
            0,
            0,
            args[0] as u32,
            args[1] as u32,
            args[2] as u32,
            start as usize as u32,
            cosched_task_entry as usize as u32,
        ];
        for (i, word) in words.into_iter().enumerate() {
            // Safety: the frame lies within the caller's stack region, which
            // is large enough per our contract.
            unsafe { frame.add(i).write(word) }
        }
        StackPointer(frame)
    }

    unsafe fn switch(from: *mut StackPointer, to: *const StackPointer) {
        // Safety: passed through from our caller.
        unsafe { cosched_switch(from, (*to).0) }
    }
}

// r0 = where to save the outgoing sp, r1 = incoming sp.
//
// ARMv6-M can only push and pop r0-r7 and lr/pc, so the high registers go
// through r4-r7.
core::arch::global_asm!(
    ".section .text.cosched_switch,\"ax\",%progbits",
    ".global cosched_switch",
    ".type cosched_switch,%function",
    ".thumb_func",
    "cosched_switch:",
    "push {{r4-r7, lr}}",
    "mov r4, r8",
    "mov r5, r9",
    "mov r6, r10",
    "mov r7, r11",
    "push {{r4-r7}}",
    "mov r2, sp",
    "str r2, [r0]",
    "mov sp, r1",
    "pop {{r4-r7}}",
    "mov r8, r4",
    "mov r9, r5",
    "mov r10, r6",
    "mov r11, r7",
    "pop {{r4-r7, pc}}",
    "",
    ".section .text.cosched_task_entry,\"ax\",%progbits",
    ".global cosched_task_entry",
    ".type cosched_task_entry,%function",
    ".thumb_func",
    "cosched_task_entry:",
    "mov r0, r4",
    "mov r1, r5",
    "mov r2, r6",
    "blx r7",
    // The start function never returns.
    "udf #0",
);
