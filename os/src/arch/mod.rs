// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-architecture context switching.
//!
//! The scheduler never looks inside a saved context. It asks the [`Arch`] to
//! build one on a fresh stack, and to swap between two of them; everything
//! register-shaped stays behind this trait.

use core::ptr::NonNull;

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "arm", target_os = "none"))] {
        mod cortex_m;
        pub use self::cortex_m::{CortexM, StackPointer};
    }
}

/// Signature of the first function run on a new stack. It receives the three
/// words passed to [`Arch::prepare`] and must never return.
pub type TaskStart = extern "C" fn(usize, usize, usize) -> !;

/// A way of suspending one flow of control and resuming another.
pub trait Arch {
    /// Saved state of a suspended context. Only meaningful while the owning
    /// task is not running.
    type Context: Send;

    /// A context that has never been saved. Switching *from* an empty context
    /// is fine (it gets filled in); switching *to* one is not.
    const EMPTY: Self::Context;

    /// Builds a context that, when switched to, calls `start(args[0],
    /// args[1], args[2])` on the stack `stack..stack + len`.
    ///
    /// # Safety
    ///
    /// The stack region must be valid for writes, owned by the new context
    /// from here on, and at least [`MIN_STACK_SIZE`][crate::MIN_STACK_SIZE]
    /// bytes.
    unsafe fn prepare(
        stack: NonNull<u8>,
        len: usize,
        start: TaskStart,
        args: [usize; 3],
    ) -> Self::Context;

    /// Saves the running context into `from` and resumes `to`. Returns when
    /// someone switches back to `from`, possibly on a different core.
    ///
    /// # Safety
    ///
    /// `to` must hold a context produced by `prepare` or by an earlier
    /// `switch`, which nobody else is resuming. Both pointers must stay valid
    /// until this returns.
    unsafe fn switch(from: *mut Self::Context, to: *const Self::Context);
}
