// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use core::ops::{Index, IndexMut};

/// How many cores we're running with. This constant is changed by the
/// `multicore` feature.
pub const CORES: usize = if cfg!(feature = "multicore") { 2 } else { 1 };

/// Structure that allows us to work on a per-core basis, indexed by
/// [`Cpu::cpuid`][crate::Cpu::cpuid].
///
/// This is intended to be run on embedded devices, so no padding to prevent
/// false cache sharing is added.
#[derive(Debug, Clone, Copy)]
pub struct PerCore<T>(pub [T; CORES]);

impl<T> Index<usize> for PerCore<T> {
    type Output = T;

    fn index(&self, index: usize) -> &Self::Output {
        &self.0[index]
    }
}

impl<T> IndexMut<usize> for PerCore<T> {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.0[index]
    }
}

impl<T> PerCore<T> {
    /// Iterates over the elements of every core, in core order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.0.iter()
    }
}
