//! Task stacks, carved off a static pool.

use core::cell::UnsafeCell;
use core::ptr::NonNull;

use cosched::portable_atomic::{AtomicUsize, Ordering};
use cosched::{StackAllocator, STACK_ALIGN};

use crate::{Rp2040, STACK_POOL_SIZE};

#[repr(C, align(8))]
struct Pool(UnsafeCell<[u8; STACK_POOL_SIZE]>);

// Safety: every byte is handed out at most once, below.
unsafe impl Sync for Pool {}

static POOL: Pool = Pool(UnsafeCell::new([0; STACK_POOL_SIZE]));

/// Bytes handed out so far.
static USED: AtomicUsize = AtomicUsize::new(0);

impl StackAllocator for Rp2040 {
    fn allocate_stack(&self, size: usize) -> Option<NonNull<u8>> {
        let size = size.checked_next_multiple_of(STACK_ALIGN)?;
        let offset = USED
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|&end| end <= STACK_POOL_SIZE)
            })
            .ok()?;
        NonNull::new(POOL.0.get().cast::<u8>().wrapping_add(offset))
    }
}
