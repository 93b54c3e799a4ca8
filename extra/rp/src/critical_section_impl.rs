//! `critical-section` on top of the atomics spinlock.
//!
//! Without CAS, `portable-atomic` emulates read-modify-write atomics inside a
//! critical section, so this has to exclude the other core as well as local
//! interrupts. It nests: a core that already holds the lock just notes that
//! in the restore state.

use cosched::portable_atomic::{AtomicU8, Ordering};
use cosched::{Cpu, LockId, SpinLock};

use crate::Rp2040;

static ATOMIC_LOCK: SpinLock<()> = SpinLock::new(LockId::Atomic, ());

/// Core id plus one of whoever holds `ATOMIC_LOCK`, or zero. Loads and stores
/// only: RMW here would recurse into ourselves.
static OWNER: AtomicU8 = AtomicU8::new(0);

/// Restore state for a nested acquire.
const NESTED: u8 = 0;
/// Restore state for an outer acquire that found interrupts masked.
const IRQ_OFF: u8 = 1;
/// Restore state for an outer acquire that found interrupts enabled.
const IRQ_ON: u8 = 2;

struct RpCriticalSection;
critical_section::set_impl!(RpCriticalSection);

unsafe impl critical_section::Impl for RpCriticalSection {
    unsafe fn acquire() -> critical_section::RawRestoreState {
        let me = Rp2040.cpuid() as u8 + 1;
        // Only this core can store its own id, and it does so with
        // interrupts masked, so seeing it here means we're nested.
        if OWNER.load(Ordering::Acquire) == me {
            return NESTED;
        }
        let irq_was_enabled = ATOMIC_LOCK.lock(&Rp2040).leak();
        OWNER.store(me, Ordering::Release);
        if irq_was_enabled {
            IRQ_ON
        } else {
            IRQ_OFF
        }
    }

    unsafe fn release(state: critical_section::RawRestoreState) {
        if state == NESTED {
            return;
        }
        OWNER.store(0, Ordering::Release);
        // Safety: the matching `acquire` leaked the guard for us.
        drop(unsafe { ATOMIC_LOCK.adopt(&Rp2040, state == IRQ_ON) });
    }
}
