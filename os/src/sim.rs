// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A pretend chip for running the scheduler under `cargo test`.
//!
//! Cores are OS threads, and so are task contexts: switching contexts hands a
//! baton from one parked thread to another, so exactly one thread per
//! simulated core is ever running scheduler code.
//!
//! The clock only moves when a core sleeps on it and every other core is idle
//! too, which makes deadlines exact. An event cuts a sleep short without
//! moving the clock, as it would on hardware.
//!
//! Per-core state (core number, interrupt mask, "in an interrupt") lives in
//! thread-locals and travels with the baton.

use std::alloc::Layout;
use std::cell::Cell;
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use portable_atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::arch::{Arch, TaskStart};
use crate::multicore::{Launch, Mailbox};
use crate::percore::{PerCore, CORES};
use crate::platform::{Clock, Cpu, HwSpinlocks, LockId, Platform, StackAllocator};
use crate::scheduler::Scheduler;
use crate::task::Task;
use crate::STACK_ALIGN;

thread_local! {
    static CORE: Cell<usize> = const { Cell::new(0) };
    static IRQ_ENABLED: Cell<bool> = const { Cell::new(true) };
    static IN_IRQ: Cell<bool> = const { Cell::new(false) };
}

/// Makes the calling thread act as `core`.
pub fn set_core(core: usize) {
    assert!(core < CORES);
    CORE.set(core);
}

/// Runs `body` as though from an interrupt handler.
pub fn interrupt<R>(body: impl FnOnce() -> R) -> R {
    IN_IRQ.set(true);
    let _exit = scopeguard::guard((), |()| IN_IRQ.set(false));
    body()
}

/// How long a clock sleeper waits for busy cores before giving up on them
/// and moving the clock anyway.
const CLOCK_GRACE: Duration = Duration::from_millis(200);

#[derive(Default)]
struct Latch {
    set: Mutex<bool>,
    cv: Condvar,
}

pub struct SimPlatform {
    clock: AtomicU64,
    locks: [AtomicBool; 3],
    events: PerCore<Latch>,
    stack_budget: AtomicUsize,
    halted: AtomicBool,
    cores: AtomicUsize,
    /// Cores in `wait_for_events` or `sleep_ticks`.
    idle: AtomicUsize,
    /// Cores in `sleep_ticks`.
    on_clock: AtomicUsize,
}

impl SimPlatform {
    /// Creates a platform, and resets the calling thread to be core 0 with
    /// interrupts on.
    pub fn new() -> Self {
        Self::with_stack_budget(usize::MAX)
    }

    /// Like `new`, but stack allocations fail once `bytes` are used up.
    pub fn with_stack_budget(bytes: usize) -> Self {
        CORE.set(0);
        IRQ_ENABLED.set(true);
        IN_IRQ.set(false);
        Self {
            clock: AtomicU64::new(0),
            locks: [const { AtomicBool::new(false) }; 3],
            events: PerCore(core::array::from_fn(|_| Latch::default())),
            stack_budget: AtomicUsize::new(bytes),
            halted: AtomicBool::new(false),
            cores: AtomicUsize::new(1),
            idle: AtomicUsize::new(0),
            on_clock: AtomicUsize::new(0),
        }
    }

    pub fn interrupts_enabled(&self) -> bool {
        IRQ_ENABLED.get()
    }

    pub fn is_claimed(&self, lock: LockId) -> bool {
        self.locks[lock.index()].load(Ordering::Acquire)
    }

    /// How many cores are sleeping on the clock right now.
    pub fn sleeping_on_clock(&self) -> usize {
        self.on_clock.load(Ordering::SeqCst)
    }

    fn park_if_halted(&self) {
        if self.halted.load(Ordering::SeqCst) {
            loop {
                std::thread::park();
            }
        }
    }

    /// Parks idle cores for good. Called when a test is over, so leftover
    /// core threads stop polling.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
        self.send_event();
    }
}

impl Cpu for SimPlatform {
    fn cpuid(&self) -> usize {
        CORE.get()
    }

    fn in_interrupt(&self) -> bool {
        IN_IRQ.get()
    }

    fn interrupts_disable(&self) -> bool {
        IRQ_ENABLED.replace(false)
    }

    unsafe fn interrupts_enable(&self) {
        IRQ_ENABLED.set(true);
    }

    fn wait_for_events(&self) {
        self.park_if_halted();
        let latch = &self.events[self.cpuid()];
        let mut set = latch.set.lock().unwrap();
        if !*set {
            self.idle.fetch_add(1, Ordering::SeqCst);
            // The timeout stands in for an interrupt nobody simulated.
            set = latch.cv.wait_timeout(set, Duration::from_millis(1)).unwrap().0;
            self.idle.fetch_sub(1, Ordering::SeqCst);
        }
        *set = false;
    }

    fn send_event(&self) {
        for latch in self.events.iter() {
            *latch.set.lock().unwrap() = true;
            latch.cv.notify_all();
        }
    }
}

impl Clock for SimPlatform {
    fn ticks(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    fn sleep_ticks(&self, duration: u64) {
        self.park_if_halted();
        let latch = &self.events[self.cpuid()];
        let mut set = latch.set.lock().unwrap();
        self.idle.fetch_add(1, Ordering::SeqCst);
        self.on_clock.fetch_add(1, Ordering::SeqCst);
        let _awake = scopeguard::guard((), |()| {
            self.on_clock.fetch_sub(1, Ordering::SeqCst);
            self.idle.fetch_sub(1, Ordering::SeqCst);
        });

        let give_up = Instant::now() + CLOCK_GRACE;
        loop {
            if *set {
                *set = false;
                return;
            }
            let all_idle =
                self.idle.load(Ordering::SeqCst) >= self.cores.load(Ordering::SeqCst);
            if all_idle || Instant::now() >= give_up {
                self.clock.fetch_add(duration, Ordering::SeqCst);
                return;
            }
            set = latch.cv.wait_timeout(set, Duration::from_micros(100)).unwrap().0;
        }
    }
}

impl HwSpinlocks for SimPlatform {
    fn try_claim(&self, lock: LockId) -> bool {
        self.locks[lock.index()]
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn release(&self, lock: LockId) {
        self.locks[lock.index()].store(false, Ordering::Release);
    }
}

impl StackAllocator for SimPlatform {
    fn allocate_stack(&self, size: usize) -> Option<NonNull<u8>> {
        self.stack_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(size))
            .ok()?;
        let layout = Layout::from_size_align(size, STACK_ALIGN).ok()?;
        // Safety: size is nonzero, the scheduler rounds it up to a minimum.
        NonNull::new(unsafe { std::alloc::alloc(layout) })
    }
}

impl Platform for SimPlatform {
    type Arch = HostArch;
}

/// Per-core state carried from the thread that gives up a core to the one
/// that takes it.
#[derive(Copy, Clone)]
struct Baton {
    core: usize,
    irq_enabled: bool,
}

impl Baton {
    fn take() -> Self {
        Self {
            core: CORE.get(),
            irq_enabled: IRQ_ENABLED.get(),
        }
    }

    fn install(self) {
        CORE.set(self.core);
        IRQ_ENABLED.set(self.irq_enabled);
        IN_IRQ.set(false);
    }
}

type Body = Box<dyn FnOnce() + Send>;

/// One task context, backed by a thread.
struct Fiber {
    baton: Mutex<Option<Baton>>,
    turn: Condvar,
    /// What to run on first entry. The thread is only created then.
    body: Mutex<Option<Body>>,
}

impl Fiber {
    fn new(body: Option<Body>) -> Arc<Self> {
        Arc::new(Self {
            baton: Mutex::new(None),
            turn: Condvar::new(),
            body: Mutex::new(body),
        })
    }

    fn hand_over(&self, baton: Baton) {
        if let Some(body) = self.body.lock().unwrap().take() {
            std::thread::Builder::new()
                .name("sim-task".into())
                .spawn(move || {
                    baton.install();
                    body()
                })
                .unwrap();
            return;
        }
        *self.baton.lock().unwrap() = Some(baton);
        self.turn.notify_one();
    }

    fn wait_turn(&self) {
        let mut slot = self.baton.lock().unwrap();
        loop {
            if let Some(baton) = slot.take() {
                baton.install();
                return;
            }
            slot = self.turn.wait(slot).unwrap();
        }
    }
}

pub struct HostContext(Option<Arc<Fiber>>);

/// Context switching between threads.
pub struct HostArch;

impl Arch for HostArch {
    type Context = HostContext;

    const EMPTY: HostContext = HostContext(None);

    unsafe fn prepare(
        _stack: NonNull<u8>,
        _len: usize,
        start: TaskStart,
        args: [usize; 3],
    ) -> HostContext {
        let body: Body = Box::new(move || start(args[0], args[1], args[2]));
        HostContext(Some(Fiber::new(Some(body))))
    }

    unsafe fn switch(from: *mut HostContext, to: *const HostContext) {
        // Contexts that were never prepared (a core's boot context) get a
        // fiber the first time they switch away.
        let me = unsafe { (*from).0.get_or_insert_with(|| Fiber::new(None)).clone() };
        let next = unsafe { (*to).0.clone() }.expect("switch to an empty context");
        next.hand_over(Baton::take());
        me.wait_turn();
    }
}

/// A booted scheduler, with the test thread as core 0's current task.
pub struct Rig<const N: usize> {
    pub sched: &'static Scheduler<SimPlatform, N>,
    pub main: Task,
    /// Stands in for the bottom word of the test thread's stack.
    pub canary: NonNull<usize>,
}

impl<const N: usize> Drop for Rig<N> {
    fn drop(&mut self) {
        self.sched.platform().halt();
    }
}

pub fn boot<const N: usize>(cores: usize) -> Rig<N> {
    boot_with(SimPlatform::new(), cores)
}

/// Starts a scheduler on `platform` with the calling thread as core 0 and a
/// fresh thread for each further core.
pub fn boot_with<const N: usize>(platform: SimPlatform, cores: usize) -> Rig<N> {
    assert!((1..=CORES).contains(&cores));
    platform.cores.store(cores, Ordering::SeqCst);
    let sched: &'static Scheduler<SimPlatform, N> = Box::leak(Box::new(Scheduler::new(platform)));

    let canary = NonNull::from(Box::leak(Box::new(0usize)));
    let main = unsafe { sched.init_core(canary) }.unwrap();

    for core in 1..cores {
        let bottom = Box::leak(Box::new(0usize)) as *mut usize as usize;
        std::thread::Builder::new()
            .name(format!("sim-core{core}"))
            .spawn(move || {
                set_core(core);
                unsafe { sched.run_core(NonNull::new(bottom as *mut usize).unwrap()) }
            })
            .unwrap();
    }

    Rig {
        sched,
        main,
        canary,
    }
}

/// The RP2040 boot ROM's side of the core launch handshake.
pub struct BootRom(Mutex<Rom>);

#[derive(Default)]
struct Rom {
    echoes: VecDeque<u32>,
    seq: usize,
    params: [u32; 3],
    launched: Option<Launch>,
    received: usize,
    corrupt_at: Option<usize>,
    broken: bool,
}

impl Rom {
    fn step(&mut self, word: u32) {
        self.seq = match (self.seq, word) {
            (s @ 0..=2, 0) => (s + 1).min(2),
            (2, 1) => 3,
            (3..=5, 0) => 1,
            (s @ 3..=5, w) => {
                self.params[s - 3] = w;
                s + 1
            }
            _ => 0,
        };
        if self.seq == 6 {
            self.launched = Some(Launch {
                vector_table: self.params[0],
                stack_top: self.params[1],
                entry: self.params[2],
            });
        }
    }
}

impl BootRom {
    pub fn new() -> Self {
        Self(Mutex::new(Rom::default()))
    }

    /// Garbles the echo of the `index`th word received.
    pub fn corrupt_echo(&self, index: usize) {
        self.0.lock().unwrap().corrupt_at = Some(index);
    }

    /// Leaves a stale word in the FIFO before the handshake starts.
    pub fn preload_echo(&self, word: u32) {
        self.0.lock().unwrap().echoes.push_back(word);
    }

    /// Makes every echo wrong.
    pub fn break_echo(&self) {
        self.0.lock().unwrap().broken = true;
    }

    pub fn launched(&self) -> Option<Launch> {
        self.0.lock().unwrap().launched
    }

    pub fn words_received(&self) -> usize {
        self.0.lock().unwrap().received
    }
}

impl Mailbox for BootRom {
    fn can_write(&self) -> bool {
        true
    }

    fn write(&self, word: u32) {
        let mut rom = self.0.lock().unwrap();
        let index = rom.received;
        rom.received += 1;
        if rom.launched.is_none() {
            rom.step(word);
        }
        let echo = if rom.broken || rom.corrupt_at == Some(index) {
            !word
        } else {
            word
        };
        rom.echoes.push_back(echo);
    }

    fn can_read(&self) -> bool {
        !self.0.lock().unwrap().echoes.is_empty()
    }

    fn read(&self) -> u32 {
        self.0.lock().unwrap().echoes.pop_front().unwrap_or(0)
    }
}
