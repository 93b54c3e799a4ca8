// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scheduler proper: task table, run and sleep queues, and the pause /
//! resume protocol.
//!
//! # The scheduler lock and context switches
//!
//! Everything in [`Queues`] is guarded by the scheduler spinlock. A task that
//! gives up its core does so from inside [`Scheduler::pause_locked`], with the
//! lock held, and the lock *stays* held across the context switch. The task
//! that gets switched in is, in turn, sitting inside its own `pause_locked`
//! with a guard that it will drop on the way out (or, for a brand new task,
//! in `task_start`, which adopts the lock). So the lock is only ever released
//! once the incoming task's context is fully in place, and no other core can
//! pick up the outgoing task before its registers are saved.
//!
//! # Lost wakeups
//!
//! A task that wants to block usually publishes the fact somewhere (e.g. on a
//! futex waiter list) *before* calling `pause`, and someone on another core
//! may call `resume` in between. To keep that wakeup from being lost, `resume`
//! on a task that is still running marks it [`RunState::Resuming`], and
//! `pause` returns immediately when it sees that.

use core::mem::{align_of, size_of};
use core::ptr::NonNull;

use crate::arch::Arch;
use crate::error::{fatal, Fatal, SpawnError};
use crate::percore::{PerCore, CORES};
use crate::platform::{LockId, Platform};
use crate::queue::{Links, SleepQueue, TaskStack};
use crate::spinlock::{SpinGuard, SpinLock};
use crate::task::{Queued, RunState, Slot, Task, TaskState};
use crate::{MIN_STACK_SIZE, STACK_ALIGN, STACK_CANARY};

/// Signature of a task body started with [`Scheduler::spawn`].
pub type TaskEntry = fn(usize);

/// Shared state behind the scheduler lock.
struct Queues<A: Arch, const N: usize> {
    tasks: [TaskState<A>; N],
    run: TaskStack,
    sleep: SleepQueue,
    /// Set while some core has released the lock to sleep on the clock.
    clock_owner: bool,
    current: PerCore<Option<Task>>,
}

type QueueGuard<'a, P, const N: usize> =
    SpinGuard<'a, Queues<<P as Platform>::Arch, N>, P>;

/// A cooperative scheduler for up to `N` tasks on up to [`CORES`] cores.
///
/// `N` counts every context the scheduler tracks: spawned tasks, plus one
/// for each core that enters the scheduler through
/// [`init_core`][Scheduler::init_core] or [`run_core`][Scheduler::run_core].
/// Slots are not reused when tasks exit.
///
/// This is normally put in a `static`, since tasks hold on to it for the
/// rest of time:
///
/// ```ignore
/// static SCHED: Scheduler<MyChip, 8> = Scheduler::new(MyChip);
/// ```
pub struct Scheduler<P: Platform, const N: usize> {
    platform: P,
    queues: SpinLock<Queues<P::Arch, N>>,
    futexes: SpinLock<()>,
    links: Links<N>,
}

impl<P: Platform, const N: usize> Scheduler<P, N> {
    /// Creates a scheduler with no tasks.
    pub const fn new(platform: P) -> Self {
        Self {
            platform,
            queues: SpinLock::new(
                LockId::Scheduler,
                Queues {
                    tasks: [const { TaskState::<P::Arch>::VACANT }; N],
                    run: TaskStack::new(),
                    sleep: SleepQueue::new(),
                    clock_owner: false,
                    current: PerCore([None; CORES]),
                },
            ),
            futexes: SpinLock::new(LockId::Futex, ()),
            links: Links::new(),
        }
    }

    /// The hardware this scheduler is driving.
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Current time, in the platform's ticks.
    pub fn ticks(&self) -> u64 {
        self.platform.ticks()
    }

    /// Creates a task that will call `entry(arg)` on a fresh stack of at
    /// least `stack_size` bytes.
    ///
    /// The task goes on the run queue; the caller keeps running. When `entry`
    /// returns, the task exits and its stack is not reclaimed.
    pub fn spawn(
        &'static self,
        entry: TaskEntry,
        arg: usize,
        stack_size: usize,
    ) -> Result<Task, SpawnError> {
        let (task, stack, len) = self.reserve(stack_size)?;
        // Safety: the stack came straight from the allocator.
        unsafe { self.start(task, stack, len, entry, arg) };
        Ok(task)
    }

    /// Like [`spawn`][Scheduler::spawn], but runs a closure. The closure is
    /// stored at the top of the new stack, on top of the `stack_size` bytes
    /// requested.
    pub fn spawn_fn<F>(&'static self, body: F, stack_size: usize) -> Result<Task, SpawnError>
    where
        F: FnOnce() + Send + 'static,
    {
        let align = align_of::<F>().max(STACK_ALIGN);
        let room = size_of::<F>() + align;
        let (task, stack, len) = self.reserve(stack_size.max(MIN_STACK_SIZE).saturating_add(room))?;

        let base = stack.as_ptr() as usize;
        let slot = (base + len - size_of::<F>()) & !(align - 1);
        // Safety: `slot` is aligned for F and lies within the top `room` bytes
        // of a stack nobody else has seen yet. The rest of the stack is below
        // it.
        unsafe {
            (slot as *mut F).write(body);
            self.start(task, stack, slot - base, call_closure::<F>, slot);
        }
        Ok(task)
    }

    /// Claims a task slot and a stack to go with it.
    fn reserve(&self, stack_size: usize) -> Result<(Task, NonNull<u8>, usize), SpawnError> {
        let size = stack_size
            .max(MIN_STACK_SIZE)
            .checked_next_multiple_of(STACK_ALIGN)
            .ok_or(SpawnError::OutOfMemory(stack_size))?;

        let task = self.claim_slot()?;
        match self.platform.allocate_stack(size) {
            Some(stack) => Ok((task, stack, size)),
            None => {
                self.queues.lock(&self.platform).tasks[task.0].slot = Slot::Vacant;
                warn!("no memory for a {} byte stack", size);
                Err(SpawnError::OutOfMemory(size))
            }
        }
    }

    fn claim_slot(&self) -> Result<Task, SpawnError> {
        let mut q = self.queues.lock(&self.platform);
        let index = q
            .tasks
            .iter()
            .position(|t| t.slot == Slot::Vacant)
            .ok_or(SpawnError::TooManyTasks)?;
        q.tasks[index].slot = Slot::Reserved;
        Ok(Task(index))
    }

    /// Sets up a reserved task on its stack and makes it runnable.
    ///
    /// # Safety
    ///
    /// `stack..stack + len` must be unused memory that the task will own from
    /// now on.
    unsafe fn start(
        &'static self,
        task: Task,
        stack: NonNull<u8>,
        len: usize,
        entry: TaskEntry,
        arg: usize,
    ) {
        let canary = stack.cast::<usize>();
        // Safety: the bottom word is part of the region we were given, and
        // the allocator aligned it.
        unsafe { canary.as_ptr().write_volatile(STACK_CANARY) };

        // Safety: as above, and the region is at least MIN_STACK_SIZE.
        let context = unsafe {
            P::Arch::prepare(
                stack,
                len,
                task_start::<P, N>,
                [self as *const Self as usize, entry as usize, arg],
            )
        };

        let mut q = self.queues.lock(&self.platform);
        let state = &mut q.tasks[task.0];
        state.context = context;
        state.canary = Some(canary);
        state.run_state = RunState::Paused;
        state.queued = Queued::Run;
        state.slot = Slot::Live;
        q.run.push(&self.links, task);
        drop(q);

        self.platform.send_event();
        debug!("spawned {} with {} byte stack", task, len);
    }

    /// Adopts the calling context as the current task on this core, so it can
    /// use blocking operations like any other task.
    ///
    /// Writes the stack canary at `stack_bottom`.
    ///
    /// # Safety
    ///
    /// `stack_bottom` must be the lowest word of the stack the caller is
    /// running on (or some other word nothing else uses). Call this once per
    /// core, before anything else on that core touches the scheduler.
    pub unsafe fn init_core(&self, stack_bottom: NonNull<usize>) -> Result<Task, SpawnError> {
        let task = self.claim_slot()?;
        // Safety: per our contract.
        unsafe { stack_bottom.as_ptr().write_volatile(STACK_CANARY) };

        let core = self.platform.cpuid();
        let mut q = self.queues.lock(&self.platform);
        let state = &mut q.tasks[task.0];
        state.run_state = RunState::Running;
        state.canary = Some(stack_bottom);
        state.slot = Slot::Live;
        q.current[core] = Some(task);
        debug!("core {} running as {}", core, task);
        Ok(task)
    }

    /// Turns the calling core over to the scheduler for good. This is what
    /// secondary cores run after bring-up.
    ///
    /// # Safety
    ///
    /// Same as [`init_core`][Scheduler::init_core].
    pub unsafe fn run_core(&self, stack_bottom: NonNull<usize>) -> ! {
        // Safety: passed through.
        if unsafe { self.init_core(stack_bottom) }.is_err() {
            fatal(Fatal::NoSlotForCore);
        }
        self.exit()
    }

    /// Returns the task running on this core.
    pub fn current(&self) -> Task {
        let q = self.queues.lock(&self.platform);
        self.current_locked(&q)
    }

    fn current_locked(&self, q: &Queues<P::Arch, N>) -> Task {
        q.current[self.platform.cpuid()].unwrap_or_else(|| fatal(Fatal::NoCurrentTask))
    }

    /// Snapshot of a task's run state.
    pub fn run_state(&self, task: Task) -> RunState {
        self.queues.lock(&self.platform).tasks[task.0].run_state
    }

    /// Suspends the current task until somebody calls
    /// [`resume`][Scheduler::resume] on it. If that already happened since
    /// the task last paused, returns immediately.
    ///
    /// Other tasks, including ones whose sleep has elapsed, run on this core
    /// in the meantime. If there is nothing to run the core idles in a
    /// low-power wait.
    ///
    /// # Panics
    ///
    /// Halts via [`fatal`] if called from an interrupt handler, or if the
    /// task's stack canary has been overwritten.
    pub fn pause(&self) {
        let (mut q, me) = self.lock_for_pause();
        self.pause_locked(&mut q, me);
    }

    /// Makes `task` runnable.
    ///
    /// If the task is paused it goes on the run queue and every core is
    /// signalled. If it is running (presumably on its way into `pause`) its
    /// next pause returns immediately. Resuming a task that is already
    /// runnable, asleep, waiting on a futex, or exited does nothing.
    ///
    /// This is safe to call from interrupt handlers.
    pub fn resume(&self, task: Task) {
        let q = self.queues.lock(&self.platform);
        if q.tasks[task.0].queued != Queued::No {
            return;
        }
        self.make_runnable(q, task);
    }

    fn make_runnable(&self, mut q: QueueGuard<'_, P, N>, task: Task) {
        let state = &mut q.tasks[task.0];
        if state.slot != Slot::Live {
            return;
        }
        let run_state = state.run_state;
        match run_state {
            RunState::Paused => {
                state.queued = Queued::Run;
                q.run.push(&self.links, task);
                drop(q);
                self.platform.send_event();
            }
            RunState::Running => state.set_run_state(RunState::Resuming),
            RunState::Resuming => (),
        }
    }

    /// Hands the current task to `enqueue` for linking into a futex waiter
    /// list, and marks it so that only [`wake_parked`][Self::wake_parked]
    /// makes it runnable again. The caller holds the futex lock, and calls
    /// [`pause`][Self::pause] once it has let go of it.
    ///
    /// Returns whether a resume was pending. It has been set aside so that it
    /// can't end the wait; the caller re-arms it afterwards.
    pub(crate) fn park(&self, enqueue: impl FnOnce(&Links<N>, Task)) -> bool {
        let (mut q, me) = self.lock_for_pause();
        let state = &mut q.tasks[me.0];
        let pending = state.run_state == RunState::Resuming;
        if pending {
            state.set_run_state(RunState::Running);
        }
        state.queued = Queued::Futex;
        enqueue(&self.links, me);
        pending
    }

    /// Makes runnable a task that was parked by [`park`][Self::park] and
    /// that the caller has just unlinked from its futex.
    pub(crate) fn wake_parked(&self, task: Task) {
        let mut q = self.queues.lock(&self.platform);
        debug_assert_eq!(q.tasks[task.0].queued, Queued::Futex);
        q.tasks[task.0].queued = Queued::No;
        self.make_runnable(q, task);
    }

    /// Suspends the current task until `ticks()` reaches `deadline`.
    ///
    /// Sleepers wake in deadline order. A task whose deadline has passed is
    /// picked after everything already on the run queue.
    pub fn sleep_until(&self, deadline: u64) {
        let (mut q, me) = self.lock_for_pause();

        let queues = &mut *q;
        // A resume meant for a later pause stays pending across the sleep.
        let pending = queues.tasks[me.0].run_state == RunState::Resuming;
        if pending {
            queues.tasks[me.0].set_run_state(RunState::Running);
        }
        queues.tasks[me.0].wake_data = deadline;
        queues.tasks[me.0].queued = Queued::Sleep;
        let tasks = &queues.tasks;
        let first = queues
            .sleep
            .insert(&self.links, me, deadline, |t| tasks[t.0].wake_data);
        if first {
            // Whoever is sleeping on the clock needs to look at the new
            // deadline.
            self.platform.send_event();
        }

        self.pause_locked(&mut q, me);

        if pending {
            q.tasks[me.0].set_run_state(RunState::Resuming);
        }
    }

    /// Suspends the current task for `duration` ticks. A duration of zero
    /// is the same as [`yield_now`][Scheduler::yield_now].
    pub fn sleep(&self, duration: u64) {
        self.sleep_until(self.ticks().saturating_add(duration));
    }

    /// Lets every task that is runnable right now go first, then continues.
    pub fn yield_now(&self) {
        self.sleep(0);
    }

    fn lock_for_pause(&self) -> (QueueGuard<'_, P, N>, Task) {
        if self.platform.in_interrupt() {
            fatal(Fatal::PauseInInterrupt);
        }
        let q = self.queues.lock(&self.platform);
        let me = self.current_locked(&q);
        if !q.tasks[me.0].canary_intact() {
            fatal(Fatal::StackOverflow);
        }
        (q, me)
    }

    /// The scheduler loop. Returns once `me` has been resumed, with the lock
    /// held.
    fn pause_locked(&self, q: &mut QueueGuard<'_, P, N>, me: Task) {
        let mut watched_clock = false;
        let next = loop {
            if q.tasks[me.0].run_state == RunState::Resuming {
                q.tasks[me.0].set_run_state(RunState::Running);
                break None;
            }

            if let Some(next) = q.run.pop(&self.links) {
                q.tasks[next.0].queued = Queued::No;
                break Some(next);
            }

            let now = self.platform.ticks();
            let nearest = q.sleep.peek().map(|t| (t, q.tasks[t.0].wake_data));
            match nearest {
                Some((next, deadline)) if deadline <= now => {
                    q.sleep.pop(&self.links);
                    q.tasks[next.0].queued = Queued::No;
                    break Some(next);
                }
                Some((_, deadline)) if !q.clock_owner => {
                    // Nothing to do until the deadline, and nobody else is
                    // watching the clock, so we will.
                    q.clock_owner = true;
                    trace!("core {} sleeping {} ticks", self.platform.cpuid(), deadline - now);
                    q.unlocked(|| self.platform.sleep_ticks(deadline - now));
                    q.clock_owner = false;
                    watched_clock = true;
                }
                _ => q.unlocked(|| self.platform.wait_for_events()),
            }
        };

        if watched_clock {
            // We're done watching the clock. Idle cores may need to take
            // over, and they're waiting for an event to tell them so. Going
            // round the loop again doesn't count: we'd just take it back.
            self.platform.send_event();
        }
        if let Some(next) = next {
            self.switch_to(q, me, next);
        }
    }

    fn switch_to(&self, q: &mut QueueGuard<'_, P, N>, me: Task, next: Task) {
        if next == me {
            return;
        }
        let core = self.platform.cpuid();
        q.current[core] = Some(next);
        q.tasks[me.0].set_run_state(RunState::Paused);

        let from: *mut <P::Arch as Arch>::Context = &mut q.tasks[me.0].context;
        let to: *const <P::Arch as Arch>::Context = &q.tasks[next.0].context;
        trace!("core {}: {} -> {}", core, me, next);
        // Safety: `next` is on no queue and not current anywhere, so its
        // context is ours to resume, and the task table never moves.
        unsafe { P::Arch::switch(from, to) };

        // We're back, maybe on another core, and the lock was handed to us.
        q.tasks[me.0].set_run_state(RunState::Running);
    }

    /// Retires the current task. Its slot and stack are never reused.
    fn exit(&self) -> ! {
        let mut q = self.queues.lock(&self.platform);
        let me = self.current_locked(&q);
        q.tasks[me.0].slot = Slot::Exited;
        debug!("{} exited", me);
        loop {
            self.pause_locked(&mut q, me);
        }
    }

    pub(crate) fn links(&self) -> &Links<N> {
        &self.links
    }

    pub(crate) fn futex_lock(&self) -> &SpinLock<()> {
        &self.futexes
    }
}

/// First code run by every spawned task.
extern "C" fn task_start<P: Platform, const N: usize>(sched: usize, entry: usize, arg: usize) -> ! {
    // Safety: `start` packed a `&'static Scheduler<P, N>` and a `TaskEntry`.
    let (sched, entry) = unsafe {
        (
            &*(sched as *const Scheduler<P, N>),
            core::mem::transmute::<usize, TaskEntry>(entry),
        )
    };

    {
        // Safety: the task that switched to us did so from `switch_to`, and
        // left the scheduler lock held. New tasks run with interrupts on.
        let mut q = unsafe { sched.queues.adopt(&sched.platform, true) };
        let me = sched.current_locked(&q);
        q.tasks[me.0].set_run_state(RunState::Running);
    }

    entry(arg);
    sched.exit()
}

fn call_closure<F: FnOnce()>(slot: usize) {
    // Safety: `spawn_fn` moved an F to `slot`, and this runs once.
    let body = unsafe { (slot as *mut F).read() };
    body()
}
