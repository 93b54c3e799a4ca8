// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Index-linked task lists.
//!
//! Every task has one `next` link, kept in a [`Links`] array beside the task
//! table. A task is on at most one list at a time (the run queue, the sleep
//! queue, or one futex's waiters), so the lists can share it.
//!
//! The links and list heads are atomics only so they can sit in `static`s
//! and be shared between the different locks that guard different lists.
//! Every list operation must still happen under the lock for that list; the
//! atomics provide no synchronization of their own.

use portable_atomic::{AtomicUsize, Ordering};

use crate::task::Task;

const NIL: usize = usize::MAX;

fn decode(raw: usize) -> Option<Task> {
    (raw != NIL).then_some(Task(raw))
}

fn encode(task: Option<Task>) -> usize {
    task.map_or(NIL, |t| t.0)
}

/// The `next` links of every task slot.
pub(crate) struct Links<const N: usize>([AtomicUsize; N]);

impl<const N: usize> Links<N> {
    pub const fn new() -> Self {
        Self([const { AtomicUsize::new(NIL) }; N])
    }

    fn next(&self, task: Task) -> Option<Task> {
        decode(self.0[task.0].load(Ordering::Relaxed))
    }

    fn set_next(&self, task: Task, next: Option<Task>) {
        self.0[task.0].store(encode(next), Ordering::Relaxed);
    }
}

/// A LIFO list. Used for the run queue and for futex waiters.
pub(crate) struct TaskStack {
    head: AtomicUsize,
}

impl TaskStack {
    pub const fn new() -> Self {
        Self {
            head: AtomicUsize::new(NIL),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed) == NIL
    }

    pub fn push<const N: usize>(&self, links: &Links<N>, task: Task) {
        links.set_next(task, decode(self.head.load(Ordering::Relaxed)));
        self.head.store(task.0, Ordering::Relaxed);
    }

    pub fn pop<const N: usize>(&self, links: &Links<N>) -> Option<Task> {
        let task = decode(self.head.load(Ordering::Relaxed))?;
        self.head.store(encode(links.next(task)), Ordering::Relaxed);
        links.set_next(task, None);
        Some(task)
    }
}

/// Tasks waiting on a deadline, earliest first.
pub(crate) struct SleepQueue {
    head: Option<Task>,
}

impl SleepQueue {
    pub const fn new() -> Self {
        Self { head: None }
    }

    /// The task with the nearest deadline.
    pub fn peek(&self) -> Option<Task> {
        self.head
    }

    /// Links `task` in before the first task whose deadline is later than
    /// `deadline`, so tasks with equal deadlines wake in insertion order.
    /// `deadline_of` looks up the deadline of tasks already queued.
    ///
    /// Returns `true` if `task` became the new head.
    pub fn insert<const N: usize>(
        &mut self,
        links: &Links<N>,
        task: Task,
        deadline: u64,
        deadline_of: impl Fn(Task) -> u64,
    ) -> bool {
        let mut prev = None;
        let mut cursor = self.head;
        while let Some(t) = cursor {
            if deadline < deadline_of(t) {
                break;
            }
            prev = Some(t);
            cursor = links.next(t);
        }

        links.set_next(task, cursor);
        match prev {
            Some(p) => {
                links.set_next(p, Some(task));
                false
            }
            None => {
                self.head = Some(task);
                true
            }
        }
    }

    pub fn pop<const N: usize>(&mut self, links: &Links<N>) -> Option<Task> {
        let task = self.head?;
        self.head = links.next(task);
        links.set_next(task, None);
        Some(task)
    }
}
