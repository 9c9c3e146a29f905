// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::executor::queue::RunQueue;
use crate::executor::steal::Injector;
use crate::loom::sync::atomic::{AtomicPtr, AtomicU8, Ordering};
use crate::reactor::Reactor;
use crate::task::{Header, TaskRef};
use core::fmt;
use core::ptr::{self, NonNull};
use std::io;

/// Scheduling state of a [`Processor`], driven by the machine currently
/// bound to it. Stored atomically because two transitions cross machines:
/// promotion of an `Idle` processor to `Spinning`, and the state a waker
/// leaves behind for a handed-over processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ProcState {
    /// Released by its machine; queued in the executor's idle list.
    Idle = 0,
    /// Executing tasks from `run_next` / the local queue.
    Running = 1,
    /// Searching for work: global queue, stealing, non-blocking reactor poll.
    Spinning = 2,
    /// Blocked until some spawn requests a spinner.
    WaitingSpinning = 3,
    /// Blocked inside the reactor; observable through the polling bitmask so
    /// other machines can kick it.
    Polling = 4,
    /// Found nothing; deciding where to block.
    NotFound = 5,
}

/// An execution context: the "P" of the machine/processor/task triad.
///
/// A processor owns a one-slot `run_next` hot queue, a bounded local run
/// queue, and a reactor. Exactly one machine executes on a processor at a
/// time; `run_next` is consumed before the local queue, and the reactor is
/// only ever polled by the bound machine.
pub(crate) struct Processor {
    pub(crate) id: usize,
    state: AtomicU8,
    /// One-slot overriding queue, consumed before `queue`. Keeps the task a
    /// completion just unblocked hot on-core. Atomically exchangeable, so
    /// thieves can take it as a last resort.
    run_next: AtomicPtr<Header>,
    pub(crate) queue: RunQueue,
    pub(crate) reactor: Reactor,
}

// === impl Processor ===

impl Processor {
    pub(crate) fn new(id: usize) -> io::Result<Self> {
        Ok(Self {
            id,
            state: AtomicU8::new(ProcState::Idle as u8),
            run_next: AtomicPtr::new(ptr::null_mut()),
            queue: RunQueue::new(),
            reactor: Reactor::new()?,
        })
    }

    pub(crate) fn state(&self) -> ProcState {
        match self.state.load(Ordering::Acquire) {
            0 => ProcState::Idle,
            1 => ProcState::Running,
            2 => ProcState::Spinning,
            3 => ProcState::WaitingSpinning,
            4 => ProcState::Polling,
            5 => ProcState::NotFound,
            state => unreachable!("invalid processor state {state}"),
        }
    }

    pub(crate) fn set_state(&self, state: ProcState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Atomically take the `run_next` slot.
    pub(crate) fn take_run_next(&self) -> Option<TaskRef> {
        let raw = self.run_next.swap(ptr::null_mut(), Ordering::AcqRel);
        // Safety: non-null slot values are references parked by `enqueue`,
        // and the swap makes this thread their unique adopter
        NonNull::new(raw).map(|ptr| unsafe { TaskRef::from_ptr(ptr) })
    }

    /// Place a task on this processor: into `run_next`, displacing any
    /// previous occupant into the local queue, spilling to the global queue
    /// when the local queue is full.
    pub(crate) fn enqueue(&self, task: TaskRef, injector: &Injector) {
        let raw = self.run_next.swap(task.into_ptr().as_ptr(), Ordering::AcqRel);
        let Some(displaced) = NonNull::new(raw) else {
            return;
        };
        // Safety: same unique-adoption argument as `take_run_next`
        let displaced = unsafe { TaskRef::from_ptr(displaced) };
        if let Err(overflow) = self.queue.push_back(displaced) {
            tracing::trace!(processor = self.id, "local queue full, spilling to global");
            injector.push(overflow);
        }
    }

    /// Push a batch of tasks onto the local queue, spilling overflow to the
    /// global queue.
    pub(crate) fn enqueue_batch(
        &self,
        tasks: impl Iterator<Item = TaskRef>,
        injector: &Injector,
    ) {
        for task in tasks {
            if let Err(overflow) = self.queue.push_back(task) {
                injector.push(overflow);
            }
        }
    }

    pub(crate) fn has_local_work(&self) -> bool {
        !self.run_next.load(Ordering::Acquire).is_null() || !self.queue.is_empty()
    }

    /// The `Running` fast path: `run_next`, then the local queue, then a
    /// non-blocking reactor drain.
    ///
    /// May only be called by the machine currently bound to this processor.
    pub(crate) fn next_local_task(&self) -> Option<TaskRef> {
        if let Some(task) = self.take_run_next() {
            return Some(task);
        }

        // losing the pop race to a thief is not emptiness; retry until the
        // queue is drained for real
        while !self.queue.is_empty() {
            if let Some(task) = self.queue.pop_front() {
                return Some(task);
            }
        }

        if self.reactor.has_work() && self.reactor.poll(false) > 0 {
            // completions woke tasks into our run_next / local queue
            if let Some(task) = self.take_run_next() {
                return Some(task);
            }
            return self.queue.pop_front();
        }

        None
    }

    /// Drop everything still queued on this processor (shutdown path).
    pub(crate) fn drain(&self) {
        drop(self.take_run_next());
        while !self.queue.is_empty() {
            drop(self.queue.pop_front());
        }
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        self.drain();
    }
}

impl fmt::Debug for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Processor")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}
