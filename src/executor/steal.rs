// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::executor::queue::StealBatch;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::task::TaskRef;
use core::fmt;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// The global run queue.
///
/// Tasks land here when they are spawned from off-runtime threads, when they
/// explicitly yield, and when a processor's local queue overflows. Spinning
/// processors drain it in fair batches: `ceil(len / num_processors) + 1`
/// tasks at a time, so a burst of global work spreads over all processors
/// instead of being swallowed by whoever looks first.
///
/// Plain FIFO under a mutex; the separate length counter lets the hot
/// scheduling paths probe for emptiness without taking the lock.
pub(crate) struct Injector {
    queue: Mutex<VecDeque<TaskRef>>,
    len: AtomicUsize,
}

// === impl Injector ===

impl Injector {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            len: AtomicUsize::new(0),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn push(&self, task: TaskRef) {
        let mut queue = self.queue.lock();
        queue.push_back(task);
        self.len.store(queue.len(), Ordering::Release);
    }

    /// Take a fair share of the global queue, at most `max` tasks.
    pub(crate) fn pop_batch(&self, num_processors: usize, max: usize) -> StealBatch {
        let mut batch = StealBatch::new();
        if self.is_empty() {
            return batch;
        }

        let mut queue = self.queue.lock();
        let share = (queue.len() / num_processors + 1)
            .min(queue.len())
            .min(max)
            .min(batch.capacity());
        for _ in 0..share {
            // share <= queue.len() while we hold the lock
            batch.push(queue.pop_front().expect("inconsistent injector length"));
        }
        self.len.store(queue.len(), Ordering::Release);
        batch
    }
}

impl fmt::Debug for Injector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Injector").field("len", &self.len()).finish()
    }
}
