// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use crate::task::{Header, TaskRef};
use arrayvec::ArrayVec;
use core::fmt;
use core::ptr::{self, NonNull};
use crossbeam_utils::CachePadded;

/// Capacity of a processor's local run queue. Must be a power of two.
pub(crate) const LOCAL_QUEUE_CAPACITY: usize = 256;

/// Upper bound on a single steal: half the victim's queue.
pub(crate) const MAX_STEAL_BATCH: usize = LOCAL_QUEUE_CAPACITY / 2;

pub(crate) type StealBatch = ArrayVec<TaskRef, MAX_STEAL_BATCH>;

/// A bounded ring deque of tasks: the owning processor is the sole producer
/// at the back, while *any* machine (the owner included) may consume from the
/// front, one task at a time or half the queue in one batch.
///
/// The implementation follows the Chase–Lev discipline: two monotonically
/// increasing 64-bit indices delimit the live slots `[top, bottom)`, the
/// owner publishes pushes with a release store of `bottom`, and consumers
/// commit with a single compare-and-swap on `top`. Because the owner never
/// takes from the back, `bottom` only ever grows, which rules out the ABA
/// shrink race of the classic deque and lets a batch steal commit with the
/// same one CAS as a single pop.
///
/// Slot values are raw [`Header`] pointers: a stored task's reference is
/// owned by the queue and is re-materialized as a [`TaskRef`] only by the
/// consumer whose CAS on `top` succeeded.
pub(crate) struct RunQueue {
    /// Next slot to consume. Any thread; advanced by CAS.
    top: CachePadded<AtomicU64>,
    /// Next slot to fill. Written only by the owning processor's machine.
    bottom: CachePadded<AtomicU64>,
    slots: Box<[AtomicPtr<Header>]>,
}

// === impl RunQueue ===

impl RunQueue {
    pub(crate) fn new() -> Self {
        let slots = (0..LOCAL_QUEUE_CAPACITY)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            top: CachePadded::new(AtomicU64::new(0)),
            bottom: CachePadded::new(AtomicU64::new(0)),
            slots,
        }
    }

    #[inline]
    fn mask(index: u64) -> usize {
        debug_assert!(LOCAL_QUEUE_CAPACITY.is_power_of_two());
        (index as usize) & (LOCAL_QUEUE_CAPACITY - 1)
    }

    pub(crate) fn len(&self) -> usize {
        let b = self.bottom.load(Ordering::Acquire);
        let t = self.top.load(Ordering::Acquire);
        b.saturating_sub(t) as usize
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push a task at the back of the queue.
    ///
    /// Returns the task back to the caller when the queue is full; the caller
    /// must route it elsewhere (the global queue).
    ///
    /// May only be called by the machine currently bound to the owning
    /// processor.
    pub(crate) fn push_back(&self, task: TaskRef) -> Result<(), TaskRef> {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);

        if b - t >= LOCAL_QUEUE_CAPACITY as u64 {
            return Err(task);
        }

        self.slots[Self::mask(b)].store(task.into_ptr().as_ptr(), Ordering::Relaxed);
        // publish the slot to consumers
        self.bottom.store(b + 1, Ordering::Release);
        Ok(())
    }

    /// Take one task from the front of the queue.
    ///
    /// Returns `None` when the queue is empty *or* when a concurrent consumer
    /// won the race; callers that must drain retry while `!is_empty()`.
    pub(crate) fn pop_front(&self) -> Option<TaskRef> {
        let t = self.top.load(Ordering::Acquire);
        let b = self.bottom.load(Ordering::Acquire);
        if t >= b {
            return None;
        }

        let raw = self.slots[Self::mask(t)].load(Ordering::Relaxed);
        self.top
            .compare_exchange(t, t + 1, Ordering::AcqRel, Ordering::Relaxed)
            .ok()?;

        // Safety: the CAS on `top` succeeded, so this consumer -- and no
        // other -- adopted the queue's reference in this slot. The slot
        // cannot have been overwritten before the CAS committed, since the
        // owner only reuses a slot after `top` has advanced past it.
        Some(unsafe { TaskRef::from_ptr(NonNull::new_unchecked(raw)) })
    }

    /// Steal roughly half the queue (`ceil(len / 2)`, capped at
    /// [`MAX_STEAL_BATCH`]) with a single CAS on `top`.
    ///
    /// Returns an empty batch when there is nothing to steal or a concurrent
    /// consumer won the race.
    pub(crate) fn pop_front_half(&self) -> StealBatch {
        let mut batch = StealBatch::new();

        let t = self.top.load(Ordering::Acquire);
        let b = self.bottom.load(Ordering::Acquire);
        if t >= b {
            return batch;
        }

        let n = (b - t).div_ceil(2).min(MAX_STEAL_BATCH as u64);

        // read the candidate slots before committing; on CAS failure the
        // values are discarded without ever becoming `TaskRef`s.
        let mut raw = ArrayVec::<*mut Header, MAX_STEAL_BATCH>::new();
        for i in 0..n {
            raw.push(self.slots[Self::mask(t + i)].load(Ordering::Relaxed));
        }

        if self
            .top
            .compare_exchange(t, t + n, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return batch;
        }

        for ptr in raw {
            // Safety: same argument as `pop_front`: the single successful CAS
            // over `[t, t + n)` makes this consumer the unique adopter of
            // every reference in the range.
            batch.push(unsafe { TaskRef::from_ptr(NonNull::new_unchecked(ptr)) });
        }
        batch
    }
}

impl Drop for RunQueue {
    fn drop(&mut self) {
        // drop whatever tasks are still queued (executor shutdown)
        while let Some(task) = self.pop_front() {
            drop(task);
        }
    }
}

impl fmt::Debug for RunQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunQueue").field("len", &self.len()).finish()
    }
}
