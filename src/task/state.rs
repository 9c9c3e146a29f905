// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::{fence, AtomicUsize, Ordering};
use core::fmt;

/// A task may be scheduled (placed on a run queue) at most once per wakeup:
/// the `WOKEN` bit is the permission to enqueue, it is minted by exactly one
/// waker transition and consumed by exactly one `start_poll`. Everything else
/// in this module exists to uphold that, plus the join handshake and the
/// reference count that decides when the task allocation may be freed.
///
/// Bit layout:
///
/// ```text
/// | refs (usize::BITS - 6 bits) | JW | JI | C | D | W | P |
/// ```
///
/// - `P` — `POLLING`: a machine is currently polling the future.
/// - `W` — `WOKEN`: the task has a pending wakeup; it is on (or headed for) a
///   run queue, or the polling machine will requeue it.
/// - `D` — `COMPLETED`: the future has run to completion (or was dropped after
///   cancellation); the stage holds the output or nothing.
/// - `C` — `CANCELLED`: cancellation was requested.
/// - `JI` — `JOIN_INTEREST`: a `JoinHandle` still exists.
/// - `JW` — `JOIN_WAKER`: the join waker slot holds a registered waker.
pub(super) struct State(AtomicUsize);

/// A point-in-time copy of a task's [`State`].
#[derive(Copy, Clone, Eq, PartialEq)]
pub(super) struct Snapshot(usize);

const POLLING: usize = 1 << 0;
const WOKEN: usize = 1 << 1;
const COMPLETED: usize = 1 << 2;
const CANCELLED: usize = 1 << 3;
const JOIN_INTEREST: usize = 1 << 4;
const JOIN_WAKER: usize = 1 << 5;

const REF_ONE: usize = 1 << 6;
const REF_MASK: usize = !(REF_ONE - 1);

/// What [`super::Task::poll`] should do after the state transition at the
/// start of a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum StartPollAction {
    /// Go ahead and poll the future.
    Poll,
    /// The task completed in the meantime, the queue entry is stale.
    DontPoll,
    /// The task was cancelled before it got polled; drop the future without
    /// polling it.
    Cancelled { wake_join_waker: bool },
}

/// What a waker should do after a `wake_by_val` transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum WakeByValAction {
    /// Enqueue the task; the waker's reference transfers to the queue.
    Enqueue,
    /// Nothing to schedule; release the waker's reference.
    Drop,
}

/// What a waker should do after a `wake_by_ref` transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum WakeByRefAction {
    /// Enqueue the task; the transition already minted a reference for the
    /// queue.
    Enqueue,
    /// Nothing to schedule.
    None,
}

// === impl State ===

impl State {
    /// One reference for the spawner, `JOIN_INTEREST` because every task is
    /// born with a [`super::JoinHandle`], and `WOKEN` because the spawner's
    /// reference doubles as the initial run queue entry: a wake that lands
    /// before the first poll must coalesce with it, not enqueue a second
    /// time.
    pub(super) fn new() -> Self {
        Self(AtomicUsize::new(REF_ONE | JOIN_INTEREST | WOKEN))
    }

    #[inline]
    pub(super) fn load(&self, order: Ordering) -> Snapshot {
        Snapshot(self.0.load(order))
    }

    /// Transition to `POLLING`, consuming the pending wakeup.
    pub(super) fn start_poll(&self) -> StartPollAction {
        let mut s = self.load(Ordering::Acquire);
        loop {
            if s.is_completed() {
                return StartPollAction::DontPoll;
            }

            if s.is_cancelled() {
                // the task never gets to run; complete it here so joiners and
                // wakers observe a terminal state.
                let new = (s.0 | COMPLETED) & !(WOKEN | POLLING);
                match self.compare_exchange(s, Snapshot(new)) {
                    Ok(_) => {
                        return StartPollAction::Cancelled {
                            wake_join_waker: s.has_join_waker() && s.has_join_interest(),
                        };
                    }
                    Err(actual) => {
                        s = actual;
                        continue;
                    }
                }
            }

            debug_assert!(
                !s.is_polling(),
                "a task may only be polled by one machine at a time ({s:?})"
            );
            let new = (s.0 | POLLING) & !WOKEN;
            match self.compare_exchange(s, Snapshot(new)) {
                Ok(_) => return StartPollAction::Poll,
                Err(actual) => s = actual,
            }
        }
    }

    /// Transition out of `POLLING`.
    ///
    /// `completed` is whether the future returned `Ready`.
    pub(super) fn end_poll(&self, completed: bool) -> super::PollResult {
        let mut s = self.load(Ordering::Acquire);
        loop {
            debug_assert!(s.is_polling(), "end_poll on a task that isn't polling ({s:?})");

            let (new, result) = if completed {
                // a future that ran to completion wins over a concurrent
                // cancellation request.
                let new = (s.0 | COMPLETED) & !(POLLING | WOKEN | CANCELLED);
                let result = if s.has_join_interest() && s.has_join_waker() {
                    super::PollResult::ReadyJoined
                } else {
                    super::PollResult::Ready
                };
                (new, result)
            } else if s.is_cancelled() || s.is_woken() {
                // keep WOKEN: the requeued reference owns the pending wakeup.
                ((s.0 & !POLLING) | WOKEN, super::PollResult::PendingSchedule)
            } else {
                (s.0 & !POLLING, super::PollResult::Pending)
            };

            match self.compare_exchange(s, Snapshot(new)) {
                Ok(_) => return result,
                Err(actual) => s = actual,
            }
        }
    }

    /// `wake` transition for a waker that owns a task reference.
    pub(super) fn wake_by_val(&self) -> WakeByValAction {
        let mut s = self.load(Ordering::Acquire);
        loop {
            if s.is_completed() || s.is_woken() {
                return WakeByValAction::Drop;
            }

            let new = Snapshot(s.0 | WOKEN);
            match self.compare_exchange(s, new) {
                Ok(_) if s.is_polling() => {
                    // the polling machine observes WOKEN in `end_poll` and
                    // requeues with its own reference.
                    return WakeByValAction::Drop;
                }
                Ok(_) => return WakeByValAction::Enqueue,
                Err(actual) => s = actual,
            }
        }
    }

    /// `wake` transition for a borrowed waker; mints a queue reference when it
    /// decides to enqueue.
    pub(super) fn wake_by_ref(&self) -> WakeByRefAction {
        let mut s = self.load(Ordering::Acquire);
        loop {
            if s.is_completed() || s.is_woken() {
                return WakeByRefAction::None;
            }

            if s.is_polling() {
                match self.compare_exchange(s, Snapshot(s.0 | WOKEN)) {
                    Ok(_) => return WakeByRefAction::None,
                    Err(actual) => {
                        s = actual;
                        continue;
                    }
                }
            }

            let new = Snapshot((s.0 | WOKEN).checked_add(REF_ONE).expect("task ref overflow"));
            match self.compare_exchange(s, new) {
                Ok(_) => return WakeByRefAction::Enqueue,
                Err(actual) => s = actual,
            }
        }
    }

    /// Request cancellation. Returns `true` if this call set the bit.
    pub(super) fn cancel(&self) -> bool {
        let mut s = self.load(Ordering::Acquire);
        loop {
            if s.is_completed() || s.is_cancelled() {
                return false;
            }
            match self.compare_exchange(s, Snapshot(s.0 | CANCELLED)) {
                Ok(_) => return true,
                Err(actual) => s = actual,
            }
        }
    }

    /// Clear `JOIN_WAKER` to gain exclusive access to the join waker slot.
    ///
    /// Fails (returning the observed snapshot) once the task has completed,
    /// since from then on slot ownership is fixed.
    pub(super) fn try_clear_join_waker(&self) -> Result<(), Snapshot> {
        self.join_waker_cas(|bits| bits & !JOIN_WAKER)
    }

    /// Publish a registered join waker by setting `JOIN_WAKER`.
    ///
    /// Fails once the task has completed; the caller must then take the
    /// output itself because the completing machine saw no registered waker.
    pub(super) fn try_set_join_waker(&self) -> Result<(), Snapshot> {
        self.join_waker_cas(|bits| bits | JOIN_WAKER)
    }

    fn join_waker_cas(&self, apply: impl Fn(usize) -> usize) -> Result<(), Snapshot> {
        let mut s = self.load(Ordering::Acquire);
        loop {
            if s.is_completed() {
                return Err(s);
            }
            match self.compare_exchange(s, Snapshot(apply(s.0))) {
                Ok(_) => return Ok(()),
                Err(actual) => s = actual,
            }
        }
    }

    /// The `JoinHandle` was dropped; the task is now detached.
    pub(super) fn drop_join_interest(&self) {
        self.0.fetch_and(!JOIN_INTEREST, Ordering::AcqRel);
    }

    pub(super) fn clone_ref(&self) {
        let old = self.0.fetch_add(REF_ONE, Ordering::Relaxed);
        assert!(old & REF_MASK != REF_MASK, "task ref overflow");
    }

    /// Release one reference. Returns `true` when the caller dropped the last
    /// reference and must deallocate the task.
    pub(super) fn drop_ref(&self) -> bool {
        let old = Snapshot(self.0.fetch_sub(REF_ONE, Ordering::Release));
        debug_assert!(old.ref_count() >= 1, "task ref underflow");
        if old.ref_count() == 1 {
            fence(Ordering::Acquire);
            true
        } else {
            false
        }
    }

    #[inline]
    fn compare_exchange(&self, current: Snapshot, new: Snapshot) -> Result<Snapshot, Snapshot> {
        self.0
            .compare_exchange(current.0, new.0, Ordering::AcqRel, Ordering::Acquire)
            .map(Snapshot)
            .map_err(Snapshot)
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load(Ordering::Relaxed).fmt(f)
    }
}

// === impl Snapshot ===

impl Snapshot {
    #[inline]
    pub(super) fn is_polling(self) -> bool {
        self.0 & POLLING != 0
    }
    #[inline]
    pub(super) fn is_woken(self) -> bool {
        self.0 & WOKEN != 0
    }
    #[inline]
    pub(super) fn is_completed(self) -> bool {
        self.0 & COMPLETED != 0
    }
    #[inline]
    pub(super) fn is_cancelled(self) -> bool {
        self.0 & CANCELLED != 0
    }
    #[inline]
    pub(super) fn has_join_interest(self) -> bool {
        self.0 & JOIN_INTEREST != 0
    }
    #[inline]
    pub(super) fn has_join_waker(self) -> bool {
        self.0 & JOIN_WAKER != 0
    }
    #[inline]
    pub(super) fn ref_count(self) -> usize {
        (self.0 & REF_MASK) >> REF_ONE.trailing_zeros()
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("polling", &self.is_polling())
            .field("woken", &self.is_woken())
            .field("completed", &self.is_completed())
            .field("cancelled", &self.is_cancelled())
            .field("join_interest", &self.has_join_interest())
            .field("join_waker", &self.has_join_waker())
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state() {
        let state = State::new();
        let s = state.load(Ordering::Relaxed);
        assert_eq!(s.ref_count(), 1);
        assert!(s.has_join_interest());
        assert!(!s.is_polling());
        // born woken: the spawner's reference is the initial queue entry
        assert!(s.is_woken());
    }

    #[test]
    fn wake_is_consumed_exactly_once() {
        let state = State::new();

        // wakes before the first poll coalesce with the initial enqueue
        assert_eq!(state.wake_by_val(), WakeByValAction::Drop);
        assert_eq!(state.wake_by_ref(), WakeByRefAction::None);

        // polling consumes the wakeup, making the next wake enqueue again
        assert_eq!(state.start_poll(), StartPollAction::Poll);
        assert_eq!(state.end_poll(false), crate::task::PollResult::Pending);
        assert_eq!(state.wake_by_val(), WakeByValAction::Enqueue);
        assert_eq!(state.wake_by_val(), WakeByValAction::Drop);
    }

    #[test]
    fn wake_during_poll_reschedules() {
        let state = State::new();
        assert_eq!(state.start_poll(), StartPollAction::Poll);
        // a wake that lands mid-poll is deferred to the polling machine
        assert_eq!(state.wake_by_val(), WakeByValAction::Drop);
        assert_eq!(state.end_poll(false), crate::task::PollResult::PendingSchedule);
    }

    #[test]
    fn wake_by_ref_mints_a_reference() {
        let state = State::new();
        assert_eq!(state.wake_by_ref(), WakeByRefAction::Enqueue);
        assert_eq!(state.load(Ordering::Relaxed).ref_count(), 2);
    }

    #[test]
    fn cancel_before_poll() {
        let state = State::new();
        assert!(state.cancel());
        assert!(!state.cancel());
        assert_eq!(
            state.start_poll(),
            StartPollAction::Cancelled {
                wake_join_waker: false
            }
        );
        assert!(state.load(Ordering::Relaxed).is_completed());
    }

    #[test]
    fn completion_beats_cancellation() {
        let state = State::new();
        assert_eq!(state.start_poll(), StartPollAction::Poll);
        assert!(state.cancel());
        assert_eq!(state.end_poll(true), crate::task::PollResult::Ready);
        let s = state.load(Ordering::Relaxed);
        assert!(s.is_completed());
        assert!(!s.is_cancelled());
    }
}
