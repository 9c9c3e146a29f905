// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use bitflags::bitflags;
use core::fmt;
use core::task::{Context, Poll, Waker};
use crossbeam_utils::CachePadded;
use static_assertions::const_assert_eq;

/// An atomically registered [`Waker`].
///
/// This cell stores the [`Waker`] of a single task. One side registers its
/// waker through [`poll_wait`]; the other side calls [`wake`] when the
/// awaited event has fired. Registration and waking may race freely across
/// threads; the state word arbitrates so that a wake concurrent with a
/// registration is never lost.
///
/// This is the suspension primitive the reactor's completion cells are built
/// on; the strategy follows Tokio's `AtomicWaker`.
///
/// [`poll_wait`]: Self::poll_wait
/// [`wake`]: Self::wake
pub(crate) struct WaitCell {
    state: CachePadded<AtomicUsize>,
    waker: UnsafeCell<Option<Waker>>,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct State: usize {
        const WAITING = 0b000;
        const REGISTERING = 0b001;
        const WAKING = 0b010;
        const WOKEN = 0b100;
    }
}
// WAITING MUST be zero
const_assert_eq!(State::WAITING.bits(), 0);

// === impl WaitCell ===

impl WaitCell {
    pub(crate) fn new() -> Self {
        Self {
            state: CachePadded::new(AtomicUsize::new(State::WAITING.bits())),
            waker: UnsafeCell::new(None),
        }
    }

    /// Register the waker from `cx`, or complete immediately if the cell was
    /// woken since the last registration.
    ///
    /// Returns `Poll::Ready` when a wakeup was consumed; the caller re-checks
    /// its actual completion condition and calls `poll_wait` again if it
    /// still needs to wait.
    pub(crate) fn poll_wait(&self, cx: &mut Context<'_>) -> Poll<()> {
        match self.compare_exchange(State::WAITING, State::REGISTERING, Ordering::Acquire) {
            Err(actual) if actual.contains(State::WOKEN) => {
                // take the wakeup
                self.fetch_and(!State::WOKEN, Ordering::AcqRel);
                return Poll::Ready(());
            }
            // someone else is mid-wake; don't wait
            Err(actual) if actual.contains(State::WAKING) => {
                return Poll::Ready(());
            }
            Err(_) => {
                // another registration is in flight; yield and retry
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            Ok(_) => {}
        }

        // Safety: we hold the REGISTERING bit, nobody else touches the slot
        self.waker.with_mut(|waker| unsafe {
            let waker = &mut *waker;
            match waker {
                Some(old) if old.will_wake(cx.waker()) => {}
                _ => *waker = Some(cx.waker().clone()),
            }
        });

        if let Err(actual) =
            self.compare_exchange(State::REGISTERING, State::WAITING, Ordering::AcqRel)
        {
            // A wake arrived while we were registering; the waker (ours) may
            // or may not have been consumed. Reset the cell and report the
            // wakeup to the caller directly instead.
            tracing::trace!(state = ?actual, "was woken during registration");

            // Safety: the waker consumed the WOKEN|WAKING bits without
            // touching the slot because we held REGISTERING
            let waker = self.waker.with_mut(|waker| unsafe { (*waker).take() });
            drop(waker);

            self.fetch_and(State::empty(), Ordering::AcqRel);
            return Poll::Ready(());
        }

        Poll::Pending
    }

    /// Wake the [`Waker`] stored in this cell.
    ///
    /// Returns `true` if a registered waker was woken; a concurrent
    /// registration observes the wakeup through the state word instead.
    pub(crate) fn wake(&self) -> bool {
        // Set WAKING (we're touching the slot) and WOKEN (a wakeup is owed).
        let state = self.fetch_or(State::WAKING | State::WOKEN, Ordering::AcqRel);

        if !state.intersects(State::WAKING | State::REGISTERING) {
            // Safety: no registration in flight and we won the WAKING bit
            let waker = self.waker.with_mut(|waker| unsafe { (*waker).take() });

            // release the lock bit
            self.fetch_and(!State::WAKING, Ordering::AcqRel);

            if let Some(waker) = waker {
                waker.wake();
                return true;
            }
        }

        false
    }

    #[inline(always)]
    fn compare_exchange(&self, curr: State, new: State, success: Ordering) -> Result<State, State> {
        self.state
            .compare_exchange(curr.bits(), new.bits(), success, Ordering::Acquire)
            .map(State::from_bits_retain)
            .map_err(State::from_bits_retain)
    }

    #[inline(always)]
    fn fetch_and(&self, state: State, order: Ordering) -> State {
        State::from_bits_retain(self.state.fetch_and(state.bits(), order))
    }

    #[inline(always)]
    fn fetch_or(&self, state: State, order: Ordering) -> State {
        State::from_bits_retain(self.state.fetch_or(state.bits(), order))
    }
}

impl Default for WaitCell {
    fn default() -> Self {
        WaitCell::new()
    }
}

// Safety: `WaitCell` synchronizes all accesses through atomic operations
unsafe impl Send for WaitCell {}
// Safety: `WaitCell` synchronizes all accesses through atomic operations
unsafe impl Sync for WaitCell {}

impl fmt::Debug for WaitCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitCell")
            .field(
                "state",
                &State::from_bits_retain(self.state.load(Ordering::Acquire)),
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_before_wait_is_not_lost() {
        let cell = WaitCell::new();
        assert!(!cell.wake());

        let mut wait = tokio_test::task::spawn(());
        let ready = wait.enter(|cx, _| cell.poll_wait(cx));
        assert_eq!(ready, Poll::Ready(()));
    }

    #[test]
    fn wake_after_wait() {
        let cell = WaitCell::new();

        let mut wait = tokio_test::task::spawn(());
        assert!(wait.enter(|cx, _| cell.poll_wait(cx)).is_pending());

        assert!(cell.wake());
        assert!(wait.is_woken());

        // the wakeup is also stored, so the woken task's re-poll consumes it
        assert_eq!(wait.enter(|cx, _| cell.poll_wait(cx)), Poll::Ready(()));
        assert!(wait.enter(|cx, _| cell.poll_wait(cx)).is_pending());
    }
}
