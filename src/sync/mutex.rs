// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::{Cell, UnsafeCell};
use core::future::Future;
use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use std::collections::VecDeque;
use std::sync::Arc;

/// A cooperative mutual-exclusion lock for tasks.
///
/// Contended acquisitions park the task in a strictly FIFO queue; an unlock
/// hands ownership directly to the head waiter (the lock never becomes
/// observably free in between), so acquisition order is exactly arrival
/// order.
///
/// Two acquisition flavors mirror the two release styles:
///
/// - [`guard`](Self::guard) resolves to a [`MutexGuard`] that unlocks when
///   dropped.
/// - [`lock`](Self::lock) resolves to an *inert* guard; the caller must pair
///   it with an explicit [`unlock`](Self::unlock).
///
/// Recursive locking deadlocks the task. This mutex protects critical
/// sections, not data; pair it with whatever state it guards.
pub struct Mutex {
    inner: parking_lot::Mutex<Inner>,
}

struct Inner {
    locked: bool,
    waiters: VecDeque<Arc<Waiter>>,
}

/// All fields are guarded by the owning mutex's internal lock.
struct Waiter {
    state: Cell<WaiterState>,
    waker: UnsafeCell<Option<Waker>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaiterState {
    Waiting,
    /// Ownership was transferred to this waiter by an unlock.
    Granted,
    Cancelled,
}

// Safety: all fields are accessed under the owning mutex's internal lock.
unsafe impl Send for Waiter {}
// Safety: see above
unsafe impl Sync for Waiter {}

// === impl Mutex ===

impl Mutex {
    pub fn new() -> Self {
        Self {
            inner: parking_lot::Mutex::new(Inner {
                locked: false,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Acquire the lock, resolving to an inert guard; release with
    /// [`Self::unlock`].
    pub fn lock(&self) -> Lock<'_> {
        Lock {
            mutex: self,
            guarded: false,
            waiter: None,
        }
    }

    /// Acquire the lock, resolving to a [`MutexGuard`] that releases on
    /// drop.
    pub fn guard(&self) -> Lock<'_> {
        Lock {
            mutex: self,
            guarded: true,
            waiter: None,
        }
    }

    /// Release the lock, waking the head waiter if any.
    ///
    /// # Panics
    ///
    /// Panics when the mutex is not locked; unlocking a lock the caller does
    /// not hold is a programming error.
    pub fn unlock(&self) {
        let waker = {
            let mut inner = self.inner.lock();
            assert!(inner.locked, "unlock of an unlocked Mutex");
            Self::unlock_inner(&mut inner)
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Hand the lock to the head waiter, or release it. Caller holds the
    /// internal lock and wakes the returned waker after releasing it.
    fn unlock_inner(inner: &mut Inner) -> Option<Waker> {
        if let Some(waiter) = inner.waiters.pop_front() {
            // ownership transfers: `locked` stays true
            waiter.state.set(WaiterState::Granted);
            // Safety: internal lock held
            unsafe { (*waiter.waker.get()).take() }
        } else {
            inner.locked = false;
            None
        }
    }

    /// `true` while some task holds the lock.
    pub fn is_locked(&self) -> bool {
        self.inner.lock().locked
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Mutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Mutex")
            .field("locked", &inner.locked)
            .field("waiters", &inner.waiters.len())
            .finish()
    }
}

// === impl Lock ===

/// Future returned by [`Mutex::lock`] and [`Mutex::guard`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Lock<'a> {
    mutex: &'a Mutex,
    guarded: bool,
    waiter: Option<Arc<Waiter>>,
}

impl<'a> Future for Lock<'a> {
    type Output = MutexGuard<'a>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.mutex.inner.lock();

        if let Some(waiter) = &this.waiter {
            return match waiter.state.get() {
                WaiterState::Waiting => {
                    // Safety: internal lock held
                    unsafe {
                        let waker = &mut *waiter.waker.get();
                        match waker {
                            Some(old) if old.will_wake(cx.waker()) => {}
                            _ => *waker = Some(cx.waker().clone()),
                        }
                    }
                    Poll::Pending
                }
                WaiterState::Granted => {
                    this.waiter = None;
                    Poll::Ready(MutexGuard {
                        mutex: this.guarded.then_some(this.mutex),
                    })
                }
                WaiterState::Cancelled => unreachable!("cancelled lock future polled"),
            };
        }

        if !inner.locked {
            inner.locked = true;
            return Poll::Ready(MutexGuard {
                mutex: this.guarded.then_some(this.mutex),
            });
        }

        let waiter = Arc::new(Waiter {
            state: Cell::new(WaiterState::Waiting),
            waker: UnsafeCell::new(Some(cx.waker().clone())),
        });
        inner.waiters.push_back(waiter.clone());
        this.waiter = Some(waiter);
        Poll::Pending
    }
}

impl Drop for Lock<'_> {
    fn drop(&mut self) {
        let Some(waiter) = self.waiter.take() else {
            return;
        };
        let mut inner = self.mutex.inner.lock();
        let waker = match waiter.state.get() {
            WaiterState::Waiting => {
                inner.waiters.retain(|w| !Arc::ptr_eq(w, &waiter));
                waiter.state.set(WaiterState::Cancelled);
                None
            }
            WaiterState::Granted => {
                // we were handed the lock but will never take it; pass it on
                Mutex::unlock_inner(&mut inner)
            }
            WaiterState::Cancelled => unreachable!(),
        };
        drop(inner);
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

// === impl MutexGuard ===

/// Scoped ownership of a [`Mutex`].
///
/// Guards from [`Mutex::guard`] unlock on drop; guards from [`Mutex::lock`]
/// are inert and the caller unlocks manually.
#[must_use = "the lock is released when the guard is dropped"]
pub struct MutexGuard<'a> {
    /// `Some` for the auto-releasing flavor.
    mutex: Option<&'a Mutex>,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        if let Some(mutex) = self.mutex {
            mutex.unlock();
        }
    }
}

impl fmt::Debug for MutexGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutexGuard")
            .field("auto_release", &self.mutex.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncontended_lock() {
        let mutex = Mutex::new();

        let guard = {
            let mut lock = tokio_test::task::spawn(mutex.guard());
            match lock.poll() {
                Poll::Ready(guard) => guard,
                Poll::Pending => panic!("uncontended lock should resolve inline"),
            }
        };
        assert!(mutex.is_locked());

        drop(guard);
        assert!(!mutex.is_locked());
    }

    #[test]
    fn bare_lock_needs_manual_unlock() {
        let mutex = Mutex::new();

        let guard = {
            let mut lock = tokio_test::task::spawn(mutex.lock());
            match lock.poll() {
                Poll::Ready(guard) => guard,
                Poll::Pending => panic!("uncontended lock should resolve inline"),
            }
        };

        // the inert guard does not release
        drop(guard);
        assert!(mutex.is_locked());

        mutex.unlock();
        assert!(!mutex.is_locked());
    }

    #[test]
    fn contended_waiters_are_fifo() {
        let mutex = Mutex::new();

        let first = {
            let mut lock = tokio_test::task::spawn(mutex.guard());
            match lock.poll() {
                Poll::Ready(guard) => guard,
                Poll::Pending => panic!(),
            }
        };

        let mut second = tokio_test::task::spawn(mutex.guard());
        let mut third = tokio_test::task::spawn(mutex.guard());
        assert!(second.poll().is_pending());
        assert!(third.poll().is_pending());

        // unlock hands ownership to the head waiter only
        drop(first);
        assert!(second.is_woken());
        assert!(!third.is_woken());
        assert!(mutex.is_locked());

        let second_guard = match second.poll() {
            Poll::Ready(guard) => guard,
            Poll::Pending => panic!("granted waiter should resolve"),
        };
        drop(second_guard);

        assert!(third.is_woken());
        let third_guard = match third.poll() {
            Poll::Ready(guard) => guard,
            Poll::Pending => panic!("granted waiter should resolve"),
        };
        drop(third_guard);
        assert!(!mutex.is_locked());
    }

    #[test]
    fn dropped_granted_waiter_passes_the_lock_on() {
        let mutex = Mutex::new();

        let first = {
            let mut lock = tokio_test::task::spawn(mutex.guard());
            match lock.poll() {
                Poll::Ready(guard) => guard,
                Poll::Pending => panic!(),
            }
        };

        let mut second = tokio_test::task::spawn(mutex.guard());
        let mut third = tokio_test::task::spawn(mutex.guard());
        assert!(second.poll().is_pending());
        assert!(third.poll().is_pending());

        drop(first);
        // second was granted the lock but gives up without taking it
        drop(second);

        assert!(third.is_woken());
        let guard = match third.poll() {
            Poll::Ready(guard) => guard,
            Poll::Pending => panic!("lock should have been passed on"),
        };
        drop(guard);
        assert!(!mutex.is_locked());
    }
}
