// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::Closed;
use core::cell::{Cell, UnsafeCell};
use core::future::Future;
use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// A bounded FIFO channel between tasks.
///
/// A channel of capacity `K` buffers up to `K` values; senders beyond that
/// park until a receiver makes room, receivers park while the channel is
/// empty. A capacity of zero makes the channel a *rendezvous*: every send
/// pairs directly with a receive and nothing is ever buffered.
///
/// Waiters are strictly FIFO in both directions, and a parked sender and a
/// parked receiver never coexist: an arriving operation always completes the
/// head of the opposite queue first.
///
/// Closing the channel ([`Channel::close`]) resumes all parked waiters with
/// [`Closed`]; buffered values remain receivable, a receiver only observes
/// [`Closed`] once the buffer has drained.
pub struct Channel<T> {
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    capacity: usize,
    buffer: VecDeque<T>,
    senders: VecDeque<Arc<Waiter<T>>>,
    receivers: VecDeque<Arc<Waiter<T>>>,
    closed: bool,
}

/// A parked sender or receiver.
///
/// All fields are guarded by the owning channel's lock: every access —
/// including the woken future reading its own outcome — happens with the
/// lock held. The `state` transition under the lock happens-before the wake
/// that follows it, so the woken task always observes its outcome.
struct Waiter<T> {
    /// `Some` for a parked sender (taken by the completing receiver), `None`
    /// for a parked receiver (stamped by the completing sender).
    value: UnsafeCell<Option<T>>,
    state: Cell<WaiterState>,
    waker: UnsafeCell<Option<Waker>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaiterState {
    Waiting,
    /// The peer completed the handoff.
    Delivered,
    /// The channel was closed underneath the waiter.
    Closed,
    /// The waiting future was dropped; it has already unlinked itself.
    Cancelled,
}

// Safety: all fields are accessed under the owning channel's lock (see the
// struct docs); the lock provides the necessary synchronization.
unsafe impl<T: Send> Send for Waiter<T> {}
// Safety: see above
unsafe impl<T: Send> Sync for Waiter<T> {}

// === impl Channel ===

impl<T> Channel<T> {
    /// Create a channel buffering up to `capacity` values; `0` makes a
    /// rendezvous channel.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                capacity,
                buffer: VecDeque::with_capacity(capacity),
                senders: VecDeque::new(),
                receivers: VecDeque::new(),
                closed: false,
            }),
        }
    }

    /// Send `value`, parking until the channel has room (or a receiver, for
    /// rendezvous channels).
    ///
    /// Resolves to `Err(Closed)` — dropping the value — once the channel is
    /// closed.
    pub fn send(&self, value: T) -> SendFuture<'_, T> {
        SendFuture {
            channel: self,
            value: Some(value),
            waiter: None,
        }
    }

    /// Receive the next value, parking while the channel is empty.
    ///
    /// Resolves to `Err(Closed)` once the channel is closed *and* drained.
    pub fn recv(&self) -> RecvFuture<'_, T> {
        RecvFuture {
            channel: self,
            waiter: None,
        }
    }

    /// Close the channel: all parked senders and receivers resume with
    /// [`Closed`], later sends fail, and receivers drain the remaining
    /// buffer before observing [`Closed`].
    pub fn close(&self) {
        let mut wakers = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;

            let senders: Vec<_> = inner.senders.drain(..).collect();
            let receivers: Vec<_> = inner.receivers.drain(..).collect();
            for waiter in senders.into_iter().chain(receivers) {
                // Safety: channel lock held
                if let Some(waker) = unsafe { waiter.close() } {
                    wakers.push(waker);
                }
            }
        }
        for waker in wakers {
            waker.wake();
        }
    }

    /// `true` once [`Self::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of buffered values.
    pub fn len(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Channel")
            .field("capacity", &inner.capacity)
            .field("buffered", &inner.buffer.len())
            .field("waiting_senders", &inner.senders.len())
            .field("waiting_receivers", &inner.receivers.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

// === impl Waiter ===

impl<T> Waiter<T> {
    fn parked(value: Option<T>, waker: Waker) -> Arc<Self> {
        Arc::new(Self {
            value: UnsafeCell::new(value),
            state: Cell::new(WaiterState::Waiting),
            waker: UnsafeCell::new(Some(waker)),
        })
    }

    /// # Safety
    ///
    /// The owning channel's lock must be held.
    unsafe fn update_waker(&self, cx: &Context<'_>) {
        // Safety: ensured by caller
        unsafe {
            let waker = &mut *self.waker.get();
            match waker {
                Some(old) if old.will_wake(cx.waker()) => {}
                _ => *waker = Some(cx.waker().clone()),
            }
        }
    }

    /// Complete a parked *receiver* with `value`.
    ///
    /// # Safety
    ///
    /// The owning channel's lock must be held.
    unsafe fn deliver(&self, value: T) -> Option<Waker> {
        debug_assert_eq!(self.state.get(), WaiterState::Waiting);
        // Safety: ensured by caller
        unsafe {
            *self.value.get() = Some(value);
            self.state.set(WaiterState::Delivered);
            (*self.waker.get()).take()
        }
    }

    /// Complete a parked *sender*, taking the value it carried.
    ///
    /// # Safety
    ///
    /// The owning channel's lock must be held.
    unsafe fn take_delivered(&self) -> (T, Option<Waker>) {
        debug_assert_eq!(self.state.get(), WaiterState::Waiting);
        // Safety: ensured by caller
        unsafe {
            let value = (*self.value.get()).take().expect("parked sender without a value");
            self.state.set(WaiterState::Delivered);
            (value, (*self.waker.get()).take())
        }
    }

    /// # Safety
    ///
    /// The owning channel's lock must be held.
    unsafe fn close(&self) -> Option<Waker> {
        self.state.set(WaiterState::Closed);
        // Safety: ensured by caller
        unsafe { (*self.waker.get()).take() }
    }

    /// Take the value a sender stamped into this parked receiver.
    ///
    /// # Safety
    ///
    /// The owning channel's lock must be held, and the state must be
    /// `Delivered`.
    unsafe fn take_value(&self) -> T {
        // Safety: ensured by caller
        unsafe { (*self.value.get()).take().expect("delivered waiter without a value") }
    }
}

// === impl SendFuture ===

/// Future returned by [`Channel::send`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct SendFuture<'a, T> {
    channel: &'a Channel<T>,
    value: Option<T>,
    waiter: Option<Arc<Waiter<T>>>,
}

impl<T> Future for SendFuture<'_, T> {
    type Output = Result<(), Closed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Safety: `SendFuture` is never moved out from under a pinned
        // reference; it holds no address-sensitive state.
        let this = unsafe { self.get_unchecked_mut() };
        let mut inner = this.channel.inner.lock();

        // parked: the peer (or close) decides our outcome
        if let Some(waiter) = &this.waiter {
            return match waiter.state.get() {
                // Safety: channel lock held
                WaiterState::Waiting => {
                    unsafe { waiter.update_waker(cx) };
                    Poll::Pending
                }
                WaiterState::Delivered => {
                    this.waiter = None;
                    Poll::Ready(Ok(()))
                }
                WaiterState::Closed => {
                    this.waiter = None;
                    Poll::Ready(Err(Closed(())))
                }
                WaiterState::Cancelled => unreachable!("cancelled send future polled"),
            };
        }

        let value = this.value.take().expect("send future polled after completion");

        if inner.closed {
            return Poll::Ready(Err(Closed(())));
        }

        // a parked receiver implies an empty buffer: hand the value over
        // directly instead of buffering
        if let Some(receiver) = inner.receivers.pop_front() {
            debug_assert!(inner.buffer.is_empty());
            // Safety: channel lock held
            let waker = unsafe { receiver.deliver(value) };
            drop(inner);
            if let Some(waker) = waker {
                waker.wake();
            }
            return Poll::Ready(Ok(()));
        }

        if inner.buffer.len() < inner.capacity {
            inner.buffer.push_back(value);
            return Poll::Ready(Ok(()));
        }

        // full (or rendezvous with no receiver): park with the value
        let waiter = Waiter::parked(Some(value), cx.waker().clone());
        inner.senders.push_back(waiter.clone());
        this.waiter = Some(waiter);
        Poll::Pending
    }
}

impl<T> Drop for SendFuture<'_, T> {
    fn drop(&mut self) {
        let Some(waiter) = self.waiter.take() else {
            return;
        };
        let mut inner = self.channel.inner.lock();
        if waiter.state.get() == WaiterState::Waiting {
            inner.senders.retain(|w| !Arc::ptr_eq(w, &waiter));
            waiter.state.set(WaiterState::Cancelled);
        }
        // Delivered / Closed: the handoff already happened; nothing to undo
    }
}

// === impl RecvFuture ===

/// Future returned by [`Channel::recv`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct RecvFuture<'a, T> {
    channel: &'a Channel<T>,
    waiter: Option<Arc<Waiter<T>>>,
}

impl<T> Future for RecvFuture<'_, T> {
    type Output = Result<T, Closed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.channel.inner.lock();

        if let Some(waiter) = &this.waiter {
            return match waiter.state.get() {
                // Safety: channel lock held
                WaiterState::Waiting => {
                    unsafe { waiter.update_waker(cx) };
                    Poll::Pending
                }
                WaiterState::Delivered => {
                    // Safety: channel lock held, state is Delivered
                    let value = unsafe { waiter.take_value() };
                    this.waiter = None;
                    Poll::Ready(Ok(value))
                }
                WaiterState::Closed => {
                    this.waiter = None;
                    Poll::Ready(Err(Closed(())))
                }
                WaiterState::Cancelled => unreachable!("cancelled recv future polled"),
            };
        }

        if let Some(value) = inner.buffer.pop_front() {
            // backfill the freed slot from the head sender, preserving FIFO
            if let Some(sender) = inner.senders.pop_front() {
                // Safety: channel lock held
                let (sent, waker) = unsafe { sender.take_delivered() };
                inner.buffer.push_back(sent);
                drop(inner);
                if let Some(waker) = waker {
                    waker.wake();
                }
            }
            return Poll::Ready(Ok(value));
        }

        // rendezvous: buffer is always empty, pair with the head sender
        if let Some(sender) = inner.senders.pop_front() {
            debug_assert_eq!(inner.capacity, 0);
            // Safety: channel lock held
            let (value, waker) = unsafe { sender.take_delivered() };
            drop(inner);
            if let Some(waker) = waker {
                waker.wake();
            }
            return Poll::Ready(Ok(value));
        }

        if inner.closed {
            return Poll::Ready(Err(Closed(())));
        }

        let waiter = Waiter::parked(None, cx.waker().clone());
        inner.receivers.push_back(waiter.clone());
        this.waiter = Some(waiter);
        Poll::Pending
    }
}

impl<T> Drop for RecvFuture<'_, T> {
    fn drop(&mut self) {
        let Some(waiter) = self.waiter.take() else {
            return;
        };
        let mut inner = self.channel.inner.lock();
        if waiter.state.get() == WaiterState::Waiting {
            inner.receivers.retain(|w| !Arc::ptr_eq(w, &waiter));
            waiter.state.set(WaiterState::Cancelled);
        }
        // a Delivered value the receiver never read drops with the waiter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffered_send_recv() {
        let chan = Channel::new(2);

        let mut send = tokio_test::task::spawn(chan.send(1));
        assert_eq!(send.poll(), Poll::Ready(Ok(())));
        let mut send = tokio_test::task::spawn(chan.send(2));
        assert_eq!(send.poll(), Poll::Ready(Ok(())));

        // capacity reached: the third sender parks
        let mut parked = tokio_test::task::spawn(chan.send(3));
        assert!(parked.poll().is_pending());

        let mut recv = tokio_test::task::spawn(chan.recv());
        assert_eq!(recv.poll(), Poll::Ready(Ok(1)));

        // the receive backfilled the buffer from the parked sender
        assert!(parked.is_woken());
        assert_eq!(parked.poll(), Poll::Ready(Ok(())));
        assert_eq!(chan.len(), 2);

        let mut recv = tokio_test::task::spawn(chan.recv());
        assert_eq!(recv.poll(), Poll::Ready(Ok(2)));
        let mut recv = tokio_test::task::spawn(chan.recv());
        assert_eq!(recv.poll(), Poll::Ready(Ok(3)));
    }

    #[test]
    fn rendezvous_never_buffers() {
        let chan = Channel::new(0);

        let mut send = tokio_test::task::spawn(chan.send(7));
        assert!(send.poll().is_pending());
        assert_eq!(chan.len(), 0);

        // the receive completes the parked sender directly
        let mut recv = tokio_test::task::spawn(chan.recv());
        assert_eq!(recv.poll(), Poll::Ready(Ok(7)));
        assert!(send.is_woken());
        assert_eq!(send.poll(), Poll::Ready(Ok(())));
        assert_eq!(chan.len(), 0);
    }

    #[test]
    fn recv_parks_until_send() {
        let chan = Channel::new(0);

        let mut recv = tokio_test::task::spawn(chan.recv());
        assert!(recv.poll().is_pending());

        // the send stamps the parked receiver and completes inline
        let mut send = tokio_test::task::spawn(chan.send("hi"));
        assert_eq!(send.poll(), Poll::Ready(Ok(())));

        assert!(recv.is_woken());
        assert_eq!(recv.poll(), Poll::Ready(Ok("hi")));
    }

    #[test]
    fn waiters_are_fifo() {
        let chan = Channel::new(0);

        let mut r1 = tokio_test::task::spawn(chan.recv());
        let mut r2 = tokio_test::task::spawn(chan.recv());
        assert!(r1.poll().is_pending());
        assert!(r2.poll().is_pending());

        let mut s1 = tokio_test::task::spawn(chan.send(1));
        let mut s2 = tokio_test::task::spawn(chan.send(2));
        assert_eq!(s1.poll(), Poll::Ready(Ok(())));
        assert_eq!(s2.poll(), Poll::Ready(Ok(())));

        assert_eq!(r1.poll(), Poll::Ready(Ok(1)));
        assert_eq!(r2.poll(), Poll::Ready(Ok(2)));
    }

    #[test]
    fn close_drains_parked_senders_and_keeps_buffer() {
        let chan = Channel::new(4);
        for i in 0..4 {
            let mut send = tokio_test::task::spawn(chan.send(i));
            assert_eq!(send.poll(), Poll::Ready(Ok(())));
        }
        let mut parked1 = tokio_test::task::spawn(chan.send(4));
        let mut parked2 = tokio_test::task::spawn(chan.send(5));
        assert!(parked1.poll().is_pending());
        assert!(parked2.poll().is_pending());

        chan.close();

        // parked senders resume with Closed
        assert!(parked1.is_woken());
        assert!(parked2.is_woken());
        assert_eq!(parked1.poll(), Poll::Ready(Err(Closed(()))));
        assert_eq!(parked2.poll(), Poll::Ready(Err(Closed(()))));

        // the buffer drains before receivers observe Closed
        for i in 0..4 {
            let mut recv = tokio_test::task::spawn(chan.recv());
            assert_eq!(recv.poll(), Poll::Ready(Ok(i)));
        }
        let mut recv = tokio_test::task::spawn(chan.recv());
        assert_eq!(recv.poll(), Poll::Ready(Err(Closed(()))));

        // and sends now fail outright
        let mut send = tokio_test::task::spawn(chan.send(9));
        assert_eq!(send.poll(), Poll::Ready(Err(Closed(()))));
    }

    #[test]
    fn dropped_waiter_unlinks_itself() {
        let chan = Channel::new(0);

        let mut r1 = tokio_test::task::spawn(chan.recv());
        let mut r2 = tokio_test::task::spawn(chan.recv());
        assert!(r1.poll().is_pending());
        assert!(r2.poll().is_pending());

        // r1 gives up; the next send must pair with r2
        drop(r1);

        let mut send = tokio_test::task::spawn(chan.send(42));
        assert_eq!(send.poll(), Poll::Ready(Ok(())));
        assert_eq!(r2.poll(), Poll::Ready(Ok(42)));
    }
}
