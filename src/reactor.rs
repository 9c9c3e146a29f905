// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-processor I/O driver.
//!
//! Every processor owns one [`Reactor`]: an io_uring instance plus an eventfd
//! used as a cross-thread doorbell. All submissions and completion drains
//! happen on the machine currently bound to the owning processor; other
//! threads interact with the reactor exclusively through [`Reactor::wake`],
//! which makes a blocked [`Reactor::poll`] return early.

pub mod op;

use crate::reactor::op::OpCell;
use core::cell::UnsafeCell;
use core::fmt;
use io_uring::{opcode, squeue, types, IoUring};
use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;

/// Submission capacity of the ring. With more than this many operations in
/// flight, further submissions are deferred to the backlog.
pub(crate) const RING_DEPTH: usize = 256;

/// Number of prepared-but-unsubmitted entries that triggers an early flush to
/// the kernel, amortizing `io_uring_enter` over bursts of submissions.
const SUBMIT_INTERVAL: usize = 64;

/// `user_data` tag of the permanently posted eventfd read. Distinguishable
/// from operation cells, which are (non-null, aligned) heap addresses.
const WAKE_USER_DATA: u64 = u64::MAX;

/// A per-processor io_uring wrapper.
///
/// For every in-flight operation there is exactly one [`OpCell`] whose
/// address rides in the submission entry's `user_data` field, carrying one
/// strong reference; draining the completion delivers the result into the
/// cell and releases that reference.
pub(crate) struct Reactor {
    /// Doorbell: written by [`Self::wake`] from any thread, read by the
    /// permanently posted wake operation on the ring.
    event_fd: OwnedFd,
    inner: UnsafeCell<Inner>,
}

struct Inner {
    ring: IoUring,
    /// Operations stamped into the ring and not yet drained, including the
    /// wake read.
    in_flight: usize,
    /// Entries pushed into the submission queue since the last
    /// `io_uring_enter`.
    unsubmitted: usize,
    /// Deferred submissions: operations that arrived while the ring was at
    /// capacity. Drained back into the ring as completions free slots.
    backlog: VecDeque<squeue::Entry>,
    /// Read destination of the posted wake operation. Boxed so its address
    /// survives moves of `Inner`.
    wake_buf: Box<u64>,
}

// Safety: `inner` is only ever accessed by the machine currently bound to
// the processor that owns this reactor (submissions happen inside task polls
// running on that machine, drains in its scheduling loop). `event_fd` is
// just a file descriptor and safe to write from any thread.
unsafe impl Send for Reactor {}
// Safety: see above
unsafe impl Sync for Reactor {}

// === impl Reactor ===

impl Reactor {
    pub(crate) fn new() -> io::Result<Self> {
        // Safety: eventfd(2) returns a fresh descriptor we immediately own
        let event_fd = unsafe {
            let fd = libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            OwnedFd::from_raw_fd(fd)
        };

        let ring = IoUring::new(RING_DEPTH as u32)?;

        let this = Self {
            event_fd,
            inner: UnsafeCell::new(Inner {
                ring,
                in_flight: 0,
                unsubmitted: 0,
                backlog: VecDeque::new(),
                wake_buf: Box::new(0),
            }),
        };

        // Safety: the reactor has no owning processor yet, no other thread
        // can touch `inner`
        unsafe { this.inner_mut().arm_wake_read(this.event_fd.as_raw_fd()) };

        Ok(this)
    }

    /// `true` when there are operations worth blocking for: anything beyond
    /// the permanently posted wake read.
    pub(crate) fn has_work(&self) -> bool {
        // Safety: owner-only, see the `Send`/`Sync` comment
        let inner = unsafe { self.inner_mut() };
        inner.in_flight > 1 || !inner.backlog.is_empty()
    }

    /// Stamp `entry` into the ring, or defer it while the ring is at
    /// capacity.
    ///
    /// The entry's `user_data` must carry an [`OpCell`] address (one strong
    /// reference, produced by [`op::submit_with_cell`]).
    pub(crate) fn submit(&self, entry: squeue::Entry) {
        // Safety: owner-only, see the `Send`/`Sync` comment
        let inner = unsafe { self.inner_mut() };

        if inner.in_flight >= RING_DEPTH {
            tracing::trace!("ring full, deferring submission");
            inner.backlog.push_back(entry);
            return;
        }

        inner.push_sqe(entry);
    }

    /// Drain completions, delivering results into their [`OpCell`]s (which
    /// wakes the tasks awaiting them).
    ///
    /// With `block` set, parks the calling machine in the kernel until at
    /// least one completion (or a [`Self::wake`] doorbell) arrives. Returns
    /// the number of operation completions delivered.
    pub(crate) fn poll(&self, block: bool) -> usize {
        // Safety: owner-only, see the `Send`/`Sync` comment
        let inner = unsafe { self.inner_mut() };

        if block {
            inner.submit_and_wait(1);
        } else if inner.unsubmitted > 0 {
            inner.submit_and_wait(0);
        }

        let mut delivered = 0;
        let mut drained = 0;
        let mut wake_seen = false;

        for cqe in inner.ring.completion() {
            drained += 1;
            if cqe.user_data() == WAKE_USER_DATA {
                wake_seen = true;
            } else {
                // Safety: the user_data of every non-wake entry is an
                // `Arc<OpCell>` reference leaked at submission; completions
                // deliver each exactly once.
                let cell = unsafe { Arc::from_raw(cqe.user_data() as *const OpCell) };
                cell.complete(cqe.result());
                delivered += 1;
            }
        }

        inner.in_flight -= drained;
        tracing::trace!(drained, in_flight = inner.in_flight, "drained completions");

        if wake_seen {
            // the doorbell is one-shot per drain; re-post it
            inner.arm_wake_read(self.event_fd.as_raw_fd());
        }

        // backpressure release: refill freed ring slots from the backlog
        while inner.in_flight < RING_DEPTH {
            let Some(entry) = inner.backlog.pop_front() else {
                break;
            };
            inner.push_sqe(entry);
        }

        delivered
    }

    /// Ring the doorbell, forcing a machine blocked in [`Self::poll`] to
    /// return. Callable from any thread.
    pub(crate) fn wake(&self) {
        let val: u64 = 1;
        // Safety: writing 8 bytes from a valid buffer to an owned eventfd
        let res = unsafe {
            libc::write(
                self.event_fd.as_raw_fd(),
                (&raw const val).cast(),
                core::mem::size_of::<u64>(),
            )
        };
        // EAGAIN means the counter is saturated, i.e. the doorbell is
        // already ringing
        debug_assert!(
            res == core::mem::size_of::<u64>() as isize
                || io::Error::last_os_error().kind() == io::ErrorKind::WouldBlock,
            "eventfd write failed: {}",
            io::Error::last_os_error()
        );
    }

    /// # Safety
    ///
    /// Caller must be the machine bound to the owning processor (or hold the
    /// reactor exclusively).
    #[expect(clippy::mut_from_ref, reason = "single-threaded by the processor contract")]
    unsafe fn inner_mut(&self) -> &mut Inner {
        // Safety: ensured by caller
        unsafe { &mut *self.inner.get() }
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("event_fd", &self.event_fd)
            .finish_non_exhaustive()
    }
}

// === impl Inner ===

impl Inner {
    /// Post the permanent eventfd read that [`Reactor::wake`] completes.
    fn arm_wake_read(&mut self, event_fd: libc::c_int) {
        let buf = &raw mut *self.wake_buf;
        let entry = opcode::Read::new(
            types::Fd(event_fd),
            buf.cast::<u8>(),
            core::mem::size_of::<u64>() as u32,
        )
        .build()
        .user_data(WAKE_USER_DATA);

        self.push_sqe(entry);
    }

    fn push_sqe(&mut self, entry: squeue::Entry) {
        loop {
            // Safety: the entry's buffers are owned by an `OpCell` (or this
            // reactor's wake_buf) and stay alive until its completion is
            // drained
            let res = unsafe { self.ring.submission().push(&entry) };
            match res {
                Ok(()) => break,
                Err(_) => {
                    // submission queue full; hand what we have to the kernel
                    self.submit_and_wait(0);
                }
            }
        }

        self.in_flight += 1;
        self.unsubmitted += 1;
        if self.unsubmitted >= SUBMIT_INTERVAL {
            self.submit_and_wait(0);
        }
    }

    fn submit_and_wait(&mut self, want: usize) {
        loop {
            match self.ring.submitter().submit_and_wait(want) {
                Ok(_) => break,
                Err(err) if err.raw_os_error() == Some(libc::EINTR) => continue,
                Err(err) if err.raw_os_error() == Some(libc::EBUSY) => {
                    // completion queue is backed up; the caller will drain it
                    break;
                }
                Err(err) => panic!("io_uring submit failed: {err}"),
            }
        }
        self.unsubmitted = 0;
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Reclaim the cell references of operations still in flight at
        // shutdown. The ring fd is closed with `self.ring` before `wake_buf`
        // and the cells drop, so the kernel no longer writes through them.
        let mut cancelled = 0;
        while self.in_flight > 0 {
            let Some(cqe) = self.ring.completion().next() else {
                break;
            };
            self.in_flight -= 1;
            if cqe.user_data() != WAKE_USER_DATA {
                // Safety: same exactly-once adoption as in `Reactor::poll`
                let cell = unsafe { Arc::from_raw(cqe.user_data() as *const OpCell) };
                cell.complete(cqe.result());
                cancelled += 1;
            }
        }
        if cancelled > 0 || self.in_flight > 0 {
            tracing::debug!(
                cancelled,
                leaked = self.in_flight.saturating_sub(1),
                "reactor dropped with operations in flight"
            );
        }
    }
}
