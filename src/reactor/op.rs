// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Awaitable I/O operations.
//!
//! Each operation is a short-lived future that, on first poll, allocates an
//! [`OpCell`], stamps the operation into the current processor's reactor with
//! the cell's address as `user_data`, and suspends. The completion drain
//! writes the kernel's result into the cell and wakes the task.
//!
//! All operations resolve to a raw `i32` with the kernel's convention:
//! non-negative on success, a negative errno on failure. Interpreting the
//! result (EOF, error codes) is the caller's responsibility.
//!
//! Buffers handed to the kernel are owned by the cell, never borrowed from
//! the caller: `read` copies out after completion, `write` copies in up
//! front, and `accept` parses the peer address out of cell-owned sockaddr
//! storage. The cell — and with it the kernel's target memory — stays alive
//! until the completion is drained, even if the awaiting future is dropped
//! mid-flight, so abandoning an operation is safe (the operation itself still
//! runs to completion; see the design notes on cancellation).

use crate::executor;
use crate::sync::wait_cell::WaitCell;
use core::cell::UnsafeCell;
use core::future::Future;
use core::fmt;
use core::mem;
use core::pin::Pin;
use core::ptr;
use core::task::{Context, Poll};
use core::time::Duration;
use io_uring::{opcode, squeue, types};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

/// Completion cell of one in-flight operation.
///
/// Exactly one of these exists per submitted operation; its address is the
/// submission's `user_data`. The reactor holds one strong reference (leaked
/// into the ring) and the awaiting future holds the other, so whichever side
/// goes away first, the buffers the kernel writes through survive until the
/// completion is drained.
pub(crate) struct OpCell {
    complete: AtomicBool,
    result: AtomicI32,
    waker: WaitCell,
    /// Kernel-facing memory of the operation. Written by the submitting
    /// future before the cell is shared, read back by it after `complete`;
    /// in between only the kernel touches it, through raw pointers.
    resources: UnsafeCell<Resources>,
}

// Safety: `resources` is accessed by the future exclusively before
// submission and after observing `complete` (Acquire); the `complete` store
// (Release) on the reactor side orders the kernel's writes before the
// future's reads.
unsafe impl Send for OpCell {}
// Safety: see above
unsafe impl Sync for OpCell {}

enum Resources {
    Buffer(Box<[u8]>),
    Timespec(Box<types::Timespec>),
    Sockaddr(Box<(libc::sockaddr_storage, libc::socklen_t)>),
}

// === impl OpCell ===

impl OpCell {
    fn new(resources: Resources) -> Arc<Self> {
        Arc::new(Self {
            complete: AtomicBool::new(false),
            result: AtomicI32::new(0),
            waker: WaitCell::new(),
            resources: UnsafeCell::new(resources),
        })
    }

    /// Deliver the kernel's result and wake the awaiting task. Called from
    /// the reactor's completion drain, exactly once.
    pub(crate) fn complete(&self, result: i32) {
        self.result.store(result, Ordering::Relaxed);
        self.complete.store(true, Ordering::Release);
        self.waker.wake();
    }

    fn poll_result(&self, cx: &mut Context<'_>) -> Poll<i32> {
        loop {
            if self.complete.load(Ordering::Acquire) {
                return Poll::Ready(self.result.load(Ordering::Relaxed));
            }
            core::task::ready!(self.waker.poll_wait(cx));
        }
    }

    /// # Safety
    ///
    /// Only the submitting future may call this, and only after observing
    /// `complete` (the kernel is done with the memory by then).
    unsafe fn buffer(&self) -> &[u8] {
        // Safety: ensured by caller
        unsafe {
            match &*self.resources.get() {
                Resources::Buffer(buf) => buf,
                _ => unreachable!("operation has no buffer"),
            }
        }
    }

    /// Raw parts of the kernel-facing buffer, without forming a reference
    /// (the kernel writes through this pointer while the operation is in
    /// flight).
    ///
    /// # Safety
    ///
    /// Only the submitting future may call this, before the entry is
    /// submitted.
    unsafe fn buffer_raw(&self) -> (*mut u8, usize) {
        // Safety: ensured by caller
        unsafe {
            match &mut *self.resources.get() {
                Resources::Buffer(buf) => (buf.as_mut_ptr(), buf.len()),
                _ => unreachable!("operation has no buffer"),
            }
        }
    }

    /// Raw pointers to the sockaddr storage and its length field, without
    /// forming references (the kernel writes both while an accept is in
    /// flight).
    ///
    /// # Safety
    ///
    /// Only the submitting future may call this, before the entry is
    /// submitted.
    unsafe fn sockaddr_raw(&self) -> (*mut libc::sockaddr, *mut libc::socklen_t) {
        // Safety: ensured by caller
        unsafe {
            match &mut *self.resources.get() {
                Resources::Sockaddr(boxed) => {
                    let inner = &raw mut **boxed;
                    ((&raw mut (*inner).0).cast(), &raw mut (*inner).1)
                }
                _ => unreachable!("operation has no sockaddr"),
            }
        }
    }

    /// The sockaddr the kernel filled in, with the length it reported.
    ///
    /// # Safety
    ///
    /// Only the submitting future may call this, and only after observing
    /// `complete`.
    unsafe fn sockaddr(&self) -> (&libc::sockaddr_storage, libc::socklen_t) {
        // Safety: ensured by caller
        unsafe {
            match &*self.resources.get() {
                Resources::Sockaddr(boxed) => (&boxed.0, boxed.1),
                _ => unreachable!("operation has no sockaddr"),
            }
        }
    }
}

impl fmt::Debug for OpCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpCell")
            .field("complete", &self.complete.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Stamp `entry` into the current processor's reactor carrying one strong
/// reference to `cell` as its `user_data`.
///
/// # Panics
///
/// Panics when called from outside a runtime machine.
fn submit_with_cell(cell: &Arc<OpCell>, entry: squeue::Entry) {
    let user_data = Arc::into_raw(cell.clone()) as u64;
    executor::with_current_reactor(|reactor| reactor.submit(entry.user_data(user_data)));
}

/// State machine shared by all operation futures.
enum Op {
    Unsubmitted,
    InFlight(Arc<OpCell>),
    Done,
}

impl Op {
    /// Drive the submit-once-then-wait protocol. `prepare` builds the cell
    /// and entry on the first poll.
    fn poll(
        &mut self,
        cx: &mut Context<'_>,
        prepare: impl FnOnce() -> (Arc<OpCell>, squeue::Entry),
    ) -> Poll<(Arc<OpCell>, i32)> {
        if let Op::Unsubmitted = self {
            let (cell, entry) = prepare();
            submit_with_cell(&cell, entry);
            *self = Op::InFlight(cell);
        }

        match self {
            Op::InFlight(cell) => {
                let res = core::task::ready!(cell.poll_result(cx));
                let cell = match mem::replace(self, Op::Done) {
                    Op::InFlight(cell) => cell,
                    _ => unreachable!(),
                };
                Poll::Ready((cell, res))
            }
            Op::Done => panic!("operation future polled after completion"),
            Op::Unsubmitted => unreachable!(),
        }
    }
}

/// Read up to `buf.len()` bytes from `fd` into `buf`.
///
/// Resolves to the number of bytes read (`0` is end-of-file) or a negative
/// errno.
pub fn read(fd: RawFd, buf: &mut [u8]) -> Read<'_> {
    Read {
        fd,
        buf,
        op: Op::Unsubmitted,
    }
}

/// Write the bytes of `buf` to `fd`.
///
/// Resolves to the number of bytes written or a negative errno. The bytes
/// are captured up front; `buf` may be reused immediately.
pub fn write(fd: RawFd, buf: &[u8]) -> Write {
    Write {
        fd,
        data: Some(buf.into()),
        op: Op::Unsubmitted,
    }
}

/// Accept a connection on the listening socket `fd`.
///
/// Resolves to the new connection's file descriptor or a negative errno. On
/// success the peer's address is stored into `out_addr` (when one is
/// supplied; `None` discards it, mirroring a null `sockaddr` out-pointer in
/// `accept(2)`). An address family the runtime does not speak leaves the
/// slot at `None`.
pub fn accept(fd: RawFd, out_addr: Option<&mut Option<SocketAddr>>) -> Accept<'_> {
    Accept {
        fd,
        out_addr,
        op: Op::Unsubmitted,
    }
}

/// Connect the socket `fd` to `addr`.
///
/// Resolves to `0` or a negative errno.
pub fn connect(fd: RawFd, addr: SocketAddr) -> Connect {
    Connect {
        fd,
        addr,
        op: Op::Unsubmitted,
    }
}

/// Wait for `duration` to elapse on the current processor's reactor.
///
/// Resolves to `-ETIME` when the timeout fires normally (the kernel reports
/// an elapsed timeout as an error completion).
pub fn delay(duration: Duration) -> Delay {
    Delay {
        duration,
        op: Op::Unsubmitted,
    }
}

/// Future returned by [`read`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Read<'a> {
    fd: RawFd,
    buf: &'a mut [u8],
    op: Op,
}

impl Future for Read<'_> {
    type Output = i32;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let (fd, len) = (this.fd, this.buf.len());

        let (cell, res) = core::task::ready!(this.op.poll(cx, || {
            let cell = OpCell::new(Resources::Buffer(vec![0u8; len].into_boxed_slice()));
            // Safety: the cell was just created, nothing is in flight yet
            let (ptr, len) = unsafe { cell.buffer_raw() };
            let entry = opcode::Read::new(
                types::Fd(fd),
                ptr,
                u32::try_from(len).unwrap_or(u32::MAX),
            )
            .build();
            (cell, entry)
        }));

        if res > 0 {
            // Safety: `complete` was observed, the kernel is done writing
            let src = unsafe { cell.buffer() };
            let n = (res as usize).min(this.buf.len());
            this.buf[..n].copy_from_slice(&src[..n]);
        }
        Poll::Ready(res)
    }
}

/// Future returned by [`write`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Write {
    fd: RawFd,
    data: Option<Box<[u8]>>,
    op: Op,
}

impl Future for Write {
    type Output = i32;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let fd = this.fd;
        let data = &mut this.data;

        let (_cell, res) = core::task::ready!(this.op.poll(cx, || {
            let data = data.take().expect("write submitted twice");
            let cell = OpCell::new(Resources::Buffer(data));
            // Safety: the cell was just created, nothing is in flight yet
            let buf = unsafe { cell.buffer() };
            let entry = opcode::Write::new(
                types::Fd(fd),
                buf.as_ptr(),
                u32::try_from(buf.len()).unwrap_or(u32::MAX),
            )
            .build();
            (cell, entry)
        }));

        Poll::Ready(res)
    }
}

/// Future returned by [`accept`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Accept<'a> {
    fd: RawFd,
    out_addr: Option<&'a mut Option<SocketAddr>>,
    op: Op,
}

impl Future for Accept<'_> {
    type Output = i32;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let fd = this.fd;

        let (cell, res) = core::task::ready!(this.op.poll(cx, || {
            // the kernel fills the storage and shrinks the length in place
            let cell = OpCell::new(Resources::Sockaddr(Box::new((
                // Safety: sockaddr_storage is valid as all-zeroes
                unsafe { mem::zeroed() },
                mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
            ))));
            // Safety: the cell was just created, nothing is in flight yet
            let (addr_ptr, len_ptr) = unsafe { cell.sockaddr_raw() };
            let entry = opcode::Accept::new(types::Fd(fd), addr_ptr, len_ptr).build();
            (cell, entry)
        }));

        if res >= 0 {
            if let Some(out) = this.out_addr.as_mut() {
                // Safety: `complete` was observed, the kernel is done writing
                let (storage, len) = unsafe { cell.sockaddr() };
                **out = sockaddr_to_addr(storage, len);
            }
        }
        Poll::Ready(res)
    }
}

/// Future returned by [`connect`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Connect {
    fd: RawFd,
    addr: SocketAddr,
    op: Op,
}

impl Future for Connect {
    type Output = i32;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let (fd, addr) = (this.fd, this.addr);

        let (_cell, res) = core::task::ready!(this.op.poll(cx, || {
            let sockaddr = Box::new(sockaddr_from(&addr));
            let (addr_ptr, addr_len) = (ptr::from_ref(&sockaddr.0), sockaddr.1);
            let cell = OpCell::new(Resources::Sockaddr(sockaddr));
            let entry =
                opcode::Connect::new(types::Fd(fd), addr_ptr.cast::<libc::sockaddr>(), addr_len)
                    .build();
            (cell, entry)
        }));

        Poll::Ready(res)
    }
}

/// Future returned by [`delay`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Delay {
    duration: Duration,
    op: Op,
}

impl Future for Delay {
    type Output = i32;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let duration = this.duration;

        let (_cell, res) = core::task::ready!(this.op.poll(cx, || {
            let ts = Box::new(
                types::Timespec::new()
                    .sec(duration.as_secs())
                    .nsec(duration.subsec_nanos()),
            );
            let ts_ptr = ptr::from_ref(&*ts);
            let cell = OpCell::new(Resources::Timespec(ts));
            let entry = opcode::Timeout::new(ts_ptr).build();
            (cell, entry)
        }));

        Poll::Ready(res)
    }
}

fn sockaddr_to_addr(
    storage: &libc::sockaddr_storage,
    len: libc::socklen_t,
) -> Option<SocketAddr> {
    match libc::c_int::from(storage.ss_family) {
        libc::AF_INET if len as usize >= mem::size_of::<libc::sockaddr_in>() => {
            // Safety: the family and length say this is a sockaddr_in
            let sin = unsafe { &*ptr::from_ref(storage).cast::<libc::sockaddr_in>() };
            Some(SocketAddr::from((
                Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 if len as usize >= mem::size_of::<libc::sockaddr_in6>() => {
            // Safety: the family and length say this is a sockaddr_in6
            let sin6 = unsafe { &*ptr::from_ref(storage).cast::<libc::sockaddr_in6>() };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // Safety: sockaddr_storage is valid as all-zeroes
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            // Safety: sockaddr_in fits inside sockaddr_storage
            unsafe { ptr::write((&raw mut storage).cast::<libc::sockaddr_in>(), sin) };
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            // Safety: sockaddr_in6 fits inside sockaddr_storage
            unsafe { ptr::write((&raw mut storage).cast::<libc::sockaddr_in6>(), sin6) };
            mem::size_of::<libc::sockaddr_in6>()
        }
    };

    (storage, len as libc::socklen_t)
}
