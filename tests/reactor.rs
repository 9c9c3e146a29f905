// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use goro::{Channel, Executor};
use std::mem;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[test]
fn delay_elapses() {
    let exec = Executor::new(1).unwrap();

    exec.block_on(async {
        let begin = Instant::now();
        let res = goro::delay(Duration::from_millis(100)).await;
        let elapsed = begin.elapsed();

        // the kernel reports a normally elapsed timeout as -ETIME
        assert_eq!(res, -libc::ETIME);
        assert!(elapsed >= Duration::from_millis(100), "woke after {elapsed:?}");
        // an idle runtime resumes the timer's task promptly: at most one
        // extra timeout's worth of slack on a lightly loaded machine
        assert!(elapsed <= Duration::from_millis(200), "woke after {elapsed:?}");
    });
}

/// A task spawned from an off-runtime thread while the only processor is
/// blocked inside its reactor must kick the reactor and start promptly.
#[test]
fn kick_from_polling() {
    let exec = Executor::new(1).unwrap();
    let exec2 = exec.clone();

    let chan = Arc::new(Channel::<Instant>::new(0));
    let chan2 = chan.clone();

    std::thread::spawn(move || {
        // let the runtime settle into Polling on the long delay below
        std::thread::sleep(Duration::from_millis(50));
        let spawned_at = Instant::now();
        exec2
            .spawn(async move {
                chan2.send(spawned_at).await.unwrap();
            })
            .unwrap();
    });

    let exec3 = exec.clone();
    exec.block_on(async move {
        // outstanding reactor work forces NotFound -> Polling instead of
        // WaitingSpinning
        let _long = exec3.spawn(async {
            goro::delay(Duration::from_secs(30)).await;
        });

        let spawned_at = chan.recv().await.unwrap();
        let latency = spawned_at.elapsed();
        // the doorbell has to get the spawned task running within 10ms,
        // measured all the way through to its send arriving here
        assert!(
            latency <= Duration::from_millis(10),
            "kick took {latency:?}"
        );
    });
}

/// More concurrent timeouts than the ring has submission slots: the overflow
/// is deferred and still completes exactly once.
#[test]
fn ring_full_backpressure() {
    // comfortably above the ring depth of 256
    const TIMERS: usize = 300;

    let exec = Executor::new(1).unwrap();
    let exec2 = exec.clone();

    exec.block_on(async move {
        let handles: Vec<_> = (0..TIMERS)
            .map(|_| {
                exec2
                    .spawn(async { goro::delay(Duration::from_millis(100)).await })
                    .unwrap()
            })
            .collect();

        let mut fired = 0;
        for handle in handles {
            assert_eq!(handle.await.unwrap(), -libc::ETIME);
            fired += 1;
        }
        assert_eq!(fired, TIMERS);
    });
}

#[test]
fn pipe_write_then_read() {
    let exec = Executor::new(1).unwrap();

    let mut fds = [0 as libc::c_int; 2];
    // Safety: plain pipe(2) call with a valid out-array
    let res = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(res, 0, "pipe(2) failed");
    let (rx_fd, tx_fd) = (fds[0], fds[1]);

    exec.block_on(async move {
        let written = goro::write(tx_fd, b"hello, ring").await;
        assert_eq!(written, 11);

        let mut buf = [0u8; 32];
        let read = goro::read(rx_fd, &mut buf).await;
        assert_eq!(read, 11);
        assert_eq!(&buf[..11], b"hello, ring");
    });

    // Safety: closing the descriptors this test opened
    unsafe {
        libc::close(rx_fd);
        libc::close(tx_fd);
    }
}

/// Reads park in the reactor until data arrives.
#[test]
fn read_blocks_until_data() {
    let exec = Executor::new(1).unwrap();
    let exec2 = exec.clone();

    let mut fds = [0 as libc::c_int; 2];
    // Safety: plain pipe(2) call with a valid out-array
    let res = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(res, 0, "pipe(2) failed");
    let (rx_fd, tx_fd) = (fds[0], fds[1]);

    exec.block_on(async move {
        let reader = exec2
            .spawn(async move {
                let mut buf = [0u8; 8];
                let n = goro::read(rx_fd, &mut buf).await;
                (n, buf)
            })
            .unwrap();

        goro::delay(Duration::from_millis(50)).await;
        assert_eq!(goro::write(tx_fd, b"ping").await, 4);

        let (n, buf) = reader.await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf[..4], b"ping");
    });

    // Safety: closing the descriptors this test opened
    unsafe {
        libc::close(rx_fd);
        libc::close(tx_fd);
    }
}

fn tcp_socket() -> libc::c_int {
    // Safety: plain socket(2) call
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    assert!(fd >= 0, "socket(2) failed");
    fd
}

/// Bind and listen on an ephemeral loopback port, returning the listener and
/// its address.
fn loopback_listener() -> (libc::c_int, SocketAddr) {
    let fd = tcp_socket();

    // Safety: socket/bind/listen/getsockname with valid, sized arguments
    unsafe {
        let mut addr: libc::sockaddr_in = mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_addr.s_addr = u32::from_ne_bytes(Ipv4Addr::LOCALHOST.octets());
        addr.sin_port = 0;

        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        assert_eq!(libc::bind(fd, (&raw const addr).cast(), len), 0, "bind(2) failed");
        assert_eq!(libc::listen(fd, 16), 0, "listen(2) failed");
        assert_eq!(
            libc::getsockname(fd, (&raw mut addr).cast(), &mut len),
            0,
            "getsockname(2) failed"
        );

        let port = u16::from_be(addr.sin_port);
        assert_ne!(port, 0);
        (fd, SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
    }
}

/// Connect and accept pair over loopback TCP; the acceptor observes the
/// client's address, and bytes flow across the new connection.
#[test]
fn tcp_connect_accept_roundtrip() {
    let exec = Executor::new(2).unwrap();
    let exec2 = exec.clone();

    let (listen_fd, addr) = loopback_listener();
    let client_fd = tcp_socket();

    let conn_fd = exec.block_on(async move {
        let acceptor = exec2
            .spawn(async move {
                let mut peer = None;
                let conn = goro::accept(listen_fd, Some(&mut peer)).await;
                assert!(conn >= 0, "accept failed: {conn}");
                assert_eq!(goro::write(conn, b"hello from the ring").await, 19);
                (conn, peer)
            })
            .unwrap();

        assert_eq!(goro::connect(client_fd, addr).await, 0);

        let mut buf = [0u8; 32];
        let n = goro::read(client_fd, &mut buf).await;
        assert_eq!(n, 19);
        assert_eq!(&buf[..19], b"hello from the ring");

        let (conn, peer) = acceptor.await.unwrap();
        let peer = peer.expect("accept should capture the peer address");
        assert!(peer.ip().is_loopback(), "unexpected peer {peer}");
        assert_ne!(peer.port(), 0);
        conn
    });

    // Safety: closing the descriptors this test opened
    unsafe {
        libc::close(conn_fd);
        libc::close(client_fd);
        libc::close(listen_fd);
    }
}
