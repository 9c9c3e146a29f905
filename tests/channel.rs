// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use goro::{Channel, Executor};
use std::collections::HashMap;
use std::sync::Arc;

const SENDERS: u64 = 4;
const PER_SENDER: u64 = 250;

/// Many senders, one receiver: everything sent is received exactly once, and
/// per-sender ordering survives the trip through a small buffer.
#[test]
fn multiset_and_per_sender_fifo() {
    let exec = Executor::new(4).unwrap();
    let exec2 = exec.clone();

    let chan = Arc::new(Channel::<(u64, u64)>::new(4));

    exec.block_on(async move {
        for sender in 0..SENDERS {
            let chan = chan.clone();
            exec2
                .spawn(async move {
                    for seq in 0..PER_SENDER {
                        chan.send((sender, seq)).await.unwrap();
                    }
                })
                .unwrap();
        }

        let mut last_seq: HashMap<u64, u64> = HashMap::new();
        let mut received = 0u64;
        while received < SENDERS * PER_SENDER {
            let (sender, seq) = chan.recv().await.unwrap();
            if let Some(&prev) = last_seq.get(&sender) {
                assert!(seq > prev, "sender {sender} reordered: {seq} after {prev}");
            }
            last_seq.insert(sender, seq);
            received += 1;
        }

        // every sender delivered its full sequence
        for sender in 0..SENDERS {
            assert_eq!(last_seq[&sender], PER_SENDER - 1);
        }
    });
}

/// A rendezvous send does not complete before a receiver has the value.
#[test]
fn rendezvous_is_synchronous() {
    let exec = Executor::new(2).unwrap();
    let exec2 = exec.clone();

    let chan = Arc::new(Channel::<u64>::new(0));
    let observed = Arc::new(std::sync::atomic::AtomicU64::new(u64::MAX));

    exec.block_on(async move {
        let receiver = {
            let chan = chan.clone();
            let observed = observed.clone();
            exec2
                .spawn(async move {
                    let value = chan.recv().await.unwrap();
                    observed.store(value, std::sync::atomic::Ordering::SeqCst);
                })
                .unwrap()
        };

        chan.send(7).await.unwrap();
        receiver.await.unwrap();
        assert_eq!(observed.load(std::sync::atomic::Ordering::SeqCst), 7);
    });
}

/// Closing a channel with a full buffer and parked senders: the parked
/// senders resume with `Closed`, the buffer stays receivable, and the first
/// receive past the buffer observes `Closed`.
#[test]
fn close_drains_parked_senders() {
    let exec = Executor::new(2).unwrap();
    let exec2 = exec.clone();

    let chan = Arc::new(Channel::<u64>::new(4));

    exec.block_on(async move {
        for i in 0..4 {
            chan.send(i).await.unwrap();
        }

        // two more senders park on the full buffer
        let parked: Vec<_> = (4..6)
            .map(|i| {
                let chan = chan.clone();
                exec2.spawn(async move { chan.send(i).await }).unwrap()
            })
            .collect();

        // give the parked senders a chance to reach their parking spot; a
        // sender that races with the close sees Closed on its first poll
        // instead, which satisfies the same contract
        for _ in 0..10 {
            goro::yield_now().await;
        }

        chan.close();

        for handle in parked {
            assert!(handle.await.unwrap().is_err(), "parked sender should see Closed");
        }

        for i in 0..4 {
            assert_eq!(chan.recv().await.unwrap(), i);
        }
        assert!(chan.recv().await.is_err());
        assert!(chan.send(9).await.is_err());
    });
}
