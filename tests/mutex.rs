// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use goro::{Channel, Executor, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const TASKS: usize = 1000;

/// A thousand tasks increment a shared counter under the mutex with a
/// deliberate suspension point inside the critical section; mutual exclusion
/// holds iff the counter ends exactly at the task count.
#[test]
fn contended_increments() {
    let exec = Executor::new(4).unwrap();
    let exec2 = exec.clone();

    let mutex = Arc::new(Mutex::new());
    // loads and stores are separated by an await, so lost updates would be
    // inevitable without the mutex
    let counter = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(Channel::<()>::new(0));

    exec.block_on(async move {
        let waiter = {
            let done = done.clone();
            exec2
                .spawn(async move { done.recv().await })
                .unwrap()
        };

        for _ in 0..TASKS {
            let mutex = mutex.clone();
            let counter = counter.clone();
            let done = done.clone();
            exec2
                .spawn(async move {
                    let _guard = mutex.guard().await;
                    let value = counter.load(Ordering::Relaxed);
                    goro::yield_now().await;
                    counter.store(value + 1, Ordering::Relaxed);
                    if value + 1 == TASKS {
                        done.send(()).await.unwrap();
                    }
                })
                .unwrap();
        }

        waiter.await.unwrap().unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), TASKS);
    });
}

/// The bare lock flavor: acquisition through `lock()`, release through an
/// explicit `unlock()`.
#[test]
fn bare_lock_round_trip() {
    let exec = Executor::new(2).unwrap();
    let exec2 = exec.clone();

    let mutex = Arc::new(Mutex::new());
    let counter = Arc::new(AtomicUsize::new(0));

    exec.block_on(async move {
        let handles: Vec<_> = (0..100)
            .map(|_| {
                let mutex = mutex.clone();
                let counter = counter.clone();
                exec2
                    .spawn(async move {
                        let _inert = mutex.lock().await;
                        let value = counter.load(Ordering::Relaxed);
                        goro::yield_now().await;
                        counter.store(value + 1, Ordering::Relaxed);
                        mutex.unlock();
                    })
                    .unwrap()
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 100);
        assert!(!mutex.is_locked());
    });
}
