// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use goro::{Channel, Executor};
use std::sync::Arc;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const ROUNDS: u32 = 1000;

#[test]
fn ping_pong_rendezvous() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .set_default();

    let exec = Executor::new(2).unwrap();
    let exec2 = exec.clone();

    let a = Arc::new(Channel::<u32>::new(0));
    let b = Arc::new(Channel::<u32>::new(0));

    exec.block_on(async move {
        let (a2, b2) = (a.clone(), b.clone());

        let ping = exec2
            .spawn(async move {
                for _ in 0..ROUNDS {
                    a2.send(1).await.unwrap();
                    assert_eq!(b2.recv().await.unwrap(), 2);
                }
            })
            .unwrap();

        let pong = exec2
            .spawn(async move {
                for _ in 0..ROUNDS {
                    assert_eq!(a.recv().await.unwrap(), 1);
                    b.send(2).await.unwrap();
                }
            })
            .unwrap();

        ping.await.unwrap();
        pong.await.unwrap();
    });
}

#[test]
fn ping_pong_single_processor() {
    let exec = Executor::new(1).unwrap();
    let exec2 = exec.clone();

    let a = Arc::new(Channel::<u32>::new(0));
    let b = Arc::new(Channel::<u32>::new(0));

    exec.block_on(async move {
        let (a2, b2) = (a.clone(), b.clone());

        let ping = exec2
            .spawn(async move {
                for i in 0..ROUNDS {
                    a2.send(i).await.unwrap();
                    b2.recv().await.unwrap();
                }
            })
            .unwrap();

        for i in 0..ROUNDS {
            assert_eq!(a.recv().await.unwrap(), i);
            b.send(i).await.unwrap();
        }

        ping.await.unwrap();
    });
}
