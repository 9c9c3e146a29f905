// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::{criterion_group, criterion_main, Criterion};
use goro::{Channel, Executor};
use std::sync::Arc;

const PINGS: usize = 1_000;

fn yield_storm_single_processor(c: &mut Criterion) {
    c.bench_function("yield_storm_single_processor", |b| {
        b.iter(|| {
            let exec = Executor::new(1).unwrap();
            let exec2 = exec.clone();
            exec.block_on(async move {
                let h1 = exec2
                    .spawn(async {
                        for _ in 0..PINGS {
                            goro::yield_now().await;
                        }
                    })
                    .unwrap();
                let h2 = exec2
                    .spawn(async {
                        for _ in 0..PINGS {
                            goro::yield_now().await;
                        }
                    })
                    .unwrap();
                h1.await.unwrap();
                h2.await.unwrap();
            });
        });
    });
}

fn ping_pong_rendezvous(c: &mut Criterion) {
    for procs in [1usize, 2] {
        c.bench_function(&format!("ping_pong_rendezvous_{procs}p"), |b| {
            b.iter(|| {
                let exec = Executor::new(procs).unwrap();
                let exec2 = exec.clone();
                let a = Arc::new(Channel::<u32>::new(0));
                let b_chan = Arc::new(Channel::<u32>::new(0));

                exec.block_on(async move {
                    let (a2, b2) = (a.clone(), b_chan.clone());
                    let ping = exec2
                        .spawn(async move {
                            for _ in 0..PINGS {
                                a2.send(1).await.unwrap();
                                b2.recv().await.unwrap();
                            }
                        })
                        .unwrap();
                    let pong = exec2
                        .spawn(async move {
                            for _ in 0..PINGS {
                                a.recv().await.unwrap();
                                b_chan.send(2).await.unwrap();
                            }
                        })
                        .unwrap();
                    ping.await.unwrap();
                    pong.await.unwrap();
                });
            });
        });
    }
}

criterion_group!(ping_pong, yield_storm_single_processor, ping_pong_rendezvous);
criterion_main!(ping_pong);
