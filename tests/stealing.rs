// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use goro::Executor;
use std::collections::HashMap;
use std::hint::black_box;
use std::sync::Arc;
use std::thread::ThreadId;

const TASKS: usize = 256;

/// Spawning a burst of compute tasks from a single task lands them all on
/// one processor; the other machines must steal their share rather than let
/// the spawning processor chew through the whole burst. With four
/// processors, the entry machine (which holds the spawning processor) gets
/// to run at most a quarter of the tasks.
#[test]
fn fanout_is_stolen_across_machines() {
    let exec = Executor::new(4).unwrap();
    let exec2 = exec.clone();

    let entry_thread = std::thread::current().id();
    let ran_on = Arc::new(parking_lot::Mutex::new(HashMap::<ThreadId, usize>::new()));
    let ran_on2 = ran_on.clone();

    exec.block_on(async move {
        let handles: Vec<_> = (0..TASKS)
            .map(|i| {
                let ran_on = ran_on2.clone();
                exec2
                    .spawn(async move {
                        *ran_on.lock().entry(std::thread::current().id()).or_insert(0) += 1;
                        // tens of microseconds of "work", so the burst
                        // outlives the time it takes the other machines to
                        // spin up and steal
                        let mut acc = i as u64;
                        for _ in 0..50_000 {
                            acc = black_box(acc.wrapping_mul(6364136223846793005).wrapping_add(1));
                        }
                        black_box(acc)
                    })
                    .unwrap()
            })
            .collect();

        let mut completed = 0;
        for handle in handles {
            handle.await.unwrap();
            completed += 1;
        }
        assert_eq!(completed, TASKS);
    });

    let ran_on = ran_on.lock();
    let total: usize = ran_on.values().sum();
    assert_eq!(total, TASKS);
    assert!(
        ran_on.len() > 1,
        "all {TASKS} tasks ran on a single machine; no stealing happened"
    );

    // the whole burst was spawned onto the entry machine's processor; the
    // thieves must have relieved it of at least three quarters of the work
    let on_entry = ran_on.get(&entry_thread).copied().unwrap_or(0);
    assert!(
        on_entry <= TASKS / 4,
        "{on_entry} of {TASKS} tasks ran on the spawning processor"
    );
}
