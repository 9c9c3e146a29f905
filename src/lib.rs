// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An M:N cooperative task runtime for Linux.
//!
//! Tasks are plain [`Future`]s multiplexed over a fixed pool of *processors*
//! (execution contexts with a local run queue and an owned io_uring reactor)
//! by a growing-on-demand set of *machines* (OS threads). Work distribution
//! follows the machine/processor/task triad: spawns land on the current
//! processor's hot slot, idle machines steal half-batches from running
//! processors or drain the global injector queue, and a processor with
//! outstanding I/O parks *inside* its reactor where it can be kicked awake
//! through an eventfd when new work appears elsewhere.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! let exec = goro::Executor::new(2).unwrap();
//! exec.block_on(async {
//!     goro::delay(Duration::from_millis(10)).await;
//! });
//! ```

mod error;
pub mod executor;
mod loom;
pub mod reactor;
pub mod sync;
pub mod task;

pub use error::{Closed, SpawnError};
pub use executor::Executor;
pub use reactor::op::{accept, connect, delay, read, write};
pub use sync::{Channel, Mutex};
pub use task::{yield_now, JoinHandle};
