// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Synchronization primitives for tasks: a bounded/rendezvous channel and a
//! cooperative mutex.
//!
//! Both park waiters as strictly FIFO queues under a per-object lock; a
//! parked task is woken by the peer operation that completes it (a receiver
//! arriving for a parked sender, an unlock for a parked locker), never
//! spuriously.

pub mod channel;
pub mod mutex;
pub(crate) mod wait_cell;

pub use crate::error::Closed;
pub use channel::Channel;
pub use mutex::{Mutex, MutexGuard};
