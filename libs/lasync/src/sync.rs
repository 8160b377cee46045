// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Synchronization primitives for fibers.
//!
//! [`WaitCell`] and [`WaitQueue`] are the primitive layer: a slot for a
//! single waiting fiber and a FIFO queue of waiting fibers. [`Promise`],
//! [`Future`], [`SharedFuture`] and [`Mutex`] are built on top of them.

mod mutex;
mod promise;
mod wait_cell;
mod wait_queue;

pub use crate::error::Closed;
pub use mutex::{Mutex, MutexGuard};
pub use promise::{Future, Promise, SharedFuture, deferred_future, make_ready_future};
pub use wait_cell::WaitCell;
pub use wait_queue::WaitQueue;
