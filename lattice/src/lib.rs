// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A distributed, functional-style task runtime.
//!
//! A pool of OS processes connected by a message-passing transport appears
//! as one logical pool of lightweight cooperative fibers communicating by
//! serialized task messages and futures. Any rank can spawn work on any
//! other rank, receive a future for the eventual value, and compose those
//! futures into data-parallel pipelines.
//!
//! ```ignore
//! lattice::remote_fn! {
//!     pub async fn add_one(x: i32) -> i32 { x + 1 }
//! }
//!
//! fn main() {
//!     let runtime = lattice::initialize(lattice::Config::from_env()).unwrap();
//!     let code = runtime.eventloop(|| async {
//!         let answer = lattice::rasync::<add_one>(lattice::Launch::ASYNC, 1, (41,))
//!             .await
//!             .unwrap();
//!         assert_eq!(answer, 42);
//!         0
//!     });
//!     runtime.finalize();
//!     std::process::exit(code);
//! }
//! ```

mod builtin;
mod config;
pub mod proxy;
pub mod rasync;
mod rexec;
mod rptr;
mod runtime;
mod server;
pub mod shared_rptr;

pub use config::{ClusterConfig, Config};
pub use proxy::{Proxy, Remotable, make_local_proxy, make_remote_proxy, remote};
pub use rasync::{rasync, rasync_after};
pub use rexec::{RemoteFn, rexec};
pub use rptr::Rptr;
pub use runtime::{
    Runtime, rank, size, threading_disable, threading_enable, try_rank, with_comm_lock,
};
pub use shared_rptr::{SharedRptr, make_local_shared_ptr, make_shared_rptr};

// The scheduler surface users touch directly.
pub use lasync::sync::{Future, Mutex, Promise, SharedFuture, make_ready_future};
pub use lasync::{Launch, TaskError, Thread, launch, sleep, sleep_until, spawn, yield_now};

pub use lcomm::{CommError, Rank, Transport};

#[doc(hidden)]
pub use linkme as __linkme;
#[doc(hidden)]
pub use lwire as __wire;

/// Bring up transport and scheduler per `config`: a TCP mesh when cluster
/// membership is configured, a single-rank group otherwise.
///
/// # Errors
///
/// Fails if the cluster mesh cannot be established.
pub fn initialize(config: Config) -> Result<Runtime, CommError> {
    match &config.cluster {
        Some(cluster) => {
            let transport = lcomm::tcp::connect(cluster.rank, &cluster.addrs)?;
            Ok(Runtime::new(transport, &config))
        }
        None => {
            let transport = lcomm::mem::mesh(1).pop().expect("mesh of one");
            Ok(Runtime::new(transport, &config))
        }
    }
}
