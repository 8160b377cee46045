// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Termination with a lopsided workload: one rank floods another with
//! fire-and-forget work and finishes immediately. Nobody may exit before
//! the flood has fully run.

mod common;

use core::sync::atomic::{AtomicU64, Ordering};

const FLOOD: u64 = 2000;

static EXECUTED: AtomicU64 = AtomicU64::new(0);

lattice::remote_fn! {
    async fn tick() {
        EXECUTED.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn no_task_is_lost_on_shutdown() {
    let code = common::run_cluster(2, || async {
        for _ in 0..FLOOD {
            lattice::rexec::<tick>(1, ());
        }
        // Rank 0 is done right away; the termination barrier keeps the
        // cluster alive until rank 1 has drained the flood.
        0
    });
    assert_eq!(code, 0);
    assert_eq!(EXECUTED.load(Ordering::SeqCst), FLOOD);
}
