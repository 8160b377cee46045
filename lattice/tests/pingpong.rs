// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A fire-and-forget chain bouncing between ranks: every hop runs exactly
//! once, the final hop fulfills a promise on the originating rank, and the
//! whole exchange quiesces.

mod common;

use core::sync::atomic::{AtomicU64, Ordering};
use lattice::Promise;
use std::sync::Mutex;

const HOPS: u64 = 999;

static HITS: AtomicU64 = AtomicU64::new(0);
/// The promise the last hop fulfills; the cluster shares one process, so
/// only rank 0 ever stores something here.
static DONE: Mutex<Option<Promise<()>>> = Mutex::new(None);

lattice::remote_fn! {
    async fn ping(n: u64) {
        HITS.fetch_add(1, Ordering::SeqCst);
        if n == 0 {
            assert_eq!(lattice::rank(), 0, "chain must end where it started");
            if let Some(mut promise) = DONE.lock().unwrap().take() {
                promise.set_value(());
            }
        } else {
            let next = (lattice::rank() + 1) % lattice::size();
            lattice::rexec::<ping>(next, (n - 1,));
        }
    }
}

#[test]
fn ping_pong_chain_completes() {
    let _trace = common::trace();
    let code = common::run_cluster(2, || async {
        let mut promise = Promise::new();
        let done = promise.future();
        *DONE.lock().unwrap() = Some(promise);

        // HOPS is odd, so after HOPS hops starting at rank 1 the final
        // (n == 0) hop executes back on rank 0.
        lattice::rexec::<ping>(1, (HOPS,));

        done.await.unwrap();
        assert_eq!(HITS.load(Ordering::SeqCst), HOPS + 1);
        0
    });
    assert_eq!(code, 0);
}
