// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The cross-rank refcounting protocol: handles broadcast to every rank,
//! dropped everywhere, and the pointee is destroyed exactly once, on its
//! home rank.

mod common;

use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;
use lattice::{Launch, SharedRptr, make_local_shared_ptr, make_shared_rptr, rasync};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Drop bookkeeping per token: (count, rank of the last drop). Tests run in
/// parallel inside one process, so each uses its own token.
static DROPS: Mutex<Option<HashMap<u64, (usize, usize)>>> = Mutex::new(None);

fn drops_of(token: u64) -> (usize, usize) {
    DROPS
        .lock()
        .unwrap()
        .get_or_insert_with(HashMap::new)
        .get(&token)
        .copied()
        .unwrap_or((0, usize::MAX))
}

#[derive(Debug, Serialize, Deserialize)]
struct Counter {
    token: u64,
}

impl Drop for Counter {
    fn drop(&mut self) {
        let mut drops = DROPS.lock().unwrap();
        let entry = drops
            .get_or_insert_with(HashMap::new)
            .entry(self.token)
            .or_insert((0, usize::MAX));
        entry.0 += 1;
        entry.1 = lattice::try_rank().unwrap_or(usize::MAX);
    }
}

/// Handles parked on non-home ranks, keyed by the holding rank (the whole
/// cluster shares one test process).
static HELD: Mutex<Option<HashMap<usize, Vec<SharedRptr<Counter>>>>> = Mutex::new(None);

static PAYLOAD_SEEN: AtomicU64 = AtomicU64::new(0);

lattice::remote_fn! {
    async fn hold(handle: SharedRptr<Counter>) {
        assert!(!handle.local(), "the pointee must stay on its home rank");
        HELD.lock()
            .unwrap()
            .get_or_insert_with(HashMap::new)
            .entry(lattice::rank())
            .or_default()
            .push(handle);
    }

    async fn release() {
        if let Some(held) = HELD.lock().unwrap().as_mut() {
            held.remove(&lattice::rank());
        }
    }

    async fn pull_copy(handle: SharedRptr<Counter>) -> u64 {
        let local = make_local_shared_ptr(&handle).await.unwrap();
        PAYLOAD_SEEN.store(local.token, Ordering::SeqCst);
        local.token
    }
}

#[test]
fn pointee_destroyed_exactly_once_on_home() {
    let code = common::run_cluster(3, || async {
        let handle = make_shared_rptr(Counter { token: 7 });
        assert!(handle.local());

        for dest in 1..lattice::size() {
            rasync::<hold>(Launch::SYNC, dest, (handle.clone(),))
                .await
                .unwrap();
        }

        // Remote copies pin the pointee even once the original is gone.
        drop(handle);
        lattice::sleep(Duration::from_millis(20)).await;
        assert_eq!(drops_of(7).0, 0);

        for dest in 1..lattice::size() {
            rasync::<release>(Launch::SYNC, dest, ()).await.unwrap();
        }

        // The decrefs race home through the same FIFO stream as the
        // replies above; give the comm loop a moment to apply them.
        for _ in 0..500 {
            if drops_of(7).0 == 1 {
                break;
            }
            lattice::sleep(Duration::from_millis(2)).await;
        }
        let (count, dropped_on) = drops_of(7);
        assert_eq!(count, 1, "destructor must run exactly once");
        assert_eq!(dropped_on, 0, "destruction happens on the home rank");
        0
    });
    assert_eq!(code, 0);
}

#[test]
fn migration_yields_a_deep_copy() {
    // Separate counter so the drop bookkeeping of the test above stays
    // untouched: deep copies drop too, all we check here is the value.
    let code = common::run_cluster(2, || async {
        let handle = make_shared_rptr(Counter { token: 99 });

        let seen = rasync::<pull_copy>(Launch::ASYNC, 1, (handle.clone(),))
            .await
            .unwrap();
        assert_eq!(seen, 99);
        assert_eq!(PAYLOAD_SEEN.load(Ordering::SeqCst), 99);

        // The local identity path: pulling a local handle is free and
        // aliases the existing instance.
        let aliased = make_local_shared_ptr(&handle).await.unwrap();
        assert_eq!(aliased.token, 99);
        0
    });
    assert_eq!(code, 0);
}

#[test]
fn null_handles_round_trip() {
    let code = common::run_cluster(1, || async {
        let null = SharedRptr::<Counter>::null();
        assert!(null.is_null());
        let bytes = bincode::serialize(&null).unwrap();
        let back: SharedRptr<Counter> = bincode::deserialize(&bytes).unwrap();
        assert!(back.is_null());
        0
    });
    assert_eq!(code, 0);
}
