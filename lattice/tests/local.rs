// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Single-rank behavior: launch modes, futures, local submission.

mod common;

use lattice::{Launch, rank, rasync, size};

lattice::remote_fn! {
    async fn add_one(x: i32) -> i32 { x + 1 }

    async fn current_rank() -> u64 { lattice::rank() as u64 }
}

#[test]
fn local_echo() {
    let code = common::run_cluster(1, || async {
        let answer = rasync::<add_one>(Launch::ASYNC, rank(), (1,)).await.unwrap();
        assert_eq!(answer, 2);
        0
    });
    assert_eq!(code, 0);
}

#[test]
fn rank_and_size_are_visible_to_fibers() {
    let code = common::run_cluster(1, || async {
        assert_eq!(rank(), 0);
        assert_eq!(size(), 1);
        let seen = rasync::<current_rank>(Launch::ASYNC, 0, ()).await.unwrap();
        assert_eq!(seen, 0);
        0
    });
    assert_eq!(code, 0);
}

#[test]
fn local_launch_modes() {
    let code = common::run_cluster(1, || async {
        let eager = rasync::<add_one>(Launch::ASYNC, 0, (10,)).await.unwrap();
        assert_eq!(eager, 11);

        let deferred = rasync::<add_one>(Launch::DEFERRED, 0, (20,));
        assert!(deferred.valid());
        assert!(!deferred.is_ready());
        assert_eq!(deferred.await.unwrap(), 21);

        let sync = rasync::<add_one>(Launch::SYNC, 0, (30,)).await.unwrap();
        assert_eq!(sync, 31);

        let detached = rasync::<add_one>(Launch::DETACHED, 0, (40,));
        assert!(!detached.valid());
        0
    });
    assert_eq!(code, 0);
}

#[test]
fn futures_are_single_consumption() {
    let code = common::run_cluster(1, || async {
        let future = rasync::<add_one>(Launch::ASYNC, 0, (1,));
        assert!(future.valid());
        let value = future.await.unwrap();
        assert_eq!(value, 2);
        // The future was consumed by awaiting it; `valid` afterwards is
        // unrepresentable by construction.
        0
    });
    assert_eq!(code, 0);
}

#[test]
fn closure_launch_composes_with_fibers() {
    let code = common::run_cluster(1, || async {
        let doubled = lattice::launch(Launch::ASYNC, || 21 * 2).await.unwrap();
        assert_eq!(doubled, 42);

        let shared = lattice::launch(Launch::ASYNC, || String::from("shared"))
            .share();
        assert_eq!(shared.get().await.unwrap(), "shared");
        assert_eq!(shared.get().await.unwrap(), "shared");
        0
    });
    assert_eq!(code, 0);
}
