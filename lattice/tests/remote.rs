// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cross-rank submission: remote echo, launch modes, panic capture,
//! future-of-rank submission.

mod common;

use lattice::{Launch, TaskError, make_ready_future, rasync, rasync_after};

lattice::remote_fn! {
    async fn add_one(x: i32) -> i32 { x + 1 }

    async fn remote_rank() -> u64 { lattice::rank() as u64 }

    async fn concat(prefix: String, suffix: String) -> String {
        format!("{prefix}{suffix}")
    }

    async fn blow_up() -> i32 { panic!("deliberate failure") }
}

#[test]
fn remote_echo() {
    let _trace = common::trace();
    let code = common::run_cluster(2, || async {
        let answer = rasync::<add_one>(Launch::ASYNC, 1, (41,)).await.unwrap();
        assert_eq!(answer, 42);
        0
    });
    assert_eq!(code, 0);
}

#[test]
fn work_runs_on_the_addressed_rank() {
    let code = common::run_cluster(3, || async {
        for dest in 0..lattice::size() {
            let seen = rasync::<remote_rank>(Launch::ASYNC, dest, ()).await.unwrap();
            assert_eq!(seen, dest as u64);
        }
        0
    });
    assert_eq!(code, 0);
}

#[test]
fn sync_mode_observes_the_same_value() {
    let code = common::run_cluster(2, || async {
        let eager = rasync::<concat>(
            Launch::ASYNC,
            1,
            ("lat".to_string(), "tice".to_string()),
        )
        .await
        .unwrap();
        let synced = rasync::<concat>(
            Launch::SYNC,
            1,
            ("lat".to_string(), "tice".to_string()),
        )
        .await
        .unwrap();
        assert_eq!(eager, synced);
        assert_eq!(eager, "lattice");
        0
    });
    assert_eq!(code, 0);
}

#[test]
fn deferred_submits_from_the_consuming_fiber() {
    let code = common::run_cluster(2, || async {
        let deferred = rasync::<add_one>(Launch::DEFERRED, 1, (5,));
        assert!(deferred.valid());
        assert!(!deferred.is_ready());
        assert_eq!(deferred.await.unwrap(), 6);
        0
    });
    assert_eq!(code, 0);
}

#[test]
fn detached_submission_terminates() {
    let code = common::run_cluster(2, || async {
        let invalid = rasync::<add_one>(Launch::DETACHED, 1, (1,));
        assert!(!invalid.valid());
        0
    });
    assert_eq!(code, 0);
}

#[test]
fn remote_panic_is_captured_in_the_future() {
    let code = common::run_cluster(2, || async {
        let outcome = rasync::<blow_up>(Launch::ASYNC, 1, ()).await;
        match outcome {
            Err(TaskError::Panicked(msg)) => assert!(msg.contains("deliberate failure")),
            other => panic!("expected a captured panic, got {other:?}"),
        }
        0
    });
    assert_eq!(code, 0);
}

#[test]
fn destination_may_itself_be_a_future() {
    let code = common::run_cluster(2, || async {
        let dest = make_ready_future(1usize);
        let answer = rasync_after::<add_one>(Launch::ASYNC, dest, (99,)).await.unwrap();
        assert_eq!(answer, 100);

        let dest = lattice::launch(Launch::ASYNC, || 1usize).then(|r| r.unwrap());
        let answer = rasync_after::<add_one>(Launch::DEFERRED, dest, (7,)).await.unwrap();
        assert_eq!(answer, 8);
        0
    });
    assert_eq!(code, 0);
}
