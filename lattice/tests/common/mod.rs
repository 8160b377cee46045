// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Test harness: an in-process cluster, one runtime per rank, each driven by
//! its own OS thread.

use lattice::{Config, Runtime};

/// Install a per-test tracing subscriber driven by `RUST_LOG`.
#[allow(dead_code)]
pub fn trace() -> tracing::subscriber::DefaultGuard {
    use tracing_subscriber::util::SubscriberInitExt;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_thread_names(true)
        .set_default()
}

pub fn test_config() -> Config {
    Config {
        num_workers: Some(2),
        ..Config::default()
    }
}

/// Run `main0` as the user main of rank 0 in a `ranks`-wide in-process
/// cluster and return its exit code. Every other rank drives a bare event
/// loop and must come back with 0.
pub fn run_cluster<Fut>(ranks: usize, main0: impl FnOnce() -> Fut + Send + 'static) -> i32
where
    Fut: Future<Output = i32> + Send + 'static,
{
    let mut transports = lcomm::mem::mesh(ranks).into_iter();

    let zero = transports.next().unwrap();
    let zero = std::thread::spawn(move || {
        let runtime = Runtime::new(zero, &test_config());
        let code = runtime.eventloop(main0);
        runtime.finalize();
        code
    });

    let others: Vec<_> = transports
        .map(|transport| {
            std::thread::spawn(move || {
                let runtime = Runtime::new(transport, &test_config());
                let code = runtime.eventloop(|| async { 0 });
                runtime.finalize();
                code
            })
        })
        .collect();

    let code = zero.join().expect("rank 0 panicked");
    for (peer, handle) in others.into_iter().enumerate() {
        assert_eq!(
            handle.join().unwrap_or_else(|_| panic!("rank {} panicked", peer + 1)),
            0,
            "rank {} exited non-zero",
            peer + 1
        );
    }
    code
}
