// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The classic tree-recursive Fibonacci, scattered across the cluster: each
//! recursion level launches its left subtree on another rank.

use lattice::{Config, Launch, rasync};

lattice::remote_fn! {
    async fn fib(n: u64) -> u64 {
        // Below the grain size the tree is evaluated serially.
        if n < 16 {
            let (mut a, mut b) = (0u64, 1u64);
            for _ in 0..n {
                (a, b) = (b, a + b);
            }
            return a;
        }
        let left = (lattice::rank() + 1) % lattice::size();
        let a = rasync::<fib>(Launch::ASYNC, left, (n - 1,));
        let b = rasync::<fib>(Launch::ASYNC, lattice::rank(), (n - 2,));
        a.await.unwrap() + b.await.unwrap()
    }
}

fn main() {
    let runtime = lattice::initialize(Config::from_env()).expect("cluster bring-up failed");

    let code = runtime.eventloop(|| async {
        let n = std::env::var("FIB_N")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(24);
        let value = rasync::<fib>(Launch::ASYNC, lattice::rank(), (n,)).await.unwrap();
        println!("fib({n}) = {value}");
        0
    });

    runtime.finalize();
    std::process::exit(code);
}
