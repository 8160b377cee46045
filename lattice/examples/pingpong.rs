// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Round-trip latency probe: bounce a counter between rank 0 and rank 1.
//!
//! Run one process per rank, e.g.:
//!
//! ```sh
//! LATTICE_RANK=0 LATTICE_ADDRS=localhost:9410,localhost:9411 cargo run --example pingpong &
//! LATTICE_RANK=1 LATTICE_ADDRS=localhost:9410,localhost:9411 cargo run --example pingpong
//! ```

use lattice::{Config, Launch, rasync};
use std::time::Instant;

const ROUNDS: u32 = 1000;

lattice::remote_fn! {
    async fn bounce(n: u32) -> u32 { n + 1 }
}

fn main() {
    let runtime = lattice::initialize(Config::from_env()).expect("cluster bring-up failed");

    let code = runtime.eventloop(|| async {
        if lattice::size() < 2 {
            eprintln!("pingpong needs at least two ranks");
            return 1;
        }

        let start = Instant::now();
        let mut counter = 0;
        for _ in 0..ROUNDS {
            counter = rasync::<bounce>(Launch::SYNC, 1, (counter,)).await.unwrap();
        }
        let elapsed = start.elapsed();

        assert_eq!(counter, ROUNDS);
        println!(
            "{ROUNDS} round trips in {elapsed:?} ({:?} per round trip)",
            elapsed / ROUNDS
        );
        0
    });

    runtime.finalize();
    std::process::exit(code);
}
