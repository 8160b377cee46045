// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Environment-driven runtime configuration.
//!
//! | variable | meaning |
//! |---|---|
//! | `LATTICE_NUM_WORKERS` | scheduler worker threads (default: hardware parallelism) |
//! | `LATTICE_STACK_SIZE` | worker stack size in bytes |
//! | `LATTICE_RANK` | this process' rank within the cluster |
//! | `LATTICE_ADDRS` | comma-separated `host:port` list, one per rank |
//!
//! Without `LATTICE_RANK`/`LATTICE_ADDRS` the process runs as a
//! single-rank group.

use lcomm::Rank;

#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Scheduler worker threads; `None` means hardware parallelism.
    pub num_workers: Option<usize>,
    /// Worker stack size in bytes; `None` means the platform default.
    pub stack_size: Option<usize>,
    /// TCP cluster membership; `None` means a single-rank group.
    pub cluster: Option<ClusterConfig>,
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub rank: Rank,
    /// One address per rank, `addrs[rank]` being ours.
    pub addrs: Vec<String>,
}

// === impl Config ===

impl Config {
    /// Read the configuration from the environment.
    ///
    /// # Panics
    ///
    /// Panics on unparseable values; a misconfigured process must not come
    /// up half-way.
    #[must_use]
    pub fn from_env() -> Self {
        let num_workers = parse_env("LATTICE_NUM_WORKERS");
        let stack_size = parse_env("LATTICE_STACK_SIZE");

        let cluster = match (
            parse_env::<Rank>("LATTICE_RANK"),
            std::env::var("LATTICE_ADDRS").ok(),
        ) {
            (Some(rank), Some(addrs)) => {
                let addrs: Vec<String> = addrs.split(',').map(|s| s.trim().to_string()).collect();
                assert!(
                    rank < addrs.len(),
                    "LATTICE_RANK {rank} outside the LATTICE_ADDRS list of {} entries",
                    addrs.len()
                );
                Some(ClusterConfig { rank, addrs })
            }
            (None, None) => None,
            _ => panic!("LATTICE_RANK and LATTICE_ADDRS must be set together"),
        };

        Self {
            num_workers,
            stack_size,
            cluster,
        }
    }
}

fn parse_env<T: core::str::FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => panic!("could not parse {name}={value}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_single_rank() {
        let config = Config::default();
        assert!(config.cluster.is_none());
        assert!(config.num_workers.is_none());
    }
}
