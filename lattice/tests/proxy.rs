// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The single-element distributed container: construction on a chosen rank,
//! migration on demand, nesting.

mod common;

use lattice::{Launch, Proxy, make_local_proxy, make_remote_proxy, rasync, remote};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct Item {
    value: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Bundle {
    items: Vec<Proxy<Item>>,
}

lattice::remote_type!(Item, Bundle);

lattice::remote_fn! {
    async fn make_seven() -> u64 { 7 }

    async fn make_tagged_item() -> Item {
        Item { value: lattice::rank() as u64 }
    }

    /// Pull a whole bundle local and sum the payloads of its entries.
    async fn sum_bundle(bundle: Proxy<Bundle>) -> u64 {
        let bundle = bundle.make_local().await.unwrap();
        let mut sum = 0;
        for item in &bundle.items {
            let item = item.make_local().await.unwrap();
            sum += item.value;
        }
        sum
    }
}

#[test]
fn empty_proxy() {
    let code = common::run_cluster(1, || async {
        let proxy = Proxy::<Item>::new();
        assert!(proxy.is_empty());
        assert!(!proxy.local());
        0
    });
    assert_eq!(code, 0);
}

#[test]
fn local_proxy_dereferences() {
    let code = common::run_cluster(1, || async {
        let proxy = make_local_proxy(Item { value: 1 });
        assert!(proxy.local());
        assert_eq!(proxy.value, 1);

        let same = proxy.make_local().await.unwrap();
        assert!(same.local());
        assert_eq!(same.value, 1);
        0
    });
    assert_eq!(code, 0);
}

#[test]
fn remote_construction_and_migration() {
    let code = common::run_cluster(2, || async {
        let proxy = remote::<make_seven>(1, ()).await.unwrap();
        assert!(!proxy.local());
        assert!(!proxy.is_empty());

        let local = proxy.make_local().await.unwrap();
        assert!(local.local());
        assert_eq!(*local, 7);
        0
    });
    assert_eq!(code, 0);
}

#[test]
fn remote_proxy_by_value() {
    let code = common::run_cluster(2, || async {
        let proxy = make_remote_proxy(1, Item { value: 13 }).await.unwrap();
        assert!(!proxy.local());

        let local = proxy.make_local().await.unwrap();
        assert_eq!(local.value, 13);
        0
    });
    assert_eq!(code, 0);
}

#[test]
fn construction_runs_on_the_addressed_rank() {
    let code = common::run_cluster(2, || async {
        let here = remote::<make_tagged_item>(0, ()).await.unwrap();
        assert!(here.local());
        assert_eq!(here.value, 0);

        let there = remote::<make_tagged_item>(1, ()).await.unwrap();
        let there = there.make_local().await.unwrap();
        assert_eq!(there.value, 1);
        0
    });
    assert_eq!(code, 0);
}

#[test]
fn nested_proxies_migrate() {
    let code = common::run_cluster(2, || async {
        let mut bundle = Bundle::default();
        for value in 0..10 {
            bundle.items.push(make_local_proxy(Item { value }));
        }
        let bundle = make_local_proxy(bundle);

        // Ship the nested structure to rank 1 as a plain argument; every
        // inner proxy promotes to a shared handle on the wire.
        let sum = rasync::<sum_bundle>(Launch::ASYNC, 1, (bundle.clone(),))
            .await
            .unwrap();
        assert_eq!(sum, (0..10).sum::<u64>());
        0
    });
    assert_eq!(code, 0);
}
