// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! In-process transport: every rank lives in the same OS process, wired
//! together through per-rank inbox queues.
//!
//! Delivery is FIFO per `(sender, receiver)` pair because a sender pushes in
//! program order and each inbox is a FIFO queue. Sends complete immediately
//! (enqueue is delivery).

use crate::{BarrierHandle, CommError, ProbeInfo, Rank, SendHandle, Transport};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Build an in-process mesh of `size` ranks.
///
/// Returns one transport per rank; hand each to its own runtime instance.
pub fn mesh(size: usize) -> Vec<MemTransport> {
    assert!(size > 0, "a mesh needs at least one rank");
    let shared = Arc::new(Shared {
        inboxes: (0..size).map(|_| Mutex::new(VecDeque::new())).collect(),
        barrier_entries: (0..size).map(|_| AtomicU64::new(0)).collect(),
    });
    (0..size)
        .map(|rank| MemTransport {
            rank,
            shared: Arc::clone(&shared),
        })
        .collect()
}

#[derive(Debug)]
struct Shared {
    /// `inboxes[dst]`: messages awaiting receipt on rank `dst`.
    inboxes: Vec<Mutex<VecDeque<(Rank, Vec<u8>)>>>,
    /// How many times each rank has entered the barrier.
    barrier_entries: Vec<AtomicU64>,
}

#[derive(Debug)]
pub struct MemTransport {
    rank: Rank,
    shared: Arc<Shared>,
}

// === impl MemTransport ===

impl Transport for MemTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.inboxes.len()
    }

    fn send(&self, dest: Rank, payload: Vec<u8>) -> Result<SendHandle, CommError> {
        let inbox = self
            .shared
            .inboxes
            .get(dest)
            .ok_or(CommError::InvalidRank(dest))?;
        inbox.lock().unwrap().push_back((self.rank, payload));
        Ok(SendHandle::completed())
    }

    fn try_probe(&self) -> Result<Option<ProbeInfo>, CommError> {
        let inbox = self.shared.inboxes[self.rank].lock().unwrap();
        Ok(inbox.front().map(|(src, payload)| ProbeInfo {
            src: *src,
            len: payload.len(),
        }))
    }

    fn recv(&self, info: ProbeInfo) -> Result<Vec<u8>, CommError> {
        let mut inbox = self.shared.inboxes[self.rank].lock().unwrap();
        let (src, payload) = inbox.pop_front().ok_or(CommError::Closed)?;
        debug_assert_eq!(src, info.src);
        debug_assert_eq!(payload.len(), info.len);
        Ok(payload)
    }

    fn barrier(&self) -> BarrierHandle {
        let generation = 1 + self.shared.barrier_entries[self.rank].fetch_add(1, Ordering::AcqRel);
        let shared = Arc::clone(&self.shared);
        BarrierHandle::new(move || {
            shared
                .barrier_entries
                .iter()
                .all(|entries| entries.load(Ordering::Acquire) >= generation)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_per_pair() {
        let mesh = mesh(2);
        for n in 0..10u8 {
            mesh[0].send(1, vec![n]).unwrap();
        }
        for n in 0..10u8 {
            let info = mesh[1].try_probe().unwrap().unwrap();
            assert_eq!(info, ProbeInfo { src: 0, len: 1 });
            assert_eq!(mesh[1].recv(info).unwrap(), vec![n]);
        }
        assert!(mesh[1].try_probe().unwrap().is_none());
    }

    #[test]
    fn send_completes_immediately() {
        let mesh = mesh(2);
        let handle = mesh[0].send(1, b"hello".to_vec()).unwrap();
        assert!(handle.test());
    }

    #[test]
    fn out_of_range_rank_is_rejected() {
        let mesh = mesh(2);
        assert!(matches!(
            mesh[0].send(7, Vec::new()),
            Err(CommError::InvalidRank(7))
        ));
    }

    #[test]
    fn barrier_completes_only_after_all_enter() {
        let mesh = mesh(3);
        let mut first = mesh[0].barrier();
        assert!(!first.test());
        let _second = mesh[1].barrier();
        assert!(!first.test());
        let _third = mesh[2].barrier();
        assert!(first.test());
    }

    #[test]
    fn barrier_generations_do_not_bleed() {
        let mesh = mesh(2);
        let mut first = mesh[0].barrier();
        let _ = mesh[1].barrier();
        assert!(first.test());
        // A second round on rank 0 must wait for rank 1 again.
        let mut second = mesh[0].barrier();
        assert!(!second.test());
        let _ = mesh[1].barrier();
        assert!(second.test());
    }
}
