// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Process-group transport contract.
//!
//! A [`Transport`] connects a fixed set of processes ("ranks") with reliable,
//! FIFO-per-pair byte messaging, a non-blocking probe/receive pair and a
//! non-blocking barrier. All calls are made from a single communication
//! thread per process; only [`Transport::send`] may additionally be called
//! from worker threads.
//!
//! Two implementations are provided: [`mem`] wires the ranks of one OS
//! process together through in-memory queues (the test substrate), [`tcp`]
//! connects OS processes through a socket mesh.

pub mod mem;
pub mod tcp;

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The integer identity of a process within the process group, in
/// `[0, size)`.
pub type Rank = usize;

#[derive(Debug)]
pub enum CommError {
    /// The transport has been shut down.
    Closed,
    /// A destination rank outside `[0, size)`.
    InvalidRank(Rank),
    /// An I/O failure on the underlying connection. Fatal; there is no retry
    /// policy.
    Io(std::io::Error),
}

impl fmt::Display for CommError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommError::Closed => f.write_str("transport closed"),
            CommError::InvalidRank(rank) => write!(f, "rank {rank} out of range"),
            CommError::Io(err) => write!(f, "transport i/o error: {err}"),
        }
    }
}

impl core::error::Error for CommError {}

impl From<std::io::Error> for CommError {
    fn from(err: std::io::Error) -> Self {
        CommError::Io(err)
    }
}

/// Source and size of a probed inbound message.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ProbeInfo {
    pub src: Rank,
    pub len: usize,
}

/// Handle to an in-flight outbound message.
#[derive(Debug, Clone)]
pub struct SendHandle {
    done: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
}

/// Handle to a pending barrier entry. [`test`][BarrierHandle::test] is
/// non-blocking and returns `true` once every rank has entered.
pub struct BarrierHandle(Box<dyn FnMut() -> bool + Send>);

/// An MPI-like process group: rank identity plus non-blocking tagged
/// messaging and a non-blocking barrier.
///
/// Delivery is reliable and FIFO per `(sender, receiver)` pair; the barrier
/// entry of a sender is ordered after all messages it sent before entering.
pub trait Transport: Send + Sync + 'static {
    fn rank(&self) -> Rank;

    fn size(&self) -> usize;

    /// Initiate a non-blocking send of `payload` to `dest`.
    ///
    /// # Errors
    ///
    /// Fails if `dest` is out of range or the transport is closed.
    fn send(&self, dest: Rank, payload: Vec<u8>) -> Result<SendHandle, CommError>;

    /// Non-blocking probe for the next inbound message.
    ///
    /// # Errors
    ///
    /// Fails if the transport is closed.
    fn try_probe(&self) -> Result<Option<ProbeInfo>, CommError>;

    /// Receive the message previously reported by [`try_probe`][Transport::try_probe].
    ///
    /// Must be called from the same thread as the probe, with no intervening
    /// receive.
    ///
    /// # Errors
    ///
    /// Fails if the message has vanished, which indicates a protocol bug.
    fn recv(&self, info: ProbeInfo) -> Result<Vec<u8>, CommError>;

    /// Enter the non-blocking barrier.
    fn barrier(&self) -> BarrierHandle;
}

// === impl SendHandle ===

impl SendHandle {
    pub(crate) fn new() -> Self {
        Self {
            done: Arc::new(AtomicBool::new(false)),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A handle whose send already completed.
    pub(crate) fn completed() -> Self {
        let handle = Self::new();
        handle.done.store(true, Ordering::Release);
        handle
    }

    pub(crate) fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Whether the send has completed (the payload was handed to the peer or
    /// its connection).
    pub fn test(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Best-effort cancellation of a send that has not started yet.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

// === impl BarrierHandle ===

impl BarrierHandle {
    pub(crate) fn new(test: impl FnMut() -> bool + Send + 'static) -> Self {
        Self(Box::new(test))
    }

    /// Whether the barrier has completed on all ranks.
    pub fn test(&mut self) -> bool {
        (self.0)()
    }
}

impl fmt::Debug for BarrierHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BarrierHandle")
    }
}
