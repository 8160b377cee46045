// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Socket-mesh transport: one OS process per rank, a TCP connection per rank
//! pair.
//!
//! The mesh is bootstrapped from a list of addresses, one per rank: every
//! process listens on its own address, connects to all lower ranks and
//! accepts connections from all higher ranks, identifying itself with a
//! one-shot rank handshake. Messages are length-prefix framed; a writer
//! thread per peer drains an outbound channel (preserving FIFO per pair) and
//! a reader thread per peer feeds the shared inbox. The barrier is a control
//! frame carrying a generation counter, ordered through the same writer
//! channel as task frames.

use crate::{BarrierHandle, CommError, ProbeInfo, Rank, SendHandle, Transport};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CONNECT_ATTEMPTS: usize = 200;
const CONNECT_BACKOFF: Duration = Duration::from_millis(50);

const FRAME_TASK: u8 = 0;
const FRAME_BARRIER: u8 = 1;

/// Fixed-size frame preamble; bincode's legacy fixed-int encoding makes it
/// exactly 9 bytes on the wire.
#[derive(Debug, Serialize, Deserialize)]
struct FrameHeader {
    kind: u8,
    len: u64,
}

const HEADER_LEN: usize = 9;

struct Frame {
    kind: u8,
    payload: Vec<u8>,
    handle: Option<SendHandle>,
}

pub struct TcpTransport {
    rank: Rank,
    size: usize,
    /// Outbound channels, one per peer; `None` at our own slot.
    peers: Vec<Option<mpsc::Sender<Frame>>>,
    inbox: Arc<Mutex<VecDeque<(Rank, Vec<u8>)>>>,
    /// Latest barrier generation seen from each rank.
    barrier_seen: Arc<Vec<AtomicU64>>,
    barrier_entered: AtomicU64,
    closed: Arc<AtomicBool>,
    /// Kept so `Drop` can tear the connections down and unblock readers.
    streams: Vec<TcpStream>,
}

impl core::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Establish the mesh for `rank` given the address list of the whole group.
///
/// Blocks until a connection to every peer exists.
///
/// # Errors
///
/// Fails if binding the local address fails or a peer stays unreachable.
pub fn connect(rank: Rank, addrs: &[String]) -> Result<TcpTransport, CommError> {
    assert!(rank < addrs.len(), "rank {rank} outside the address list");
    let size = addrs.len();
    let listener = TcpListener::bind(&addrs[rank])?;
    tracing::debug!(rank, addr = %addrs[rank], "mesh listener up");

    let mut streams: Vec<Option<TcpStream>> = (0..size).map(|_| None).collect();

    // Connect to every lower rank, retrying while it boots.
    for peer in 0..rank {
        let mut stream = connect_with_retry(&addrs[peer])?;
        stream.set_nodelay(true)?;
        let handshake =
            bincode::serialize(&u64::try_from(rank).unwrap()).expect("u64 always serializes");
        stream.write_all(&handshake)?;
        stream.flush()?;
        tracing::debug!(rank, peer, "connected to peer");
        streams[peer] = Some(stream);
    }

    // Accept a connection from every higher rank; the handshake tells us
    // which one it is.
    for _ in rank + 1..size {
        let (mut stream, _addr) = listener.accept()?;
        stream.set_nodelay(true)?;
        let mut handshake = [0u8; 8];
        stream.read_exact(&mut handshake)?;
        let peer: u64 = bincode::deserialize(&handshake)
            .map_err(|err| CommError::Io(std::io::Error::other(err)))?;
        let peer = usize::try_from(peer).unwrap();
        if peer <= rank || peer >= size || streams[peer].is_some() {
            return Err(CommError::Io(std::io::Error::other(format!(
                "bogus handshake from rank {peer}"
            ))));
        }
        tracing::debug!(rank, peer, "accepted peer");
        streams[peer] = Some(stream);
    }

    let inbox = Arc::new(Mutex::new(VecDeque::new()));
    let barrier_seen: Arc<Vec<AtomicU64>> =
        Arc::new((0..size).map(|_| AtomicU64::new(0)).collect());
    let closed = Arc::new(AtomicBool::new(false));

    let mut peers = Vec::with_capacity(size);
    let mut kept_streams = Vec::new();
    for (peer, slot) in streams.into_iter().enumerate() {
        let Some(stream) = slot else {
            peers.push(None);
            continue;
        };
        kept_streams.push(stream.try_clone()?);

        let (tx, rx) = mpsc::channel::<Frame>();
        spawn_writer(rank, peer, stream.try_clone()?, rx);
        spawn_reader(
            peer,
            stream,
            Arc::clone(&inbox),
            Arc::clone(&barrier_seen),
            Arc::clone(&closed),
        );
        peers.push(Some(tx));
    }

    Ok(TcpTransport {
        rank,
        size,
        peers,
        inbox,
        barrier_seen,
        barrier_entered: AtomicU64::new(0),
        closed,
        streams: kept_streams,
    })
}

fn connect_with_retry(addr: &str) -> Result<TcpStream, CommError> {
    let mut last_err = None;
    for _ in 0..CONNECT_ATTEMPTS {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                last_err = Some(err);
                std::thread::sleep(CONNECT_BACKOFF);
            }
        }
    }
    Err(CommError::Io(last_err.unwrap()))
}

fn spawn_writer(rank: Rank, peer: Rank, mut stream: TcpStream, rx: mpsc::Receiver<Frame>) {
    std::thread::Builder::new()
        .name(format!("lcomm-writer-{rank}-{peer}"))
        .spawn(move || {
            while let Ok(frame) = rx.recv() {
                if let Some(handle) = &frame.handle
                    && handle.is_cancelled()
                {
                    handle.mark_done();
                    continue;
                }
                let header = FrameHeader {
                    kind: frame.kind,
                    len: u64::try_from(frame.payload.len()).unwrap(),
                };
                let header = bincode::serialize(&header).expect("header always serializes");
                let write = stream
                    .write_all(&header)
                    .and_then(|()| stream.write_all(&frame.payload))
                    .and_then(|()| stream.flush());
                if let Err(err) = write {
                    tracing::warn!(peer, %err, "writer exiting");
                    return;
                }
                if let Some(handle) = &frame.handle {
                    handle.mark_done();
                }
            }
        })
        .expect("failed to spawn transport writer thread");
}

fn spawn_reader(
    peer: Rank,
    mut stream: TcpStream,
    inbox: Arc<Mutex<VecDeque<(Rank, Vec<u8>)>>>,
    barrier_seen: Arc<Vec<AtomicU64>>,
    closed: Arc<AtomicBool>,
) {
    std::thread::Builder::new()
        .name(format!("lcomm-reader-{peer}"))
        .spawn(move || {
            loop {
                let mut header = [0u8; HEADER_LEN];
                if let Err(err) = stream.read_exact(&mut header) {
                    if !closed.load(Ordering::Acquire) {
                        tracing::warn!(peer, %err, "reader exiting");
                    }
                    return;
                }
                let Ok(FrameHeader { kind, len }) = bincode::deserialize::<FrameHeader>(&header)
                else {
                    tracing::warn!(peer, "malformed frame header, closing");
                    return;
                };
                let mut payload = vec![0u8; usize::try_from(len).unwrap()];
                if let Err(err) = stream.read_exact(&mut payload) {
                    if !closed.load(Ordering::Acquire) {
                        tracing::warn!(peer, %err, "reader exiting mid-frame");
                    }
                    return;
                }
                match kind {
                    FRAME_TASK => inbox.lock().unwrap().push_back((peer, payload)),
                    FRAME_BARRIER => {
                        let Ok(generation) = bincode::deserialize::<u64>(&payload) else {
                            tracing::warn!(peer, "malformed barrier frame, dropping");
                            continue;
                        };
                        barrier_seen[peer].fetch_max(generation, Ordering::AcqRel);
                    }
                    other => {
                        tracing::warn!(peer, kind = other, "unknown frame kind, dropping");
                    }
                }
            }
        })
        .expect("failed to spawn transport reader thread");
}

// === impl TcpTransport ===

impl Transport for TcpTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send(&self, dest: Rank, payload: Vec<u8>) -> Result<SendHandle, CommError> {
        if dest >= self.size {
            return Err(CommError::InvalidRank(dest));
        }
        if dest == self.rank {
            self.inbox.lock().unwrap().push_back((self.rank, payload));
            return Ok(SendHandle::completed());
        }
        let handle = SendHandle::new();
        let frame = Frame {
            kind: FRAME_TASK,
            payload,
            handle: Some(handle.clone()),
        };
        self.peers[dest]
            .as_ref()
            .expect("peer channel missing")
            .send(frame)
            .map_err(|_| CommError::Closed)?;
        Ok(handle)
    }

    fn try_probe(&self) -> Result<Option<ProbeInfo>, CommError> {
        let inbox = self.inbox.lock().unwrap();
        Ok(inbox.front().map(|(src, payload)| ProbeInfo {
            src: *src,
            len: payload.len(),
        }))
    }

    fn recv(&self, info: ProbeInfo) -> Result<Vec<u8>, CommError> {
        let mut inbox = self.inbox.lock().unwrap();
        let (src, payload) = inbox.pop_front().ok_or(CommError::Closed)?;
        debug_assert_eq!(src, info.src);
        Ok(payload)
    }

    fn barrier(&self) -> BarrierHandle {
        let generation = 1 + self.barrier_entered.fetch_add(1, Ordering::AcqRel);
        // Our own entry counts immediately; peers learn about it through a
        // control frame ordered after everything we sent so far.
        self.barrier_seen[self.rank].fetch_max(generation, Ordering::AcqRel);
        for peer in self.peers.iter().flatten() {
            let frame = Frame {
                kind: FRAME_BARRIER,
                payload: bincode::serialize(&generation).expect("u64 always serializes"),
                handle: None,
            };
            // A dead peer channel shows up as an i/o failure elsewhere.
            let _ = peer.send(frame);
        }
        let barrier_seen = Arc::clone(&self.barrier_seen);
        BarrierHandle::new(move || {
            barrier_seen
                .iter()
                .all(|seen| seen.load(Ordering::Acquire) >= generation)
        })
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        for stream in &self.streams {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::util::SubscriberInitExt;

    fn free_addrs(n: usize) -> Vec<String> {
        // Bind to ephemeral ports, remember them, release the listeners.
        (0..n)
            .map(|_| {
                let listener = TcpListener::bind("127.0.0.1:0").unwrap();
                listener.local_addr().unwrap().to_string()
            })
            .collect()
    }

    #[test]
    fn two_rank_round_trip() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .set_default();

        let addrs = free_addrs(2);
        let addrs2 = addrs.clone();
        let peer = std::thread::spawn(move || {
            let transport = connect(1, &addrs2).unwrap();
            // Echo one message back.
            let payload = loop {
                if let Some(info) = transport.try_probe().unwrap() {
                    break transport.recv(info).unwrap();
                }
                std::thread::sleep(Duration::from_millis(1));
            };
            transport.send(0, payload).unwrap();
            let mut barrier = transport.barrier();
            while !barrier.test() {
                std::thread::sleep(Duration::from_millis(1));
            }
        });

        let transport = connect(0, &addrs).unwrap();
        transport.send(1, b"ping".to_vec()).unwrap();
        let echoed = loop {
            if let Some(info) = transport.try_probe().unwrap() {
                break transport.recv(info).unwrap();
            }
            std::thread::sleep(Duration::from_millis(1));
        };
        assert_eq!(echoed, b"ping");
        let mut barrier = transport.barrier();
        while !barrier.test() {
            std::thread::sleep(Duration::from_millis(1));
        }
        peer.join().unwrap();
    }
}
