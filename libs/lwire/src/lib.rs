// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The serializable, type-erased unit of remote work.
//!
//! An [`Envelope`] is the wire image of a deferred nullary invocation: a
//! stable textual tag naming the handler plus the serialized argument tuple.
//! Handlers register themselves at link time in [`TASK_REGISTRY`], keyed by
//! the tag, so the receiving process can reconstruct the exact invocation.
//! The tag is derived from the item path at compile time, which makes it
//! identical on every rank of a homogeneous binary; this takes the place of
//! normalizing raw function addresses against an anchor symbol.

use core::fmt;
use core::pin::Pin;
use linkme::distributed_slice;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

/// The byte image of one remote task: registry tag + argument bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub name: String,
    pub payload: Vec<u8>,
}

/// The reconstructed invocation: runs exactly once, on a fiber of the
/// receiving process.
pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A link-time registration of one remote-callable handler.
pub struct TaskEntry {
    /// Stable textual identity, identical on every rank.
    pub name: &'static str,
    /// Decode the argument bytes and produce the invocation.
    pub invoke: fn(&[u8]) -> Result<TaskFuture, WireError>,
}

/// The process-global handler registry, populated at link time.
#[distributed_slice]
pub static TASK_REGISTRY: [TaskEntry];

#[derive(Debug)]
pub enum WireError {
    /// The receiving process has no handler registered under this tag.
    UnknownTask(String),
    /// Argument or envelope bytes failed to round-trip.
    Codec(bincode::Error),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::UnknownTask(name) => write!(f, "no task registered under {name:?}"),
            WireError::Codec(err) => write!(f, "task codec error: {err}"),
        }
    }
}

impl core::error::Error for WireError {}

impl From<bincode::Error> for WireError {
    fn from(err: bincode::Error) -> Self {
        WireError::Codec(err)
    }
}

// === impl Envelope ===

impl Envelope {
    /// Build an envelope for the handler `name` with the given argument
    /// tuple.
    ///
    /// # Errors
    ///
    /// Fails if the arguments do not serialize.
    pub fn new<A: Serialize>(name: &'static str, args: &A) -> Result<Self, WireError> {
        Ok(Self {
            name: name.to_string(),
            payload: bincode::serialize(args)?,
        })
    }

    /// Serialize the whole envelope for transmission.
    ///
    /// # Errors
    ///
    /// Fails if the envelope does not serialize.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        Ok(bincode::serialize(self)?)
    }

    /// Reconstruct an envelope from received bytes.
    ///
    /// # Errors
    ///
    /// Fails on malformed bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Decode an argument tuple from an envelope payload.
///
/// # Errors
///
/// Fails on malformed bytes.
pub fn decode_args<A: DeserializeOwned>(payload: &[u8]) -> Result<A, WireError> {
    Ok(bincode::deserialize(payload)?)
}

fn registry() -> &'static HashMap<&'static str, &'static TaskEntry> {
    static REGISTRY: OnceLock<HashMap<&'static str, &'static TaskEntry>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map = HashMap::with_capacity(TASK_REGISTRY.len());
        for entry in TASK_REGISTRY {
            let prev = map.insert(entry.name, entry);
            assert!(
                prev.is_none(),
                "duplicate task registration under {:?}",
                entry.name
            );
        }
        tracing::debug!(entries = map.len(), "task registry initialized");
        map
    })
}

/// Look up the handler for `envelope` and produce its invocation.
///
/// # Errors
///
/// [`WireError::UnknownTask`] if the tag is not registered on this process
/// (a fatal condition for the caller), or a codec error if the payload does
/// not match the handler's argument tuple.
pub fn dispatch(envelope: &Envelope) -> Result<TaskFuture, WireError> {
    let entry = registry()
        .get(envelope.name.as_str())
        .ok_or_else(|| WireError::UnknownTask(envelope.name.clone()))?;
    (entry.invoke)(&envelope.payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicI32, Ordering};
    use core::task::{Context, Poll, Waker};

    static LAST_SEEN: AtomicI32 = AtomicI32::new(0);

    #[distributed_slice(TASK_REGISTRY)]
    static RECORD_ENTRY: TaskEntry = TaskEntry {
        name: "lwire::tests::record",
        invoke: |payload| {
            let (value,): (i32,) = decode_args(payload)?;
            Ok(Box::pin(async move {
                LAST_SEEN.store(value, Ordering::SeqCst);
            }))
        },
    };

    fn run(mut task: TaskFuture) {
        let mut cx = Context::from_waker(Waker::noop());
        loop {
            if task.as_mut().poll(&mut cx).is_ready() {
                return;
            }
        }
    }

    #[test]
    fn envelope_round_trips() {
        let envelope = Envelope::new("lwire::tests::record", &(7i32,)).unwrap();
        let bytes = envelope.encode().unwrap();
        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded.name, envelope.name);
        assert_eq!(decoded.payload, envelope.payload);
    }

    #[test]
    fn dispatch_runs_the_registered_handler() {
        let envelope = Envelope::new("lwire::tests::record", &(41i32,)).unwrap();
        run(dispatch(&envelope).unwrap());
        assert_eq!(LAST_SEEN.load(Ordering::SeqCst), 41);
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let envelope = Envelope::new("lwire::tests::nonexistent", &()).unwrap();
        assert!(matches!(
            dispatch(&envelope),
            Err(WireError::UnknownTask(name)) if name == "lwire::tests::nonexistent"
        ));
    }

    #[test]
    fn mismatched_payload_is_a_codec_error() {
        // A record handler fed a truncated payload.
        let envelope = Envelope {
            name: "lwire::tests::record".to_string(),
            payload: vec![1],
        };
        assert!(matches!(dispatch(&envelope), Err(WireError::Codec(_))));
    }
}
