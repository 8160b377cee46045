// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A serializable shared pointer with owning semantics across ranks.
//!
//! On its home rank a `SharedRptr` is an ordinary strong reference. Every
//! wire copy pins the pointee in the home's pin table; a copy serialized
//! from a non-home rank enqueues an incref to the home *before* the payload
//! leaves, so the home count cannot drop to zero while the copy is in
//! flight. Copies received on a non-home rank coalesce into one local handle
//! per `(home, addr)`; when the last one drops, a decref goes home. The
//! pointee is destroyed exactly once, on its home rank, when the pin count
//! and the home-side handles are both gone.
//!
//! Reference cycles spanning ranks are not collected: do not form them.

use crate::builtin;
use crate::rasync::ResultSlot;
use crate::runtime::{self, RuntimeCore};
use core::fmt;
use core::marker::PhantomData;
use lasync::TaskError;
use lasync::sync::{self, Promise, make_ready_future};
use lcomm::Rank;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::{Arc, Weak};

pub struct SharedRptr<T> {
    inner: Option<Inner<T>>,
}

pub(crate) enum Inner<T> {
    /// The pointee lives here; this is an ordinary strong reference.
    Home(Arc<T>),
    /// The pointee lives on another rank; the handle owns one count in the
    /// home's pin table.
    Remote(Arc<RemoteHandle>, PhantomData<fn() -> T>),
}

/// The per-rank embodiment of a remote pointee: all local `SharedRptr`
/// copies for one `(home, addr)` share this allocation, so the `Arc` strong
/// count *is* the local count of the refcounting protocol.
pub(crate) struct RemoteHandle {
    home: Rank,
    addr: u64,
    core: Weak<RuntimeCore>,
}

/// Serialized form: the home rank (or -1 for null) and the pointee address.
#[derive(Serialize, Deserialize)]
struct WireRef {
    proc: i64,
    addr: u64,
}

/// Box `value` on the calling rank and hand out the first strong reference.
pub fn make_shared_rptr<T>(value: T) -> SharedRptr<T>
where
    T: Send + Sync + 'static,
{
    SharedRptr {
        inner: Some(Inner::Home(Arc::new(value))),
    }
}

/// Pull a local deep copy of the pointee into the caller's address space.
///
/// For a home handle this is the identity: the future is ready immediately
/// with the existing local reference. For a remote handle, a fetch task runs
/// on the home and ships the pointee's bytes back.
pub fn make_local_shared_ptr<T>(ptr: &SharedRptr<T>) -> sync::Future<Arc<T>>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    match &ptr.inner {
        None => panic!("make_local_shared_ptr on a null shared remote pointer"),
        Some(Inner::Home(arc)) => make_ready_future(Arc::clone(arc)),
        Some(Inner::Remote(handle, _)) => {
            let core = runtime::current();
            let mut promise: Promise<Arc<T>> = Promise::new();
            let future = promise.future();
            let slot = ResultSlot::new(Box::new(move |bytes| {
                let mut promise = promise;
                match bincode::deserialize::<Result<T, String>>(&bytes) {
                    Ok(Ok(value)) => promise.set_value(Arc::new(value)),
                    Ok(Err(panic)) => promise.set_error(TaskError::Panicked(panic)),
                    Err(err) => promise.set_error(TaskError::Panicked(format!(
                        "migration decode failed: {err}"
                    ))),
                }
            }))
            .leak();
            core.enqueue_task(handle.home, builtin::FETCH, &(handle.addr, slot));
            future
        }
    }
}

// === impl SharedRptr ===

impl<T> SharedRptr<T> {
    /// The null handle.
    #[must_use]
    pub fn null() -> Self {
        Self { inner: None }
    }

    pub(crate) fn from_arc(arc: Arc<T>) -> Self {
        Self {
            inner: Some(Inner::Home(arc)),
        }
    }

    pub(crate) fn from_inner(inner: Option<Inner<T>>) -> Self {
        Self { inner }
    }

    pub(crate) fn take_inner(self) -> Option<Inner<T>> {
        self.inner
    }

    pub fn is_null(&self) -> bool {
        self.inner.is_none()
    }

    /// Whether the pointee lives on the calling rank.
    ///
    /// # Panics
    ///
    /// Panics on a null handle.
    pub fn local(&self) -> bool {
        match self.inner.as_ref().expect("null shared remote pointer") {
            Inner::Home(_) => true,
            Inner::Remote(..) => false,
        }
    }

    /// The local strong reference, if the pointee lives here.
    pub fn get(&self) -> Option<&Arc<T>> {
        match &self.inner {
            Some(Inner::Home(arc)) => Some(arc),
            _ => None,
        }
    }

    /// The rank the pointee lives on.
    pub fn home(&self) -> Option<Rank> {
        match &self.inner {
            None => None,
            Some(Inner::Home(_)) => Some(runtime::rank()),
            Some(Inner::Remote(handle, _)) => Some(handle.home),
        }
    }

    /// The pointee's address on its home rank, a stable identity for
    /// equality checks across ranks.
    pub fn addr(&self) -> Option<u64> {
        match &self.inner {
            None => None,
            Some(Inner::Home(arc)) => Some(Arc::as_ptr(arc) as usize as u64),
            Some(Inner::Remote(handle, _)) => Some(handle.addr),
        }
    }
}

impl<T> Default for SharedRptr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> Clone for SharedRptr<T> {
    fn clone(&self) -> Self {
        let inner = match &self.inner {
            None => None,
            Some(Inner::Home(arc)) => Some(Inner::Home(Arc::clone(arc))),
            Some(Inner::Remote(handle, _)) => {
                Some(Inner::Remote(Arc::clone(handle), PhantomData))
            }
        };
        Self { inner }
    }
}

impl<T> std::ops::Deref for SharedRptr<T> {
    type Target = T;

    /// Dereference the pointee.
    ///
    /// # Panics
    ///
    /// Panics unless the pointee lives on the calling rank.
    fn deref(&self) -> &T {
        match &self.inner {
            Some(Inner::Home(arc)) => arc,
            _ => panic!("dereferencing a non-local shared remote pointer"),
        }
    }
}

impl<T> fmt::Debug for SharedRptr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            None => f.write_str("SharedRptr(null)"),
            Some(Inner::Home(arc)) => {
                write!(f, "SharedRptr(home:{:#x})", Arc::as_ptr(arc) as usize)
            }
            Some(Inner::Remote(handle, _)) => {
                write!(f, "SharedRptr({}:{:#x})", handle.home, handle.addr)
            }
        }
    }
}

impl<T> Serialize for SharedRptr<T>
where
    T: Serialize + Send + Sync + 'static,
{
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let wire = match &self.inner {
            None => WireRef { proc: -1, addr: 0 },
            Some(Inner::Home(arc)) => {
                // Each wire copy owns one pin count; taken here, on the
                // home, synchronously.
                let core = runtime::current();
                let addr = core.pin(arc);
                WireRef {
                    proc: i64::try_from(core.rank()).unwrap(),
                    addr,
                }
            }
            Some(Inner::Remote(handle, _)) => {
                // Forwarding a remote handle: the incref must reach the home
                // while our own count still pins the pointee, so enqueue it
                // before the payload leaves.
                let core = runtime::current();
                core.enqueue_incref(handle.home, handle.addr);
                WireRef {
                    proc: i64::try_from(handle.home).unwrap(),
                    addr: handle.addr,
                }
            }
        };
        wire.serialize(serializer)
    }
}

impl<'de, T> Deserialize<'de> for SharedRptr<T>
where
    T: Send + Sync + 'static,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireRef::deserialize(deserializer)?;
        if wire.proc < 0 {
            return Ok(Self::null());
        }
        let home = usize::try_from(wire.proc).map_err(serde::de::Error::custom)?;
        let core = runtime::current();
        if home == core.rank() {
            // The copy came back home: reclaim its pin count and use the
            // ordinary local reference.
            Ok(Self {
                inner: Some(Inner::Home(core.unpin_claim::<T>(wire.addr))),
            })
        } else {
            Ok(Self {
                inner: Some(Inner::Remote(
                    core.adopt_remote(home, wire.addr),
                    PhantomData,
                )),
            })
        }
    }
}

// === impl RemoteHandle ===

impl RemoteHandle {
    pub(crate) fn new(home: Rank, addr: u64, core: Weak<RuntimeCore>) -> Self {
        Self { home, addr, core }
    }
}

impl Drop for RemoteHandle {
    fn drop(&mut self) {
        // The last local copy for this (home, addr) is gone; release the
        // wire copy's count at the home.
        if let Some(core) = self.core.upgrade() {
            core.forget_remote(self.home, self.addr);
            core.enqueue_decref(self.home, self.addr);
        }
    }
}
