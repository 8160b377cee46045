// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A single-element distributed container.
//!
//! A [`Proxy`] is empty, local (a strong reference to an instance in this
//! address space) or remote (a [`SharedRptr`] to an instance on another
//! rank). A non-empty proxy always denotes exactly one logical value.
//! Proxies serialize by promoting a local payload to a shared remote handle,
//! so they nest and travel freely.

use crate::rasync::ResultSlot;
use crate::rexec::RemoteFn;
use crate::runtime;
use crate::shared_rptr::{Inner, SharedRptr, make_local_shared_ptr, make_shared_rptr};
use core::fmt;
use lasync::TaskError;
use lasync::sync::Promise;
use lcomm::Rank;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::Arc;

pub struct Proxy<T> {
    inner: ProxyInner<T>,
}

enum ProxyInner<T> {
    Empty,
    Local(Arc<T>),
    Remote(SharedRptr<T>),
}

/// A type whose values can be constructed on a chosen rank by shipping them
/// over the wire. Declare with [`remote_type!`][crate::remote_type]; the
/// registration makes the receiving rank able to box the value.
pub trait Remotable: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Registry tag of the boxing handler.
    const BOX_NAME: &'static str;
}

/// Construct a proxy holding a local instance.
pub fn make_local_proxy<T>(value: T) -> Proxy<T>
where
    T: Send + Sync + 'static,
{
    Proxy {
        inner: ProxyInner::Local(Arc::new(value)),
    }
}

/// Construct `value` on rank `dest` and return a proxy to it.
///
/// # Errors
///
/// Reports a broken or panicked construction task.
pub async fn make_remote_proxy<T: Remotable>(dest: Rank, value: T) -> Result<Proxy<T>, TaskError> {
    let core = runtime::current();
    if dest == core.rank() {
        return Ok(make_local_proxy(value));
    }
    let mut promise: Promise<SharedRptr<T>> = Promise::new();
    let future = promise.future();
    let slot = ResultSlot::for_promise(promise).leak();
    core.enqueue_task(dest, T::BOX_NAME, &(slot, value));
    Ok(Proxy::from_shared(future.await?))
}

/// The general remote constructor: run `F` on rank `dest`, box the result
/// there, return a proxy to it.
///
/// # Errors
///
/// Reports a broken or panicked remote task.
pub async fn remote<F: RemoteFn>(dest: Rank, args: F::Args) -> Result<Proxy<F::Output>, TaskError>
where
    F::Output: Send + Sync + 'static,
{
    let core = runtime::current();
    if dest == core.rank() {
        return Ok(make_local_proxy(F::call(args).await));
    }
    let mut promise: Promise<SharedRptr<F::Output>> = Promise::new();
    let future = promise.future();
    let slot = ResultSlot::for_promise(promise).leak();
    core.enqueue_task(dest, F::NAME_BOXED, &(slot, args));
    Ok(Proxy::from_shared(future.await?))
}

/// Declare types whose values may be shipped to another rank with
/// [`make_remote_proxy`].
#[macro_export]
macro_rules! remote_type {
    ($($ty:ty),* $(,)?) => {$(
        impl $crate::Remotable for $ty {
            const BOX_NAME: &'static str =
                concat!(module_path!(), "::<", stringify!($ty), ">#box");
        }

        const _: () = {
            #[$crate::__linkme::distributed_slice($crate::__wire::TASK_REGISTRY)]
            #[linkme(crate = $crate::__linkme)]
            static BOX: $crate::__wire::TaskEntry = $crate::__wire::TaskEntry {
                name: <$ty as $crate::Remotable>::BOX_NAME,
                invoke: |payload| {
                    let (slot, value): ($crate::Rptr<$crate::rasync::ResultSlot>, $ty) =
                        $crate::__wire::decode_args(payload)?;
                    ::core::result::Result::Ok(::std::boxed::Box::pin(
                        $crate::proxy::box_and_reply::<$ty>(slot, value),
                    ))
                },
            };
        };
    )*};
}

/// Receiving side of [`make_remote_proxy`]: box the shipped value and post
/// the handle back.
#[doc(hidden)]
pub async fn box_and_reply<T>(slot: crate::Rptr<ResultSlot>, value: T)
where
    T: Serialize + Send + Sync + 'static,
{
    let handle = make_shared_rptr(value);
    crate::rasync::reply_ok(slot, &handle);
}

// === impl Proxy ===

impl<T> Proxy<T> {
    /// The empty proxy.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: ProxyInner::Empty,
        }
    }

    pub(crate) fn from_shared(shared: SharedRptr<T>) -> Self {
        let inner = match shared.take_inner() {
            None => ProxyInner::Empty,
            Some(Inner::Home(arc)) => ProxyInner::Local(arc),
            inner @ Some(Inner::Remote(..)) => ProxyInner::Remote(SharedRptr::from_inner(inner)),
        };
        Self { inner }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.inner, ProxyInner::Empty)
    }

    /// Whether the payload lives in this address space.
    pub fn local(&self) -> bool {
        matches!(self.inner, ProxyInner::Local(_))
    }

    /// The payload, if it is local.
    pub fn get(&self) -> Option<&T> {
        match &self.inner {
            ProxyInner::Local(arc) => Some(arc),
            _ => None,
        }
    }
}

impl<T> Proxy<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// A proxy whose payload is local: for a local proxy, a cheap copy of
    /// the handle; for a remote one, a pulled-and-deserialized deep copy of
    /// the payload.
    ///
    /// # Errors
    ///
    /// Reports a failed migration task.
    pub async fn make_local(&self) -> Result<Proxy<T>, TaskError> {
        match &self.inner {
            ProxyInner::Empty => Ok(Proxy::new()),
            ProxyInner::Local(arc) => Ok(Proxy {
                inner: ProxyInner::Local(Arc::clone(arc)),
            }),
            ProxyInner::Remote(shared) => {
                let arc = make_local_shared_ptr(shared).await?;
                Ok(Proxy {
                    inner: ProxyInner::Local(arc),
                })
            }
        }
    }
}

impl<T> Default for Proxy<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Proxy<T> {
    fn clone(&self) -> Self {
        let inner = match &self.inner {
            ProxyInner::Empty => ProxyInner::Empty,
            ProxyInner::Local(arc) => ProxyInner::Local(Arc::clone(arc)),
            ProxyInner::Remote(shared) => ProxyInner::Remote(shared.clone()),
        };
        Self { inner }
    }
}

impl<T> std::ops::Deref for Proxy<T> {
    type Target = T;

    /// Dereference the local payload.
    ///
    /// # Panics
    ///
    /// Panics unless the payload is local.
    fn deref(&self) -> &T {
        match &self.inner {
            ProxyInner::Local(arc) => arc,
            _ => panic!("dereferencing a non-local proxy"),
        }
    }
}

impl<T> fmt::Debug for Proxy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            ProxyInner::Empty => f.write_str("Proxy(empty)"),
            ProxyInner::Local(_) => f.write_str("Proxy(local)"),
            ProxyInner::Remote(shared) => write!(f, "Proxy({shared:?})"),
        }
    }
}

impl<T> Serialize for Proxy<T>
where
    T: Serialize + Send + Sync + 'static,
{
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // A local payload is promoted to a shared handle on the wire; the
        // pin taken during that serialization keeps it alive for the copy.
        match &self.inner {
            ProxyInner::Empty => SharedRptr::<T>::null().serialize(serializer),
            ProxyInner::Local(arc) => {
                SharedRptr::from_arc(Arc::clone(arc)).serialize(serializer)
            }
            ProxyInner::Remote(shared) => shared.serialize(serializer),
        }
    }
}

impl<'de, T> Deserialize<'de> for Proxy<T>
where
    T: Send + Sync + 'static,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Proxy::from_shared(SharedRptr::<T>::deserialize(
            deserializer,
        )?))
    }
}
