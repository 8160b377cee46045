// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Rank-aware asynchronous submission.
//!
//! [`rasync`] launches a [`RemoteFn`] on a chosen rank under one of the four
//! launch modes and hands back a future for the result. The result travels
//! as a continuation: the submitting rank leaks a [`ResultSlot`] (a boxed
//! completion closure addressed by a remote pointer), the executing rank
//! runs the function and posts a set-result task back, which reconstructs
//! the slot and fulfills the promise. Panics in the remote work are captured
//! and travel the same path as an error outcome.

use crate::rexec::{RemoteFn, rexec};
use crate::rptr::Rptr;
use crate::runtime::{self, RuntimeCore};
use crate::shared_rptr::make_shared_rptr;
use core::panic::AssertUnwindSafe;
use futures::FutureExt;
use lasync::sync::{self, Promise, deferred_future};
use lasync::{Launch, TaskError};
use lcomm::Rank;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// A leaked completion closure, addressed across ranks by a raw pointer.
///
/// The slot is created by the submitting rank, travels as a plain
/// `(rank, address)` pair inside the task message, and is reconstructed and
/// consumed exactly once by the set-result task that carries the outcome
/// back.
pub struct ResultSlot {
    complete: Box<dyn FnOnce(Vec<u8>) + Send>,
}

// === impl ResultSlot ===

impl ResultSlot {
    pub(crate) fn new(complete: Box<dyn FnOnce(Vec<u8>) + Send>) -> Box<Self> {
        Box::new(Self { complete })
    }

    /// A slot that decodes the standard `Result<T, String>` outcome wire
    /// form into `promise`.
    pub(crate) fn for_promise<T>(promise: Promise<T>) -> Box<Self>
    where
        T: DeserializeOwned + Send + 'static,
    {
        Self::new(Box::new(move |bytes| {
            let mut promise = promise;
            match bincode::deserialize::<Result<T, String>>(&bytes) {
                Ok(Ok(value)) => promise.set_value(value),
                Ok(Err(panic)) => promise.set_error(TaskError::Panicked(panic)),
                Err(err) => {
                    promise.set_error(TaskError::Panicked(format!("result decode failed: {err}")));
                }
            }
        }))
    }

    /// Leak the slot, producing the remote pointer that travels with the
    /// task.
    pub(crate) fn leak(self: Box<Self>) -> Rptr<ResultSlot> {
        Rptr::from_raw(Box::into_raw(self))
    }

    /// Consume the slot with the outcome bytes.
    pub(crate) fn run(self: Box<Self>, bytes: Vec<u8>) {
        (self.complete)(bytes);
    }
}

impl core::fmt::Debug for ResultSlot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("ResultSlot")
    }
}

/// Launch `F` on rank `dest`, returning a future for its result.
///
/// The four modes follow the local launch contract: `ASYNC` submits now,
/// `SYNC` behaves like `ASYNC` with the wait at the consuming await point,
/// `DEFERRED` submits (synchronously, remotely) from the fiber that consumes
/// the future, `DETACHED` submits and returns an invalid future.
pub fn rasync<F: RemoteFn>(policy: Launch, dest: Rank, args: F::Args) -> sync::Future<F::Output> {
    let core = runtime::current();
    if dest == core.rank() {
        return rasync_local::<F>(&core, policy, args);
    }

    let mode = policy.decode();
    if mode == Launch::DEFERRED {
        deferred_future(move || async move { submit::<F>(&runtime::current(), dest, args).await })
    } else if mode == Launch::DETACHED {
        rexec::<F>(dest, args);
        sync::Future::invalid()
    } else {
        // ASYNC and SYNC: submit now; awaiting the future is the wait.
        submit::<F>(&core, dest, args)
    }
}

/// The future-of-rank variant: the destination itself may still be
/// computing.
pub fn rasync_after<F: RemoteFn>(
    policy: Launch,
    fdest: sync::Future<Rank>,
    args: F::Args,
) -> sync::Future<F::Output> {
    assert!(fdest.valid(), "destination future is invalid");
    let mode = policy.decode();
    if mode == Launch::DEFERRED {
        deferred_future(move || async move {
            let dest = fdest.await?;
            submit::<F>(&runtime::current(), dest, args).await
        })
    } else if mode == Launch::DETACHED {
        lasync::executor::spawn_detached(async move {
            match fdest.await {
                Ok(dest) => rexec::<F>(dest, args),
                Err(err) => tracing::error!(%err, "destination future failed"),
            }
        });
        sync::Future::invalid()
    } else {
        spawn_flat(async move {
            let dest = fdest.await?;
            submit::<F>(&runtime::current(), dest, args).await
        })
    }
}

fn rasync_local<F: RemoteFn>(
    core: &Arc<RuntimeCore>,
    policy: Launch,
    args: F::Args,
) -> sync::Future<F::Output> {
    let mode = policy.decode();
    if mode == Launch::DEFERRED {
        deferred_future(move || async move { Ok(F::call(args).await) })
    } else if mode == Launch::DETACHED {
        core.executor().spawn_detached(async move {
            let _ = F::call(args).await;
        });
        sync::Future::invalid()
    } else {
        core.executor().spawn(F::call(args))
    }
}

/// Allocate the promise slot and enqueue the continuation-carrying task.
fn submit<F: RemoteFn>(core: &Arc<RuntimeCore>, dest: Rank, args: F::Args) -> sync::Future<F::Output> {
    let mut promise = Promise::new();
    let future = promise.future();
    let slot = ResultSlot::for_promise(promise).leak();
    core.enqueue_task(dest, F::NAME_CONT, &(slot, args));
    future
}

/// Spawn a fiber computing a `Result` outcome directly into a fresh shared
/// state, without double-wrapping.
fn spawn_flat<T: Send + 'static>(
    work: impl Future<Output = Result<T, TaskError>> + Send + 'static,
) -> sync::Future<T> {
    let mut promise = Promise::new();
    let future = promise.future();
    lasync::executor::spawn_detached(async move {
        promise.fulfill(work.await);
    });
    future
}

/// Executing side of the continuation protocol: run the function, capture
/// panics, post the outcome back to the slot.
#[doc(hidden)]
pub async fn run_and_reply<F: RemoteFn>(slot: Rptr<ResultSlot>, args: F::Args) {
    let outcome: Result<F::Output, String> =
        match AssertUnwindSafe(F::call(args)).catch_unwind().await {
            Ok(value) => Ok(value),
            Err(payload) => Err(panic_text(payload.as_ref())),
        };
    reply(slot, &outcome);
}

/// Like [`run_and_reply`], but boxes the result into a shared remote pointer
/// on the executing rank, returning the handle instead of the value.
#[doc(hidden)]
pub async fn run_and_reply_boxed<F: RemoteFn>(slot: Rptr<ResultSlot>, args: F::Args) {
    let outcome = match AssertUnwindSafe(F::call(args)).catch_unwind().await {
        Ok(value) => Ok(make_shared_rptr(value)),
        Err(payload) => Err(panic_text(payload.as_ref())),
    };
    reply(slot, &outcome);
}

/// Post a successful outcome back to a result slot.
#[doc(hidden)]
pub fn reply_ok<T: Serialize>(slot: Rptr<ResultSlot>, value: &T) {
    reply(slot, &Ok::<_, String>(value));
}

fn reply<T: Serialize>(slot: Rptr<ResultSlot>, outcome: &Result<T, String>) {
    let bytes = bincode::serialize(outcome)
        .unwrap_or_else(|err| panic!("failed to serialize task result: {err}"));
    reply_bytes(slot, bytes);
}

/// Post pre-encoded outcome bytes back to a result slot.
pub(crate) fn reply_bytes(slot: Rptr<ResultSlot>, bytes: Vec<u8>) {
    let core = runtime::current();
    if slot.proc() == core.rank() {
        // Safety: the slot address was minted by `ResultSlot::leak` on this
        // process, and the protocol delivers exactly one completion per
        // slot.
        let slot = unsafe { Box::from_raw(slot.as_ptr()) };
        slot.run(bytes);
        return;
    }
    core.enqueue_task(slot.proc(), crate::builtin::SET_RESULT, &(slot.addr(), bytes));
}

fn panic_text(payload: &(dyn core::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
