// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Built-in task handlers: the result-return leg of `rasync` and the
//! remote-reference counting protocol. They live in the same registry as
//! user tasks and travel as ordinary task messages.

use crate::rasync::{self, ResultSlot};
use crate::rptr::Rptr;
use crate::runtime;
use linkme::distributed_slice;
use lwire::{TASK_REGISTRY, TaskEntry, decode_args};

pub(crate) const SET_RESULT: &str = "lattice::builtin::set_result";
pub(crate) const INCREF: &str = "lattice::builtin::incref";
pub(crate) const DECREF: &str = "lattice::builtin::decref";
pub(crate) const FETCH: &str = "lattice::builtin::fetch";

/// Completes a leaked promise slot with the outcome bytes of a remote task.
#[distributed_slice(TASK_REGISTRY)]
static SET_RESULT_ENTRY: TaskEntry = TaskEntry {
    name: SET_RESULT,
    invoke: |payload| {
        let (addr, bytes): (u64, Vec<u8>) = decode_args(payload)?;
        Ok(Box::pin(async move {
            let addr = usize::try_from(addr).expect("address wider than this platform");
            // Safety: the address was minted by `ResultSlot::leak` on this
            // process and the protocol delivers exactly one completion per
            // slot.
            let slot = unsafe { Box::from_raw(addr as *mut ResultSlot) };
            slot.run(bytes);
        }))
    },
};

/// One more wire copy of a pinned pointee exists somewhere.
#[distributed_slice(TASK_REGISTRY)]
static INCREF_ENTRY: TaskEntry = TaskEntry {
    name: INCREF,
    invoke: |payload| {
        let (addr,): (u64,) = decode_args(payload)?;
        Ok(Box::pin(async move {
            runtime::current().pin_incref(addr);
        }))
    },
};

/// A wire copy of a pinned pointee is gone.
#[distributed_slice(TASK_REGISTRY)]
static DECREF_ENTRY: TaskEntry = TaskEntry {
    name: DECREF,
    invoke: |payload| {
        let (addr,): (u64,) = decode_args(payload)?;
        Ok(Box::pin(async move {
            runtime::current().pin_decref(addr);
        }))
    },
};

/// Serialize a pinned pointee back to a rank that wants a local copy.
#[distributed_slice(TASK_REGISTRY)]
static FETCH_ENTRY: TaskEntry = TaskEntry {
    name: FETCH,
    invoke: |payload| {
        let (addr, slot): (u64, Rptr<ResultSlot>) = decode_args(payload)?;
        Ok(Box::pin(async move {
            let bytes = runtime::current().pin_fetch(addr);
            rasync::reply_bytes(slot, bytes);
        }))
    },
};
