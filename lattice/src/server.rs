// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The communication loop.
//!
//! One loop per process: drain the outbound queue into non-blocking sends,
//! reap finished sends, pull inbound messages and spawn a fiber per message,
//! and run the termination protocol. The loop holds the comm gate while it
//! talks to the transport, so a worker fiber taking the gate stalls the loop
//! at an idle point.
//!
//! Termination: once a process is locally ready (its user-main fiber is
//! done, or it never had one) it enters the non-blocking barrier. Barrier
//! completion proves every process is ready and, because a sender's barrier
//! entry is ordered behind everything it sent, that all task messages have
//! been delivered. The loop then drains the last arrivals, waits for the
//! fibers they spawned, and exits with empty queues.

use crate::runtime::{Outbound, RuntimeCore};
use core::time::Duration;
use lasync::sync;
use lcomm::{BarrierHandle, SendHandle, Transport};
use lwire::Envelope;
use std::sync::Arc;

/// Idle backoff so a quiet loop does not spin a core.
const IDLE_NAP: Duration = Duration::from_micros(200);

pub(crate) async fn comm_loop(core: Arc<RuntimeCore>, result: Option<sync::Future<i32>>) -> i32 {
    let mut inflight: Vec<SendHandle> = Vec::new();
    let mut terminating = false;
    let mut barrier: Option<BarrierHandle> = None;

    loop {
        let (did_work, quiesced) = {
            let _gate = core.comm_gate.lock().await;

            let did_send = send_tasks(&core, &mut inflight);
            let did_recv = recv_tasks(&core);

            let locally_ready = result.as_ref().is_none_or(sync::Future::is_ready);
            let barrier_done = terminate_check(
                core.transport.as_ref(),
                locally_ready,
                &mut terminating,
                &mut barrier,
            );

            let quiesced = barrier_done && {
                // Everything ever sent to us is already in the transport's
                // hands; take the last arrivals before checking quiescence.
                recv_tasks(&core);
                no_inbound(core.transport.as_ref())
                    && core.outbound_is_empty()
                    && inflight.is_empty()
                    && core.executor().live_tasks() == 0
            };
            (did_send || did_recv, quiesced)
        };

        if quiesced {
            break;
        }
        if did_work {
            lasync::yield_now().await;
        } else {
            lasync::sleep(IDLE_NAP).await;
        }
    }

    cancel_sends(&mut inflight);
    tracing::debug!(rank = core.rank(), "event loop quiesced");

    match result {
        Some(result) => match result.await {
            Ok(code) => code,
            Err(err) => {
                tracing::error!(%err, "user main fiber failed");
                1
            }
        },
        None => 0,
    }
}

/// Initiate queued sends and reap the finished ones.
fn send_tasks(core: &RuntimeCore, inflight: &mut Vec<SendHandle>) -> bool {
    let queued = core.take_outbound();
    let mut did_work = !queued.is_empty();

    for Outbound { dest, bytes } in queued {
        tracing::trace!(dest, len = bytes.len(), "outbound task");
        match core.transport.send(dest, bytes) {
            Ok(handle) => inflight.push(handle),
            // A transport failure is fatal; there is no retry policy.
            Err(err) => panic!("transport send to rank {dest} failed: {err}"),
        }
    }

    let before = inflight.len();
    inflight.retain(|handle| !handle.test());
    did_work |= inflight.len() != before;
    did_work
}

/// Pull every available inbound message and spawn a fiber per message.
fn recv_tasks(core: &Arc<RuntimeCore>) -> bool {
    let mut did_work = false;
    loop {
        let info = match core.transport.try_probe() {
            Ok(Some(info)) => info,
            Ok(None) => return did_work,
            Err(err) => panic!("transport probe failed: {err}"),
        };
        let bytes = core
            .transport
            .recv(info)
            .unwrap_or_else(|err| panic!("transport receive from rank {} failed: {err}", info.src));
        did_work = true;

        let envelope = match Envelope::decode(&bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::error!(src = info.src, %err, "malformed task message");
                std::process::abort();
            }
        };
        tracing::trace!(src = info.src, task = %envelope.name, "inbound task");

        // Argument decoding and the invocation itself happen on the fiber,
        // off the communication thread.
        core.executor().spawn_detached(async move {
            match lwire::dispatch(&envelope) {
                Ok(task) => task.await,
                Err(err) => {
                    // A tag we cannot reconstruct means the ranks disagree
                    // about the registry; continuing would lose tasks
                    // silently.
                    tracing::error!(%err, "failed to reconstruct inbound task");
                    std::process::abort();
                }
            }
        });
    }
}

/// Enter the barrier on the first locally-ready transition, then test it.
fn terminate_check(
    transport: &dyn Transport,
    ready: bool,
    terminating: &mut bool,
    barrier: &mut Option<BarrierHandle>,
) -> bool {
    if !*terminating {
        if !ready {
            return false;
        }
        *terminating = true;
        *barrier = Some(transport.barrier());
        tracing::debug!(rank = transport.rank(), "entered termination barrier");
    }
    barrier.as_mut().expect("terminating without a barrier").test()
}

fn no_inbound(transport: &dyn Transport) -> bool {
    matches!(transport.try_probe(), Ok(None))
}

fn cancel_sends(inflight: &mut Vec<SendHandle>) {
    for handle in inflight.drain(..) {
        if !handle.test() {
            handle.cancel();
        }
    }
}
