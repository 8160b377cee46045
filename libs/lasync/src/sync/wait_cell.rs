// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::Closed;
use core::task::{Context, Poll, Waker};
use std::sync::Mutex;

/// A slot holding the [`Waker`] of a single waiting fiber.
///
/// A `WaitCell` is woken at most once; once [`wake`][WaitCell::wake] has been
/// called every subsequent [`poll_wait`][WaitCell::poll_wait] completes
/// immediately. The cell is the building block for one-shot notifications
/// (timer entries, one-shot value handoff).
///
/// The critical sections are tiny, so the interior state simply lives behind
/// a mutex.
#[derive(Debug, Default)]
pub struct WaitCell {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    waker: Option<Waker>,
    woken: bool,
    closed: bool,
}

// === impl WaitCell ===

impl WaitCell {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake the registered waiter, if any, and latch the cell so that future
    /// waits complete immediately.
    pub fn wake(&self) {
        let waker = {
            let mut state = self.state.lock().unwrap();
            state.woken = true;
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Close the cell. Waiters observe [`Closed`] instead of a wakeup.
    pub fn close(&self) {
        let waker = {
            let mut state = self.state.lock().unwrap();
            state.closed = true;
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub fn is_woken(&self) -> bool {
        self.state.lock().unwrap().woken
    }

    /// Poll to wait on this cell, registering the [`Waker`] from `cx` if the
    /// cell has not been woken yet.
    ///
    /// # Errors
    ///
    /// Returns [`Closed`] if the cell was closed without being woken.
    pub fn poll_wait(&self, cx: &mut Context<'_>) -> Poll<Result<(), Closed>> {
        let mut state = self.state.lock().unwrap();
        if state.woken {
            return Poll::Ready(Ok(()));
        }
        if state.closed {
            return Poll::Ready(Err(Closed(())));
        }
        // Replacing a previous waker is fine: only the most recent poll's
        // waker is allowed to matter.
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}
