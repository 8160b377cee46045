// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::TaskError;
use crate::executor;
use crate::sync;

/// A joinable handle to a spawned fiber.
///
/// Mirrors the contract of an OS thread handle: a `Thread` must be either
/// [`join`][Thread::join]ed or [`detach`][Thread::detach]ed before it is
/// dropped. Dropping a joinable `Thread` is a fatal invariant violation.
#[derive(Debug)]
#[must_use = "a joinable thread must be joined or detached"]
pub struct Thread {
    fiber: Option<sync::Future<()>>,
}

// === impl Thread ===

impl Thread {
    /// Spawn a fiber running `f` to completion.
    pub fn spawn<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            fiber: Some(executor::spawn(async move { f() })),
        }
    }

    /// Spawn a fiber driving `future` to completion.
    pub fn spawn_future<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            fiber: Some(executor::spawn(future)),
        }
    }

    /// Whether the thread has been neither joined nor detached yet.
    pub fn joinable(&self) -> bool {
        self.fiber.is_some()
    }

    /// Wait for the fiber to run to completion.
    ///
    /// # Errors
    ///
    /// Reports [`TaskError::Panicked`] if the fiber panicked.
    pub async fn join(mut self) -> Result<(), TaskError> {
        // `take` so the drop check below sees a consumed handle.
        let fiber = self.fiber.take().expect("thread already joined");
        fiber.await
    }

    /// Give up the ability to join; the fiber keeps running on its own.
    pub fn detach(mut self) {
        self.fiber.take();
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        assert!(
            self.fiber.is_none() || std::thread::panicking(),
            "joinable thread dropped; join or detach it first"
        );
    }
}
