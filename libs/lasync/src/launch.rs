// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::panic_message;
use crate::error::TaskError;
use crate::executor;
use crate::sync;
use core::panic::AssertUnwindSafe;

bitflags::bitflags! {
    /// Launch policy for [`launch`], combinable as a bitmask.
    ///
    /// A mask with several bits set is decoded to one concrete mode by
    /// [`Launch::decode`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Launch: u32 {
        /// Spawn a new fiber now; the returned future resolves on completion.
        const ASYNC = 1 << 0;
        /// Defer the work; it runs on the fiber that consumes the future.
        const DEFERRED = 1 << 1;
        /// Run now on the calling fiber; the returned future is already
        /// ready.
        const SYNC = 1 << 2;
        /// Spawn a new fiber now; the returned future is invalid.
        const DETACHED = 1 << 3;
    }
}

impl Launch {
    /// Select the highest-priority mode of the mask:
    /// async > deferred > sync > detached. An empty mask decodes to async.
    #[must_use]
    pub fn decode(self) -> Launch {
        for mode in [
            Launch::ASYNC,
            Launch::DEFERRED,
            Launch::SYNC,
            Launch::DETACHED,
        ] {
            if self.contains(mode) {
                return mode;
            }
        }
        Launch::ASYNC
    }
}

impl Default for Launch {
    fn default() -> Self {
        Launch::ASYNC
    }
}

/// Run `f` under the given launch policy, returning a future for its result.
///
/// Panics inside `f` are captured into the future's error outcome for every
/// mode except `DETACHED`, where they are logged and swallowed.
pub fn launch<T, F>(policy: Launch, f: F) -> sync::Future<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let mode = policy.decode();
    if mode == Launch::DEFERRED {
        sync::deferred_future(move || async move { run_catching(f) })
    } else if mode == Launch::SYNC {
        sync::Future::from_outcome(run_catching(f))
    } else if mode == Launch::DETACHED {
        executor::spawn_detached(async move {
            f();
        });
        sync::Future::invalid()
    } else {
        executor::spawn(async move { f() })
    }
}

fn run_catching<T>(f: impl FnOnce() -> T) -> Result<T, TaskError> {
    std::panic::catch_unwind(AssertUnwindSafe(f))
        .map_err(|payload| TaskError::Panicked(panic_message(payload.as_ref())))
}
