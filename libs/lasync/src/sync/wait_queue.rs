// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::task::{Context, Waker};
use std::collections::VecDeque;
use std::sync::Mutex;

/// A queue of waiting fibers which can be woken in first-in, first-out order,
/// or all at once.
///
/// A `WaitQueue` is the building block for synchronization primitives that
/// park an unbounded number of fibers: the promise/future shared state wakes
/// all waiters when a value arrives, the fiber [`Mutex`][super::Mutex] wakes
/// one waiter per unlock.
///
/// Users follow a register-then-recheck protocol: first re-check the guarded
/// condition, then [`register`][WaitQueue::register], then check the
/// condition once more before returning `Pending`. As long as the waking
/// side publishes its state change *before* calling
/// [`wake`][WaitQueue::wake]/[`wake_all`][WaitQueue::wake_all], no wakeup can
/// be lost. Spurious wakeups are possible and callers must tolerate them.
#[derive(Debug, Default)]
pub struct WaitQueue {
    waiters: Mutex<VecDeque<Waker>>,
}

// === impl WaitQueue ===

impl WaitQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the waker from `cx` at the back of the queue.
    pub fn register(&self, cx: &mut Context<'_>) {
        let mut waiters = self.waiters.lock().unwrap();
        // A fiber that is re-polled re-registers; drop a stale entry for the
        // same task first so the queue cannot grow without bound.
        waiters.retain(|w| !w.will_wake(cx.waker()));
        waiters.push_back(cx.waker().clone());
    }

    /// Wake the fiber at the front of the queue, if any.
    pub fn wake(&self) {
        let waker = self.waiters.lock().unwrap().pop_front();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Wake every waiting fiber.
    pub fn wake_all(&self) {
        let waiters: Vec<_> = {
            let mut waiters = self.waiters.lock().unwrap();
            waiters.drain(..).collect()
        };
        for waker in waiters {
            waker.wake();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::Wake;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn wake_is_fifo() {
        let queue = WaitQueue::new();
        let a = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let b = Arc::new(CountingWaker(AtomicUsize::new(0)));
        queue.register(&mut Context::from_waker(&Waker::from(a.clone())));
        queue.register(&mut Context::from_waker(&Waker::from(b.clone())));

        queue.wake();
        assert_eq!(a.0.load(Ordering::SeqCst), 1);
        assert_eq!(b.0.load(Ordering::SeqCst), 0);

        queue.wake();
        assert_eq!(b.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wake_all_drains() {
        let queue = WaitQueue::new();
        let a = Arc::new(CountingWaker(AtomicUsize::new(0)));
        queue.register(&mut Context::from_waker(&Waker::from(a.clone())));
        queue.wake_all();
        assert_eq!(a.0.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());
    }
}
