// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::sync::WaitQueue;
use core::sync::atomic::{AtomicBool, Ordering};
use core::task::Poll;

/// A binary synchronization cell for fibers.
///
/// [`lock`][Mutex::lock] suspends the calling fiber until the cell is free;
/// dropping the returned [`MutexGuard`] releases it and resumes one waiter.
/// Recursive acquisition by the same fiber deadlocks. Releasing is tied to
/// the guard, so unlocking a mutex one does not hold is unrepresentable.
#[derive(Debug, Default)]
pub struct Mutex {
    locked: AtomicBool,
    waiters: WaitQueue,
}

/// Holds a [`Mutex`] locked until dropped.
#[derive(Debug)]
#[must_use = "the mutex unlocks immediately if the guard is dropped"]
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

// === impl Mutex ===

impl Mutex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the mutex, suspending the calling fiber until it is free.
    pub async fn lock(&self) -> MutexGuard<'_> {
        core::future::poll_fn(|cx| {
            if self.try_acquire() {
                return Poll::Ready(());
            }
            self.waiters.register(cx);
            // Re-check: an unlock may have slipped in between the failed
            // acquire and registration.
            if self.try_acquire() {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await;
        MutexGuard { mutex: self }
    }

    /// Acquire the mutex if it is free right now.
    pub fn try_lock(&self) -> Option<MutexGuard<'_>> {
        self.try_acquire().then_some(MutexGuard { mutex: self })
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
        self.waiters.wake();
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        // Destroying a held mutex is a fatal programming error.
        assert!(
            !*self.locked.get_mut() || std::thread::panicking(),
            "mutex destroyed while locked"
        );
    }
}

// === impl MutexGuard ===

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Executor;
    use crate::executor::spawn;
    use std::sync::Arc;

    #[test]
    fn try_lock_excludes() {
        let mutex = Mutex::new();
        let guard = mutex.try_lock().unwrap();
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert!(mutex.try_lock().is_some());
    }

    #[test]
    #[should_panic(expected = "mutex destroyed while locked")]
    fn dropping_held_mutex_is_fatal() {
        let mutex = Mutex::new();
        let guard = mutex.try_lock().unwrap();
        core::mem::forget(guard);
        drop(mutex);
    }

    #[test]
    fn contended_increments_are_exclusive() {
        let exec = Executor::builder().num_workers(4).build();
        let mutex = Arc::new(Mutex::new());
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        exec.block_on(async {
            let fibers: Vec<_> = (0..16)
                .map(|_| {
                    let mutex = Arc::clone(&mutex);
                    let counter = Arc::clone(&counter);
                    spawn(async move {
                        for _ in 0..50 {
                            let _guard = mutex.lock().await;
                            let seen = counter.load(Ordering::SeqCst);
                            crate::task::yield_now().await;
                            counter.store(seen + 1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            for fiber in fibers {
                fiber.await.unwrap();
            }
        });

        assert_eq!(counter.load(Ordering::SeqCst), 16 * 50);
        exec.shutdown();
    }
}
