// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! One-shot value handoff between fibers.
//!
//! A [`Promise`] is the write end, a [`Future`] the consuming read end and a
//! [`SharedFuture`] the multi-observer read end of the same shared state.
//! The state moves `empty -> ready` when the promise is satisfied and
//! `ready -> consumed` when a non-shared future is awaited. Waiting on an
//! empty future suspends the calling fiber; satisfying the promise resumes
//! all waiters.

use crate::error::TaskError;
use crate::executor;
use crate::sync::WaitQueue;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::sync::{Arc, Mutex};

type BoxedWork<T> = Pin<Box<dyn core::future::Future<Output = Result<T, TaskError>> + Send>>;

#[derive(Debug)]
struct Shared<T> {
    state: Mutex<State<T>>,
    waiters: WaitQueue,
}

#[derive(Debug)]
enum State<T> {
    Empty,
    Ready(Result<T, TaskError>),
    Consumed,
}

impl<T> Shared<T> {
    fn empty() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::Empty),
            waiters: WaitQueue::new(),
        })
    }

    fn ready(value: Result<T, TaskError>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::Ready(value)),
            waiters: WaitQueue::new(),
        })
    }

    /// Install `value`, then wake all waiters. Returns `false` if the state
    /// was already filled.
    fn fill(&self, value: Result<T, TaskError>) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if !matches!(*state, State::Empty) {
                return false;
            }
            *state = State::Ready(value);
        }
        self.waiters.wake_all();
        true
    }

    fn is_ready(&self) -> bool {
        matches!(*self.state.lock().unwrap(), State::Ready(_))
    }

    /// Poll for readiness, consuming the value.
    fn poll_take(&self, cx: &mut Context<'_>) -> Poll<Result<T, TaskError>> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                match &*state {
                    State::Ready(_) => {
                        let State::Ready(value) = core::mem::replace(&mut *state, State::Consumed)
                        else {
                            unreachable!()
                        };
                        return Poll::Ready(value);
                    }
                    State::Consumed => return Poll::Ready(Err(TaskError::Invalid)),
                    State::Empty => {}
                }
            }
            self.waiters.register(cx);
            // Re-check: the promise may have been satisfied between the
            // check above and registration.
            if matches!(*self.state.lock().unwrap(), State::Empty) {
                return Poll::Pending;
            }
        }
    }

    /// Poll for readiness without consuming the value.
    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<()> {
        loop {
            if !matches!(*self.state.lock().unwrap(), State::Empty) {
                return Poll::Ready(());
            }
            self.waiters.register(cx);
            if matches!(*self.state.lock().unwrap(), State::Empty) {
                return Poll::Pending;
            }
        }
    }
}

/// The write end of a one-shot value.
///
/// Dropping a promise that was never satisfied *breaks* it: observers of the
/// associated future see [`TaskError::BrokenPromise`].
#[derive(Debug)]
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
    future_taken: bool,
}

/// A one-shot handle to an eventual value.
///
/// `Future` resolves to `Result<T, TaskError>`: the error side carries a
/// broken promise or the captured panic of the producing fiber. Awaiting
/// consumes the handle; use [`Future::share`] for repeatable observation.
#[derive(Debug)]
pub struct Future<T> {
    inner: Inner<T>,
}

enum Inner<T> {
    /// Not associated with any shared state.
    Invalid,
    Shared(Arc<Shared<T>>),
    /// Work that runs on the consuming fiber, on first poll.
    Deferred(Option<Box<dyn FnOnce() -> BoxedWork<T> + Send>>),
    /// A deferred future that has started running.
    Running(BoxedWork<T>),
}

impl<T> core::fmt::Debug for Inner<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Inner::Invalid => f.write_str("Invalid"),
            Inner::Shared(_) => f.write_str("Shared"),
            Inner::Deferred(_) => f.write_str("Deferred"),
            Inner::Running(_) => f.write_str("Running"),
        }
    }
}

/// A multi-observer handle to an eventual value.
#[derive(Debug)]
pub struct SharedFuture<T> {
    shared: Arc<Shared<T>>,
}

/// Construct a future that is ready from the start, without a distinct
/// promise.
pub fn make_ready_future<T>(value: T) -> Future<T> {
    Future {
        inner: Inner::Shared(Shared::ready(Ok(value))),
    }
}

/// Construct a future whose work runs on the fiber that consumes it, on
/// first poll.
pub fn deferred_future<T, F, Fut>(thunk: F) -> Future<T>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: core::future::Future<Output = Result<T, TaskError>> + Send + 'static,
{
    Future::deferred(Box::new(move || -> BoxedWork<T> { Box::pin(thunk()) }))
}

// === impl Promise ===

impl<T> Promise<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Shared::empty(),
            future_taken: false,
        }
    }

    /// Obtain the future associated with this promise.
    ///
    /// # Panics
    ///
    /// Panics if the future was already taken.
    pub fn future(&mut self) -> Future<T> {
        assert!(!self.future_taken, "future already retrieved from promise");
        self.future_taken = true;
        Future {
            inner: Inner::Shared(self.shared.clone()),
        }
    }

    /// Satisfy the promise with a value, resuming all waiters.
    ///
    /// # Panics
    ///
    /// Setting a value twice is a fatal programming error.
    pub fn set_value(&mut self, value: T) {
        assert!(self.shared.fill(Ok(value)), "promise already satisfied");
    }

    /// Satisfy the promise with an error outcome.
    ///
    /// # Panics
    ///
    /// Setting a value twice is a fatal programming error.
    pub fn set_error(&mut self, error: TaskError) {
        assert!(self.shared.fill(Err(error)), "promise already satisfied");
    }

    /// Satisfy the promise with a pre-formed outcome, without panicking if it
    /// was already satisfied. Used by the runtime on completion paths that
    /// may race with shutdown.
    pub fn fulfill(&mut self, outcome: Result<T, TaskError>) -> bool {
        self.shared.fill(outcome)
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        // Only breaks the promise if it is still empty.
        self.shared.fill(Err(TaskError::BrokenPromise));
    }
}

// === impl Future ===

impl<T> Future<T> {
    /// A future without shared state. Awaiting it yields
    /// [`TaskError::Invalid`].
    #[must_use]
    pub fn invalid() -> Self {
        Self {
            inner: Inner::Invalid,
        }
    }

    pub(crate) fn deferred(thunk: Box<dyn FnOnce() -> BoxedWork<T> + Send>) -> Self {
        Self {
            inner: Inner::Deferred(Some(thunk)),
        }
    }

    pub(crate) fn from_outcome(outcome: Result<T, TaskError>) -> Self {
        Self {
            inner: Inner::Shared(Shared::ready(outcome)),
        }
    }

    /// Whether this future is associated with shared state (or deferred
    /// work).
    pub fn valid(&self) -> bool {
        !matches!(self.inner, Inner::Invalid)
    }

    /// Non-suspending probe: is the value available right now?
    pub fn is_ready(&self) -> bool {
        match &self.inner {
            Inner::Shared(shared) => shared.is_ready(),
            _ => false,
        }
    }

    /// Suspend until the value is available, without consuming it.
    ///
    /// Deferred work is run to completion on the calling fiber, matching the
    /// launch contract for deferred futures.
    pub async fn wait(&mut self)
    where
        T: Send + 'static,
    {
        match &mut self.inner {
            Inner::Invalid => {}
            Inner::Shared(shared) => {
                let shared = shared.clone();
                core::future::poll_fn(move |cx| shared.poll_ready(cx)).await;
            }
            Inner::Deferred(_) | Inner::Running(_) => {
                // Run the deferred work now and stash the outcome so a later
                // await still observes it.
                let inner = core::mem::replace(&mut self.inner, Inner::Invalid);
                let mut work = match inner {
                    Inner::Deferred(mut thunk) => (thunk.take().unwrap())(),
                    Inner::Running(work) => work,
                    _ => unreachable!(),
                };
                let outcome = core::future::poll_fn(|cx| work.as_mut().poll(cx)).await;
                self.inner = Inner::Shared(Shared::ready(outcome));
            }
        }
    }

    /// Schedule `continuation` to run as a new fiber once this future is
    /// ready. If the future is already ready the continuation is enqueued
    /// immediately.
    pub fn then<U, F>(self, continuation: F) -> Future<U>
    where
        T: Send + 'static,
        U: Send + 'static,
        F: FnOnce(Result<T, TaskError>) -> U + Send + 'static,
    {
        executor::spawn(async move { continuation(self.await) })
    }

    /// Convert into a multi-observer future.
    ///
    /// # Panics
    ///
    /// Panics if the future is invalid.
    pub fn share(self) -> SharedFuture<T>
    where
        T: Send + 'static,
    {
        match self.inner {
            Inner::Invalid => panic!("cannot share an invalid future"),
            Inner::Shared(shared) => SharedFuture { shared },
            inner @ (Inner::Deferred(_) | Inner::Running(_)) => {
                // Deferred work has no shared state yet; run it as a fiber.
                let (mut promise, spawned) = pair::<T>();
                executor::spawn_detached(async move {
                    let outcome = Future { inner }.await;
                    promise.fulfill(outcome);
                });
                let Inner::Shared(shared) = spawned.inner else {
                    unreachable!()
                };
                SharedFuture { shared }
            }
        }
    }
}

impl<T> core::future::Future for Future<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            match &mut this.inner {
                Inner::Invalid => return Poll::Ready(Err(TaskError::Invalid)),
                Inner::Shared(shared) => return shared.poll_take(cx),
                Inner::Deferred(thunk) => {
                    let thunk = thunk.take().unwrap();
                    this.inner = Inner::Running(thunk());
                }
                Inner::Running(work) => return work.as_mut().poll(cx),
            }
        }
    }
}

pub(crate) fn pair<T>() -> (Promise<T>, Future<T>) {
    let mut promise = Promise::new();
    let future = promise.future();
    (promise, future)
}

// === impl SharedFuture ===

impl<T> SharedFuture<T> {
    pub fn valid(&self) -> bool {
        true
    }

    pub fn is_ready(&self) -> bool {
        self.shared.is_ready()
    }

    /// Suspend until the value is available and return a copy of it.
    /// Repeatable: the shared state is never consumed.
    pub async fn get(&self) -> Result<T, TaskError>
    where
        T: Clone,
    {
        let shared = self.shared.clone();
        core::future::poll_fn(move |cx| shared.poll_ready(cx)).await;
        match &*self.shared.state.lock().unwrap() {
            State::Ready(value) => value.clone(),
            // `poll_ready` only completes on a filled state, and shared
            // futures never consume it.
            _ => unreachable!(),
        }
    }

    /// Suspend until the value is available.
    pub async fn wait(&self) {
        let shared = self.shared.clone();
        core::future::poll_fn(move |cx| shared.poll_ready(cx)).await;
    }
}

impl<T> Clone for SharedFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::task::Waker;

    fn poll_once<T>(future: &mut Future<T>) -> Poll<Result<T, TaskError>> {
        let mut cx = Context::from_waker(Waker::noop());
        Pin::new(future).poll(&mut cx)
    }

    #[test]
    fn ready_future_resolves_immediately() {
        let mut future = make_ready_future(7);
        assert!(future.valid());
        assert!(future.is_ready());
        assert_eq!(poll_once(&mut future), Poll::Ready(Ok(7)));
    }

    #[test]
    fn invalid_future_reports_invalid() {
        let mut future = Future::<i32>::invalid();
        assert!(!future.valid());
        assert_eq!(poll_once(&mut future), Poll::Ready(Err(TaskError::Invalid)));
    }

    #[test]
    fn promise_fulfills_future() {
        let (mut promise, mut future) = pair();
        assert!(future.valid());
        assert!(!future.is_ready());
        assert!(poll_once(&mut future).is_pending());

        promise.set_value(42);
        assert!(future.is_ready());
        assert_eq!(poll_once(&mut future), Poll::Ready(Ok(42)));
    }

    #[test]
    #[should_panic(expected = "promise already satisfied")]
    fn double_set_is_fatal() {
        let mut promise = Promise::new();
        promise.set_value(1);
        promise.set_value(2);
    }

    #[test]
    fn dropping_unset_promise_breaks_future() {
        let (promise, mut future) = pair::<i32>();
        drop(promise);
        assert_eq!(
            poll_once(&mut future),
            Poll::Ready(Err(TaskError::BrokenPromise))
        );
    }

    #[test]
    fn shared_future_get_is_idempotent() {
        let (mut promise, future) = pair();
        promise.set_value(5);
        let shared = future.share();
        assert!(shared.is_ready());
        assert_eq!(futures::executor::block_on(shared.get()), Ok(5));
        assert_eq!(futures::executor::block_on(shared.get()), Ok(5));
    }
}
