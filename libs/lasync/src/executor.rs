// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The fiber executor: a global run queue drained by a bounded pool of
//! worker threads.
//!
//! Workers park on a condition variable when the queue is empty and double
//! as the timer service: each pass over the queue first expires due timers,
//! and the park timeout is clamped to the nearest deadline.

use crate::error::{TaskError, panic_message};
use crate::sync;
use crate::sync::{Promise, WaitCell};
use crate::task::{TaskCell, TaskRef};
use core::panic::AssertUnwindSafe;
use core::pin::Pin;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use core::task::{Context, Poll};
use core::time::Duration;
use futures::FutureExt;
use std::cell::RefCell;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Instant;

/// Upper bound on how long an idle worker stays parked before it re-checks
/// the world.
const MAX_PARK: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct Executor {
    core: Arc<Core>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

static_assertions::assert_impl_all!(Executor: Send, Sync);

pub(crate) struct Core {
    run_queue: Mutex<VecDeque<TaskRef>>,
    queue_cond: Condvar,
    timers: Mutex<BinaryHeap<TimerEntry>>,
    broadcast: Mutex<BroadcastSlot>,
    /// Number of spawned fibers that have not yet run to completion.
    live: AtomicUsize,
    shutdown: AtomicBool,
    /// Nestable serial-mode counter; while non-zero, new fibers run inline
    /// on the spawning thread and idle workers stay parked.
    serial: AtomicUsize,
    num_workers: usize,
    on_thread_start: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl core::fmt::Debug for Core {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Core")
            .field("num_workers", &self.num_workers)
            .field("shutdown", &self.shutdown)
            .finish_non_exhaustive()
    }
}

struct TimerEntry {
    deadline: Instant,
    cell: Arc<WaitCell>,
}

#[derive(Default)]
struct BroadcastSlot {
    generation: u64,
    action: Option<Arc<dyn Fn(usize) + Send + Sync>>,
    remaining: usize,
    done: Option<Promise<()>>,
}

struct Worker {
    id: usize,
    core: Arc<Core>,
    seen_broadcast: u64,
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Executor>>> = const { RefCell::new(None) };
}

/// The executor associated with the current thread.
///
/// # Panics
///
/// Panics if there is no executor context on this thread (the thread is
/// neither a worker nor inside [`Executor::block_on`]).
pub fn current() -> Arc<Executor> {
    try_current().expect("no executor context on this thread")
}

pub fn try_current() -> Option<Arc<Executor>> {
    CURRENT.with(|current| current.borrow().clone())
}

pub(crate) struct ContextGuard {
    prev: Option<Arc<Executor>>,
}

pub(crate) fn enter(executor: Arc<Executor>) -> ContextGuard {
    let prev = CURRENT.with(|current| current.borrow_mut().replace(executor));
    ContextGuard { prev }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|current| *current.borrow_mut() = prev);
    }
}

/// Spawn a fiber on the current thread's executor, returning a future for
/// its output.
pub fn spawn<F>(future: F) -> sync::Future<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    current().spawn(future)
}

/// Spawn a fiber whose outcome nobody observes.
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    current().spawn_detached(future);
}

/// Drive `future` to completion on the current thread, parking between
/// polls.
pub fn block_on<F: Future>(future: F) -> F::Output {
    current().block_on(future)
}

pub struct Builder {
    num_workers: usize,
    stack_size: Option<usize>,
    on_thread_start: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl core::fmt::Debug for Builder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Builder")
            .field("num_workers", &self.num_workers)
            .field("stack_size", &self.stack_size)
            .finish_non_exhaustive()
    }
}

// === impl Builder ===

impl Builder {
    #[must_use]
    pub fn new() -> Self {
        let num_workers = std::thread::available_parallelism()
            .map(core::num::NonZeroUsize::get)
            .unwrap_or(4);
        Self {
            num_workers,
            stack_size: None,
            on_thread_start: None,
        }
    }

    /// Override the number of worker threads. Defaults to the available
    /// hardware parallelism.
    #[must_use]
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        assert!(num_workers > 0, "executor needs at least one worker");
        self.num_workers = num_workers;
        self
    }

    /// Override the stack size of worker threads.
    #[must_use]
    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    /// Run `f` on every worker thread right after it starts, before it
    /// processes any fiber. Used by embedders to install per-thread context.
    #[must_use]
    pub fn on_thread_start(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_thread_start = Some(Arc::new(f));
        self
    }

    /// Build the executor and start its worker threads.
    pub fn build(self) -> Arc<Executor> {
        let core = Arc::new(Core {
            run_queue: Mutex::new(VecDeque::new()),
            queue_cond: Condvar::new(),
            timers: Mutex::new(BinaryHeap::new()),
            broadcast: Mutex::new(BroadcastSlot::default()),
            live: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            serial: AtomicUsize::new(0),
            num_workers: self.num_workers,
            on_thread_start: self.on_thread_start,
        });
        let executor = Arc::new(Executor {
            core,
            workers: Mutex::new(Vec::with_capacity(self.num_workers)),
        });

        let mut workers = executor.workers.lock().unwrap();
        for id in 0..self.num_workers {
            let mut builder = std::thread::Builder::new().name(format!("lasync-worker-{id}"));
            if let Some(stack_size) = self.stack_size {
                builder = builder.stack_size(stack_size);
            }
            let executor = Arc::clone(&executor);
            let handle = builder
                .spawn(move || {
                    let _ctx = enter(Arc::clone(&executor));
                    if let Some(hook) = &executor.core.on_thread_start {
                        hook();
                    }
                    Worker::new(Arc::clone(&executor.core), id).run();
                })
                .expect("failed to spawn executor worker thread");
            workers.push(handle);
        }
        drop(workers);

        executor
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for BroadcastSlot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BroadcastSlot")
            .field("generation", &self.generation)
            .field("remaining", &self.remaining)
            .finish_non_exhaustive()
    }
}

// === impl Executor ===

impl Executor {
    #[must_use]
    pub fn builder() -> Builder {
        Builder::new()
    }

    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.core.num_workers
    }

    /// Spawn a fiber, returning a future for its output.
    ///
    /// Panics inside `future` are captured and surface as
    /// [`TaskError::Panicked`] when the returned future is awaited.
    pub fn spawn<F>(&self, future: F) -> sync::Future<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let mut promise = Promise::new();
        let handle = promise.future();
        self.spawn_erased(Box::pin(async move {
            let outcome = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(value) => Ok(value),
                Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
            };
            promise.fulfill(outcome);
        }));
        handle
    }

    /// Spawn a fiber whose outcome nobody observes. Panics are logged and
    /// swallowed.
    pub fn spawn_detached<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn_erased(Box::pin(async move {
            if let Err(payload) = AssertUnwindSafe(future).catch_unwind().await {
                tracing::error!(
                    panic = %panic_message(payload.as_ref()),
                    "detached fiber panicked"
                );
            }
        }));
    }

    fn spawn_erased(&self, future: Pin<Box<dyn Future<Output = ()> + Send>>) {
        if self.core.serial.load(Ordering::Acquire) > 0 {
            // Serial mode: run to completion on the spawning thread.
            block_on_inline(future);
            return;
        }
        self.core.live.fetch_add(1, Ordering::AcqRel);
        let task = TaskCell::new(future, Arc::downgrade(&self.core));
        tracing::trace!(task.id = task.id().as_u64(), "spawn");
        self.core.schedule(task);
    }

    /// Drive `future` to completion on the calling thread, installing this
    /// executor as the thread's context for the duration.
    pub fn block_on<F: Future>(self: &Arc<Self>, future: F) -> F::Output {
        let _ctx = enter(Arc::clone(self));
        block_on_inline(future)
    }

    /// Run `f` once on every worker thread, returning a future that resolves
    /// when the last worker has run it.
    ///
    /// Used for per-thread bootstrap that must touch each worker exactly
    /// once.
    ///
    /// # Panics
    ///
    /// Panics if another broadcast is still in progress.
    pub fn run_on_each_worker(
        &self,
        f: impl Fn(usize) + Send + Sync + 'static,
    ) -> sync::Future<()> {
        let handle = {
            let mut slot = self.core.broadcast.lock().unwrap();
            assert!(slot.action.is_none(), "worker broadcast already running");
            let mut promise = Promise::new();
            let handle = promise.future();
            slot.generation += 1;
            slot.action = Some(Arc::new(f));
            slot.remaining = self.core.num_workers;
            slot.done = Some(promise);
            handle
        };
        self.core.queue_cond.notify_all();
        handle
    }

    /// Force all subsequently-spawned fibers to run serially on the spawning
    /// thread; idle workers park until [`threading_enable`][Self::threading_enable]
    /// balances the call. Nestable.
    pub fn threading_disable(&self) {
        self.core.serial.fetch_add(1, Ordering::AcqRel);
    }

    /// Balance a [`threading_disable`][Self::threading_disable] call.
    pub fn threading_enable(&self) {
        let prev = self.core.serial.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "threading_enable without threading_disable");
        if prev == 1 {
            self.core.queue_cond.notify_all();
        }
    }

    pub(crate) fn register_timer(&self, deadline: Instant, cell: Arc<WaitCell>) {
        if deadline <= Instant::now() {
            cell.wake();
            return;
        }
        self.core
            .timers
            .lock()
            .unwrap()
            .push(TimerEntry { deadline, cell });
        // A parked worker may need to shorten its park to service the new
        // deadline.
        self.core.queue_cond.notify_all();
    }

    /// Number of spawned fibers that have not yet run to completion.
    ///
    /// Shutdown sequencing uses this to wait until all fibers have exited
    /// before tearing anything else down.
    pub fn live_tasks(&self) -> usize {
        self.core.live.load(Ordering::Acquire)
    }

    /// Stop the workers and wait for them to exit. Fibers still queued are
    /// dropped.
    pub fn shutdown(&self) {
        self.core.shutdown.store(true, Ordering::Release);
        self.core.queue_cond.notify_all();
        let workers = {
            let mut workers = self.workers.lock().unwrap();
            core::mem::take(&mut *workers)
        };
        for handle in workers {
            let _ = handle.join();
        }
    }
}

// === impl Core ===

impl Core {
    pub(crate) fn schedule(&self, task: TaskRef) {
        self.run_queue.lock().unwrap().push_back(task);
        self.queue_cond.notify_one();
    }

    pub(crate) fn task_finished(&self) {
        let prev = self.live.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }

    /// Wake every timer whose deadline has passed. Returns the gap to the
    /// next pending deadline, if any.
    fn expire_timers(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut expired = Vec::new();
        let gap = {
            let mut timers = self.timers.lock().unwrap();
            while let Some(entry) = timers.peek() {
                if entry.deadline > now {
                    break;
                }
                expired.push(timers.pop().unwrap());
            }
            timers.peek().map(|entry| entry.deadline - now)
        };
        for entry in expired {
            entry.cell.wake();
        }
        gap
    }

    fn poll_broadcast(&self, worker_id: usize, seen: &mut u64) {
        let action = {
            let slot = self.broadcast.lock().unwrap();
            if slot.generation == *seen {
                return;
            }
            *seen = slot.generation;
            slot.action.clone()
        };
        let Some(action) = action else { return };
        action(worker_id);
        let done = {
            let mut slot = self.broadcast.lock().unwrap();
            slot.remaining -= 1;
            if slot.remaining == 0 {
                slot.action = None;
                slot.done.take()
            } else {
                None
            }
        };
        if let Some(mut promise) = done {
            promise.set_value(());
        }
    }
}

// === impl Worker ===

impl Worker {
    fn new(core: Arc<Core>, id: usize) -> Self {
        Self {
            id,
            core,
            seen_broadcast: 0,
        }
    }

    fn run(&mut self) {
        let _span = tracing::debug_span!("worker main loop", worker = self.id).entered();

        while let Some(task) = self.next_task() {
            task.run();
        }

        tracing::debug!(worker = self.id, "worker shutting down");
    }

    /// Block until a task is available. Returns `None` on shutdown.
    fn next_task(&mut self) -> Option<TaskRef> {
        loop {
            if self.core.shutdown.load(Ordering::Acquire) {
                return None;
            }

            self.core.poll_broadcast(self.id, &mut self.seen_broadcast);
            let timer_gap = self.core.expire_timers();

            let queue = self.core.run_queue.lock().unwrap();

            if self.core.serial.load(Ordering::Acquire) > 0 {
                // Serial mode: finish nothing new until re-enabled.
                let _unused = self.core.queue_cond.wait_timeout(queue, MAX_PARK).unwrap();
                continue;
            }

            let mut queue = queue;
            if let Some(task) = queue.pop_front() {
                return Some(task);
            }

            let timeout = timer_gap.map_or(MAX_PARK, |gap| gap.min(MAX_PARK));
            let _unused = self.core.queue_cond.wait_timeout(queue, timeout).unwrap();
        }
    }
}

// === impl TimerEntry ===

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        // `BinaryHeap` is a max-heap; reverse so the earliest deadline is on
        // top.
        other.deadline.cmp(&self.deadline)
    }
}

/// Poll `future` to completion on the current thread, parking between polls.
fn block_on_inline<F: Future>(future: F) -> F::Output {
    struct ThreadWaker {
        thread: std::thread::Thread,
    }

    impl std::task::Wake for ThreadWaker {
        fn wake(self: Arc<Self>) {
            self.thread.unpark();
        }

        fn wake_by_ref(self: &Arc<Self>) {
            self.thread.unpark();
        }
    }

    let waker = core::task::Waker::from(Arc::new(ThreadWaker {
        thread: std::thread::current(),
    }));
    let mut cx = Context::from_waker(&waker);
    let mut future = core::pin::pin!(future);

    loop {
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(value) => return value,
            Poll::Pending => std::thread::park(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    fn executor() -> Arc<Executor> {
        Executor::builder().num_workers(2).build()
    }

    #[test]
    fn spawn_and_join() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_names(true)
            .set_default();

        let exec = executor();
        let answer = exec.block_on(async {
            let fiber = spawn(async { 21 * 2 });
            fiber.await
        });
        assert_eq!(answer, Ok(42));
        exec.shutdown();
    }

    #[test]
    fn panics_are_captured() {
        let exec = executor();
        let outcome = exec.block_on(async { spawn(async { panic!("boom") }).await });
        assert!(matches!(outcome, Err(TaskError::Panicked(msg)) if msg.contains("boom")));
        exec.shutdown();
    }

    #[test]
    fn yield_now_round_trips() {
        let exec = executor();
        exec.block_on(async {
            let fiber = spawn(async {
                for _ in 0..10 {
                    crate::task::yield_now().await;
                }
                7
            });
            assert_eq!(fiber.await, Ok(7));
        });
        exec.shutdown();
    }

    #[test]
    fn broadcast_reaches_every_worker() {
        let exec = executor();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        let done = exec.run_on_each_worker(move |_worker| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        exec.block_on(async {
            done.await.unwrap();
        });
        assert_eq!(hits.load(Ordering::SeqCst), exec.num_workers());
        exec.shutdown();
    }

    #[test]
    fn serial_mode_runs_inline() {
        let exec = executor();
        exec.threading_disable();
        let fiber = exec.spawn(async { std::thread::current().id() });
        exec.threading_enable();
        let id = exec.block_on(fiber).unwrap();
        assert_eq!(id, std::thread::current().id());
        exec.shutdown();
    }
}
