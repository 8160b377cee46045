// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::executor::Core;
use core::pin::Pin;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use core::task::{Context, Poll};
use futures::task::{ArcWake, waker_ref};
use std::sync::{Arc, Mutex, Weak};

/// A unique identifier of a spawned fiber, for diagnostics.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct Id(u64);

impl Id {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

pub(crate) type TaskRef = Arc<TaskCell>;

type ErasedFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A spawned fiber: the erased future plus its scheduling state.
///
/// The cell itself is the task's [`core::task::Waker`]: waking re-enqueues it
/// on the owning executor. The `queued` flag collapses redundant wakeups so a
/// task sits in the run queue at most once.
pub(crate) struct TaskCell {
    id: Id,
    core: Weak<Core>,
    /// `None` once the future has completed.
    future: Mutex<Option<ErasedFuture>>,
    queued: AtomicBool,
    span: tracing::Span,
}

// === impl TaskCell ===

impl TaskCell {
    pub(crate) fn new(future: ErasedFuture, core: Weak<Core>) -> TaskRef {
        let id = Id::next();
        let span = tracing::trace_span!("task", task.id = id.as_u64());
        Arc::new(Self {
            id,
            core,
            future: Mutex::new(Some(future)),
            // A fresh task starts out queued; `Core::schedule` enqueues it
            // right after construction.
            queued: AtomicBool::new(true),
            span,
        })
    }

    pub(crate) fn id(&self) -> Id {
        self.id
    }

    /// Poll the task once. Completed tasks drop their future in place.
    pub(crate) fn run(self: &Arc<Self>) {
        let _span = self.span.enter();
        let waker = waker_ref(self);
        let mut cx = Context::from_waker(&waker);

        let mut slot = self.future.lock().unwrap();
        let Some(future) = slot.as_mut() else {
            // Woken after completion; nothing to do.
            return;
        };
        // Clear the queued flag before polling so wakeups arriving during
        // the poll re-enqueue the task.
        self.queued.store(false, Ordering::Release);

        match future.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {
                tracing::trace!(task.id = self.id.as_u64(), "task complete");
                *slot = None;
                if let Some(core) = self.core.upgrade() {
                    core.task_finished();
                }
            }
            Poll::Pending => {}
        }
    }
}

impl Drop for TaskCell {
    fn drop(&mut self) {
        // A task dropped before completion (executor shutdown) still counts
        // as finished for quiescence purposes.
        if self.future.get_mut().unwrap().is_some()
            && let Some(core) = self.core.upgrade()
        {
            core.task_finished();
        }
    }
}

impl ArcWake for TaskCell {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if arc_self.queued.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(core) = arc_self.core.upgrade() {
            core.schedule(arc_self.clone());
        }
    }
}

/// Yield the current fiber, allowing other fibers to run.
///
/// The fiber is immediately re-enqueued at the back of the run queue.
pub async fn yield_now() {
    struct YieldNow {
        yielded: bool,
    }

    impl Future for YieldNow {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.yielded {
                return Poll::Ready(());
            }
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }

    YieldNow { yielded: false }.await;
}
