// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-process runtime state and the ambient context.
//!
//! A [`Runtime`] ties a transport to a scheduler and owns the shared tables
//! of the remote-reference protocol. Worker threads and the communication
//! thread carry a thread-local handle to the runtime, which backs the free
//! functions ([`rank`], [`size`], `rexec`, ...). One process can host
//! several runtimes (one per rank of an in-process mesh), which is how the
//! multi-rank test scenarios run inside a single test binary.

use crate::config::Config;
use crate::server;
use crate::shared_rptr::RemoteHandle;
use lasync::Executor;
use lcomm::{Rank, Transport};
use lwire::Envelope;
use serde::Serialize;
use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock, Weak};

/// A process' membership in the task cluster: transport + scheduler + the
/// remote-reference tables.
pub struct Runtime {
    core: Arc<RuntimeCore>,
    executor: Arc<Executor>,
}

pub(crate) struct RuntimeCore {
    pub(crate) transport: Box<dyn Transport>,
    executor: OnceLock<Arc<Executor>>,
    /// Outbound task messages awaiting the communication thread.
    outbound: Mutex<VecDeque<Outbound>>,
    /// Held by the communication thread while it talks to the transport;
    /// see [`with_comm_lock`].
    pub(crate) comm_gate: lasync::sync::Mutex,
    /// Home-side pin table: wire copies of locally-owned shared pointees.
    pins: Mutex<HashMap<u64, PinEntry>>,
    /// Remote-side handle table, coalescing copies per `(home, addr)`.
    remotes: Mutex<HashMap<(Rank, u64), Weak<RemoteHandle>>>,
}

pub(crate) struct Outbound {
    pub(crate) dest: Rank,
    pub(crate) bytes: Vec<u8>,
}

/// One pinned pointee: how many wire copies are outstanding, the keep-alive
/// strong reference, and a closure that serializes the pointee for
/// migration.
struct PinEntry {
    count: u64,
    keepalive: Arc<dyn Any + Send + Sync>,
    /// Shared so it can be invoked outside the table lock: serializing the
    /// pointee may itself pin nested handles.
    fetch: Arc<dyn Fn() -> Vec<u8> + Send + Sync>,
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<RuntimeCore>>> = const { RefCell::new(None) };
}

/// The rank of the current process within its group.
///
/// # Panics
///
/// Panics outside a runtime context.
pub fn rank() -> Rank {
    current().transport.rank()
}

/// The number of processes in the group.
///
/// # Panics
///
/// Panics outside a runtime context.
pub fn size() -> usize {
    current().transport.size()
}

/// The current rank, or `None` outside a runtime context. Useful from code
/// that may run during teardown, such as destructors.
pub fn try_rank() -> Option<Rank> {
    try_current().map(|core| core.transport.rank())
}

pub(crate) fn current() -> Arc<RuntimeCore> {
    try_current().expect("no runtime context on this thread")
}

pub(crate) fn try_current() -> Option<Arc<RuntimeCore>> {
    CURRENT.with(|current| current.borrow().clone())
}

/// Install the context for the rest of the thread's lifetime (worker
/// threads).
fn install(core: Arc<RuntimeCore>) {
    CURRENT.with(|current| *current.borrow_mut() = Some(core));
}

pub(crate) struct ContextGuard {
    prev: Option<Arc<RuntimeCore>>,
}

pub(crate) fn enter(core: Arc<RuntimeCore>) -> ContextGuard {
    let prev = CURRENT.with(|current| current.borrow_mut().replace(core));
    ContextGuard { prev }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|current| *current.borrow_mut() = prev);
    }
}

/// Stall the communication thread at an idle point and use the transport
/// from the calling fiber.
pub async fn with_comm_lock<R>(f: impl FnOnce(&dyn Transport) -> R) -> R {
    let core = current();
    let _gate = core.comm_gate.lock().await;
    f(core.transport.as_ref())
}

/// Force all subsequently-spawned fibers to run serially on the spawning
/// thread, for embedding non-reentrant code. Nestable; balance with
/// [`threading_enable`].
pub fn threading_disable() {
    lasync::executor::current().threading_disable();
}

pub fn threading_enable() {
    lasync::executor::current().threading_enable();
}

// === impl Runtime ===

impl Runtime {
    /// Bring up a runtime over an already-connected transport: scheduler
    /// workers are started and tied to this runtime's context.
    pub fn new(transport: impl Transport, config: &Config) -> Self {
        let core = Arc::new(RuntimeCore {
            transport: Box::new(transport),
            executor: OnceLock::new(),
            outbound: Mutex::new(VecDeque::new()),
            comm_gate: lasync::sync::Mutex::new(),
            pins: Mutex::new(HashMap::new()),
            remotes: Mutex::new(HashMap::new()),
        });

        // Weak: the executor (and its worker threads) must not keep the
        // runtime core alive past `Runtime`.
        let hook_core = Arc::downgrade(&core);
        let mut builder = Executor::builder().on_thread_start(move || {
            if let Some(core) = hook_core.upgrade() {
                install(core);
            }
        });
        if let Some(num_workers) = config.num_workers {
            builder = builder.num_workers(num_workers);
        }
        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }
        let executor = builder.build();
        core.executor
            .set(Arc::clone(&executor))
            .unwrap_or_else(|_| unreachable!("executor installed twice"));

        tracing::debug!(
            rank = core.transport.rank(),
            size = core.transport.size(),
            workers = executor.num_workers(),
            "runtime up"
        );
        Runtime { core, executor }
    }

    pub fn rank(&self) -> Rank {
        self.core.transport.rank()
    }

    pub fn size(&self) -> usize {
        self.core.transport.size()
    }

    /// Drive the server loop until global termination.
    ///
    /// On rank 0, `user_main` runs as a fiber and its exit code is returned;
    /// other ranks pass `user_main` but never invoke it and return 0.
    pub fn eventloop<F, Fut>(&self, user_main: F) -> i32
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = i32> + Send + 'static,
    {
        let _ctx = enter(Arc::clone(&self.core));
        let result = (self.rank() == 0).then(|| self.executor.spawn(user_main()));
        self.executor
            .block_on(server::comm_loop(Arc::clone(&self.core), result))
    }

    /// Tear down the scheduler. The transport goes down when the runtime is
    /// dropped afterwards.
    pub fn finalize(self) {
        self.executor.shutdown();
    }
}

impl core::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Runtime")
            .field("rank", &self.rank())
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}

// === impl RuntimeCore ===

impl RuntimeCore {
    pub(crate) fn rank(&self) -> Rank {
        self.transport.rank()
    }

    pub(crate) fn executor(&self) -> &Arc<Executor> {
        self.executor.get().expect("runtime executor not installed")
    }

    /// Append an already-built envelope to the outbound queue.
    ///
    /// # Panics
    ///
    /// A task that fails to serialize is a fatal error on the sender.
    pub(crate) fn enqueue(&self, dest: Rank, envelope: &Envelope) {
        let bytes = envelope
            .encode()
            .unwrap_or_else(|err| panic!("failed to serialize task for rank {dest}: {err}"));
        self.outbound
            .lock()
            .unwrap()
            .push_back(Outbound { dest, bytes });
    }

    /// Build and enqueue a task envelope in one step.
    pub(crate) fn enqueue_task<A: Serialize>(&self, dest: Rank, name: &'static str, args: &A) {
        let envelope = Envelope::new(name, args)
            .unwrap_or_else(|err| panic!("failed to serialize task {name:?}: {err}"));
        self.enqueue(dest, &envelope);
    }

    pub(crate) fn take_outbound(&self) -> Vec<Outbound> {
        let mut queue = self.outbound.lock().unwrap();
        queue.drain(..).collect()
    }

    pub(crate) fn outbound_is_empty(&self) -> bool {
        self.outbound.lock().unwrap().is_empty()
    }

    // --- home pin table ---

    /// Account one wire copy of a locally-owned pointee, pinning it alive.
    pub(crate) fn pin<T>(&self, arc: &Arc<T>) -> u64
    where
        T: Serialize + Send + Sync + 'static,
    {
        let addr = Arc::as_ptr(arc) as usize as u64;
        let mut pins = self.pins.lock().unwrap();
        let entry = pins.entry(addr).or_insert_with(|| {
            let fetch_arc = Arc::clone(arc);
            PinEntry {
                count: 0,
                keepalive: Arc::clone(arc) as Arc<dyn Any + Send + Sync>,
                fetch: Arc::new(move || {
                    bincode::serialize(&Ok::<&T, String>(&fetch_arc))
                        .expect("pinned pointee failed to serialize")
                }),
            }
        });
        entry.count += 1;
        addr
    }

    /// A wire copy arrived back home: reclaim its count and hand out the
    /// ordinary local strong reference.
    pub(crate) fn unpin_claim<T>(&self, addr: u64) -> Arc<T>
    where
        T: Send + Sync + 'static,
    {
        let mut pins = self.pins.lock().unwrap();
        let entry = pins
            .get_mut(&addr)
            .expect("wire copy returned home but the pointee is not pinned");
        let Ok(arc) = Arc::clone(&entry.keepalive).downcast::<T>() else {
            panic!("pinned pointee type mismatch")
        };
        entry.count -= 1;
        if entry.count == 0 {
            pins.remove(&addr);
        }
        arc
    }

    pub(crate) fn pin_incref(&self, addr: u64) {
        let mut pins = self.pins.lock().unwrap();
        let entry = pins
            .get_mut(&addr)
            .expect("incref for an unpinned pointee; refcount protocol violated");
        entry.count += 1;
    }

    pub(crate) fn pin_decref(&self, addr: u64) {
        let mut pins = self.pins.lock().unwrap();
        let entry = pins
            .get_mut(&addr)
            .expect("decref for an unpinned pointee; refcount protocol violated");
        entry.count -= 1;
        if entry.count == 0 {
            // Dropping the keep-alive releases the home strong count held
            // for remote copies; the pointee dies when the last home-side
            // handle goes too.
            pins.remove(&addr);
        }
    }

    /// Serialize the pinned pointee at `addr` for migration.
    pub(crate) fn pin_fetch(&self, addr: u64) -> Vec<u8> {
        let fetch = {
            let pins = self.pins.lock().unwrap();
            let entry = pins
                .get(&addr)
                .expect("fetch for an unpinned pointee; refcount protocol violated");
            Arc::clone(&entry.fetch)
        };
        fetch()
    }

    // --- remote handle table ---

    /// Adopt a wire copy that arrived on a non-home rank: coalesce into the
    /// existing handle if there is one (balancing the superfluous incref
    /// with an immediate decref), otherwise install a fresh handle owning
    /// the wire copy's count.
    pub(crate) fn adopt_remote(self: &Arc<Self>, home: Rank, addr: u64) -> Arc<RemoteHandle> {
        let mut remotes = self.remotes.lock().unwrap();
        if let Some(existing) = remotes.get(&(home, addr)).and_then(Weak::upgrade) {
            drop(remotes);
            self.enqueue_decref(home, addr);
            return existing;
        }
        let handle = Arc::new(RemoteHandle::new(home, addr, Arc::downgrade(self)));
        remotes.insert((home, addr), Arc::downgrade(&handle));
        handle
    }

    /// Called when the last local handle for `(home, addr)` is gone.
    pub(crate) fn forget_remote(&self, home: Rank, addr: u64) {
        let mut remotes = self.remotes.lock().unwrap();
        if let Some(slot) = remotes.get(&(home, addr))
            && slot.strong_count() == 0
        {
            remotes.remove(&(home, addr));
        }
    }

    pub(crate) fn enqueue_incref(&self, home: Rank, addr: u64) {
        self.enqueue_task(home, crate::builtin::INCREF, &(addr,));
    }

    pub(crate) fn enqueue_decref(&self, home: Rank, addr: u64) {
        self.enqueue_task(home, crate::builtin::DECREF, &(addr,));
    }
}

impl core::fmt::Debug for RuntimeCore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RuntimeCore")
            .field("rank", &self.transport.rank())
            .field("size", &self.transport.size())
            .finish_non_exhaustive()
    }
}
