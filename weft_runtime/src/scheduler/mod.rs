//! Scheduler: workers, queues, and the reactor under one handle.
//!
//! `N` worker threads each own a steal queue; external spawns and reactor
//! deliveries funnel through a shared inject queue; exactly one reactor
//! thread turns readiness and timer expiry into re-injected fiber addresses.
//!
//! The [`Scheduler`] itself is a cheap cloneable handle. Fibers capture
//! clones of it to spawn, sleep, and build sync primitives.

mod builder;
mod stat;
pub(crate) mod worker;

pub use builder::SchedulerBuilder;
pub use stat::SchedulerStat;

use std::cell::Cell;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::epoch::DomainHandle;
use crate::fiber::{Fiber, JoinHandle};
use crate::park::Parker;
use crate::queue::{InjectQueue, LocalQueue, Stealer};
use crate::reactor::Reactor;

/// State shared by the workers, the reactor, and every scheduler handle.
pub(crate) struct Shared {
    pub(crate) inject: InjectQueue,
    pub(crate) stealers: Vec<Stealer>,
    pub(crate) parkers: Vec<Arc<Parker>>,
    pub(crate) running: AtomicBool,
    wake_cursor: AtomicUsize,
    pub(crate) reactor: Reactor,
    pub(crate) epoch: DomainHandle,
    pub(crate) stat: SchedulerStat,
}

impl Shared {
    /// Queue a fiber address and wake one worker.
    pub(crate) fn inject_addr(&self, addr: usize) {
        if !self.running.load(Ordering::Acquire) {
            // Late delivery during teardown; releasing is all that is left.
            drop(unsafe { Fiber::from_raw(addr) });
            return;
        }
        self.inject.push_addr(addr);
        self.wake_one();
    }

    /// Queue an address, preferring the current worker's own queue when the
    /// submission comes from inside the pool.
    pub(crate) fn submit(&self, addr: usize) {
        let pushed_local = WORKER_CONTEXT.with(|ctx| match ctx.get() {
            Some(worker) if std::ptr::eq(worker.shared, self as *const Shared) => {
                if !self.running.load(Ordering::Acquire) {
                    return false;
                }
                unsafe { &*worker.queue }.push(addr);
                true
            }
            _ => false,
        });
        if pushed_local {
            // Peers may be parked while this worker stays busy; give one a
            // chance to steal.
            self.wake_one();
        } else {
            self.inject_addr(addr);
        }
    }

    /// Round-robin wake so spawn bursts spread across the pool instead of
    /// hammering one parker.
    fn wake_one(&self) {
        if self.parkers.is_empty() {
            return;
        }
        let cursor = self.wake_cursor.fetch_add(1, Ordering::Relaxed);
        self.parkers[cursor % self.parkers.len()].unpark();
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Arc<Shared> {
        Arc::new(Shared {
            inject: InjectQueue::new(),
            stealers: Vec::new(),
            parkers: Vec::new(),
            running: AtomicBool::new(true),
            wake_cursor: AtomicUsize::new(0),
            reactor: Reactor::new().expect("failed to create reactor (epoll)"),
            epoch: crate::shim::Arc::new(crate::epoch::EpochDomain::new()),
            stat: SchedulerStat::new(),
        })
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Addresses still queued own a reference each.
        while let Some(addr) = self.inject.pop_addr() {
            drop(unsafe { Fiber::from_raw(addr) });
        }
    }
}

#[derive(Clone, Copy)]
pub(crate) struct WorkerContext {
    pub(crate) shared: *const Shared,
    pub(crate) queue: *const LocalQueue,
}

thread_local! {
    /// Set for the lifetime of a worker's run loop on its own thread.
    pub(crate) static WORKER_CONTEXT: Cell<Option<WorkerContext>> = const { Cell::new(None) };
}

/// Handle to a running scheduler.
///
/// ```no_run
/// use weft_runtime::Scheduler;
///
/// let scheduler = Scheduler::new(4);
/// scheduler.spawn(async {
///     tracing::info!("hello from a fiber");
/// });
/// scheduler.shutdown();
/// ```
#[derive(Clone)]
pub struct Scheduler {
    pub(crate) inner: Arc<SchedulerInner>,
}

pub(crate) struct SchedulerInner {
    pub(crate) shared: Arc<Shared>,
    pub(crate) threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Scheduler {
    /// Start a scheduler with `workers` worker threads (`0` = available
    /// parallelism) and one reactor thread.
    pub fn new(workers: usize) -> Scheduler {
        SchedulerBuilder::new().workers(workers).build()
    }

    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    /// Submit a fiber for execution; ownership of the computation moves into
    /// the runtime. The fiber starts suspended, so the spawner never runs it
    /// on its own thread.
    pub fn spawn<F>(&self, future: F) -> JoinHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let fiber = Fiber::new(future, self.inner.shared.clone());
        tracing::trace!(fiber = ?fiber, "spawn");
        let addr = fiber.clone_into_raw();
        self.inner.shared.submit(addr);
        JoinHandle::new(fiber)
    }

    /// Re-submit an already-built fiber (wait queues hand batons back this
    /// way).
    pub(crate) fn submit_fiber(&self, fiber: Fiber) {
        self.inner.shared.submit(fiber.into_raw());
    }

    /// Reactor handle for awaitable constructors.
    pub fn reactor(&self) -> &Reactor {
        &self.inner.shared.reactor
    }

    pub fn stats(&self) -> &SchedulerStat {
        &self.inner.shared.stat
    }

    pub fn worker_count(&self) -> usize {
        self.inner.shared.parkers.len()
    }

    /// Stop the runtime: stops the reactor, wakes and joins every worker,
    /// destroys fibers that never ran, and frees all deferred memory.
    /// Idempotent. Must not be called from inside a fiber.
    pub fn shutdown(&self) {
        self.inner.shutdown(true);
    }
}

impl SchedulerInner {
    fn shutdown(&self, join: bool) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        tracing::info!("scheduler shutting down");
        self.shared.reactor.stop();
        for parker in &self.shared.parkers {
            parker.unpark();
        }

        if join {
            let mut threads = self.threads.lock().expect("thread list poisoned");
            for handle in threads.drain(..) {
                let _ = handle.join();
            }

            // Workers are gone: destroy fibers that never ran and release
            // all deferred buffers.
            let mut dropped = 0usize;
            while let Some(addr) = self.shared.inject.pop_addr() {
                drop(unsafe { Fiber::from_raw(addr) });
                dropped += 1;
            }
            if dropped > 0 {
                tracing::debug!(dropped, "destroyed never-run fibers");
            }
            self.shared.epoch.drain_all();
        }
        tracing::info!("scheduler stopped");
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        // Joining from inside the pool would deadlock; detached workers
        // still observe the cleared running flag and exit.
        let on_worker = WORKER_CONTEXT.with(|ctx| {
            ctx.get()
                .map(|worker| std::ptr::eq(worker.shared, Arc::as_ptr(&self.shared)))
                .unwrap_or(false)
        });
        self.shutdown(!on_worker);
    }
}
