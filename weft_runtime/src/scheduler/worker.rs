//! Per-thread worker loop.

use std::cell::Cell;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_utils::Backoff;

use super::{Shared, WorkerContext, WORKER_CONTEXT};
use crate::epoch::{Guard, ParticipantHandle};
use crate::fiber::{Fiber, Resumption};
use crate::park::Parker;
use crate::queue::LocalQueue;

/// Inject-queue rechecks (one CPU pause each) before a worker parks.
const SPIN_RECHECKS: usize = 50;

pub(crate) struct Worker {
    id: usize,
    shared: Arc<Shared>,
    local: LocalQueue,
    participant: ParticipantHandle,
    parker: Arc<Parker>,
    rng: Cell<u64>,
    pin_core: Option<core_affinity::CoreId>,
}

impl Worker {
    pub(crate) fn new(
        id: usize,
        shared: Arc<Shared>,
        local: LocalQueue,
        participant: ParticipantHandle,
        parker: Arc<Parker>,
        pin_core: Option<core_affinity::CoreId>,
    ) -> Worker {
        Worker {
            id,
            shared,
            local,
            participant,
            parker,
            // Golden-ratio spread so neighbouring workers do not walk the
            // same victim sequence.
            rng: Cell::new((id as u64).wrapping_add(0x9E37_79B9_7F4A_7C15)),
            pin_core,
        }
    }

    pub(crate) fn run(self) {
        if let Some(core) = self.pin_core {
            if core_affinity::set_for_current(core) {
                tracing::debug!(id = self.id, core = core.id, "pinned worker to core");
            }
        }
        WORKER_CONTEXT.with(|ctx| {
            ctx.set(Some(WorkerContext {
                shared: Arc::as_ptr(&self.shared),
                queue: &self.local,
            }))
        });
        tracing::debug!(id = self.id, "worker online");

        while self.shared.running.load(Ordering::Acquire) {
            match self.next_fiber() {
                Some(fiber) => self.run_fiber(fiber),
                None => {
                    if !self.shared.running.load(Ordering::Acquire) {
                        break;
                    }
                    self.shared.stat.on_park();
                    self.parker.park();
                }
            }
        }

        WORKER_CONTEXT.with(|ctx| ctx.set(None));
        self.drain_local();
        self.shared.epoch.deregister(&self.participant);
        tracing::debug!(id = self.id, "worker offline");
    }

    /// Own queue, then the inject queue, then one randomized sweep over the
    /// peers. The epoch guard covers the whole scan and is dropped before
    /// the fiber runs or the worker parks; a parked worker left inside the
    /// critical section would pin the epoch and reclamation with it.
    fn next_fiber(&self) -> Option<Fiber> {
        {
            let guard = self.shared.epoch.enter(&self.participant);
            let addr = match self.local.pop() {
                Some(addr) => Some(addr),
                None => match self.shared.inject.pop_addr() {
                    Some(addr) => Some(addr),
                    None => self.steal_sweep(&guard),
                },
            };
            drop(guard);
            if let Some(addr) = addr {
                return Some(unsafe { Fiber::from_raw(addr) });
            }
        }

        // Brief spin on the inject queue before sleeping; a wakeup often
        // lands right as the queues drain.
        let backoff = Backoff::new();
        for _ in 0..SPIN_RECHECKS {
            if !self.shared.running.load(Ordering::Acquire) {
                return None;
            }
            backoff.spin();
            let guard = self.shared.epoch.enter(&self.participant);
            let addr = self.shared.inject.pop_addr();
            drop(guard);
            if let Some(addr) = addr {
                return Some(unsafe { Fiber::from_raw(addr) });
            }
        }
        None
    }

    /// One pass over the peers from a random starting point. Uniform victim
    /// choice keeps a starved pool from thundering onto the first non-empty
    /// queue.
    fn steal_sweep(&self, guard: &Guard<'_>) -> Option<usize> {
        let stealers = &self.shared.stealers;
        let n = stealers.len();
        if n <= 1 {
            return None;
        }
        let start = (self.xorshift() as usize) % n;
        for offset in 0..n {
            let victim = (start + offset) % n;
            if victim == self.id {
                continue;
            }
            if let Some(addr) = stealers[victim].steal(guard) {
                self.shared.stat.on_steal();
                tracing::trace!(id = self.id, victim, "stole a fiber");
                return Some(addr);
            }
        }
        None
    }

    /// Resume a fiber, following completed fibers into their continuations.
    /// The trampoline keeps chained completions at constant native stack
    /// depth.
    fn run_fiber(&self, fiber: Fiber) {
        let mut current = fiber;
        loop {
            match current.resume() {
                Resumption::Pending => break,
                Resumption::Busy => {
                    // A wakeup raced the in-flight poll; hand the address
                    // back instead of dropping it.
                    self.shared.inject_addr(current.into_raw());
                    break;
                }
                Resumption::Completed(Some(parent)) => current = parent,
                Resumption::Completed(None) => break,
            }
        }
    }

    /// Destroy fibers that never got to run (shutdown path).
    fn drain_local(&self) {
        let mut dropped = 0usize;
        while let Some(addr) = self.local.pop() {
            drop(unsafe { Fiber::from_raw(addr) });
            dropped += 1;
        }
        if dropped > 0 {
            tracing::debug!(id = self.id, dropped, "drained local queue");
        }
    }

    fn xorshift(&self) -> u64 {
        let mut x = self.rng.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng.set(x);
        x
    }
}
