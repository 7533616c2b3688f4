//! Scheduler configuration.

use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::{Arc, Mutex};
use std::thread;

use super::worker::Worker;
use super::{Scheduler, SchedulerInner, SchedulerStat, Shared};
use crate::epoch::EpochDomain;
use crate::park::Parker;
use crate::queue::{steal_queue, InjectQueue};
use crate::reactor::Reactor;
use crate::shim;

/// Builds a [`Scheduler`].
///
/// ```no_run
/// use weft_runtime::Scheduler;
///
/// let scheduler = Scheduler::builder()
///     .workers(4)
///     .local_queue_capacity(512)
///     .build();
/// # scheduler.shutdown();
/// ```
pub struct SchedulerBuilder {
    workers: usize,
    local_queue_capacity: usize,
    pin_workers: bool,
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        SchedulerBuilder {
            workers: 0,
            local_queue_capacity: 256,
            pin_workers: false,
        }
    }

    /// Number of worker threads. `0` (the default) uses the machine's
    /// available parallelism.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Initial capacity of each worker's steal queue. Must be a power of
    /// two; the queue doubles on overflow.
    pub fn local_queue_capacity(mut self, capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "local queue capacity must be a power of two"
        );
        self.local_queue_capacity = capacity;
        self
    }

    /// Pin each worker thread to a CPU core, round-robin over the cores the
    /// OS reports.
    pub fn pin_workers(mut self, pin: bool) -> Self {
        self.pin_workers = pin;
        self
    }

    /// Construct the scheduler, spawning the reactor thread and the worker
    /// threads. Resource failures here abort initialisation.
    pub fn build(self) -> Scheduler {
        let worker_count = if self.workers == 0 {
            thread::available_parallelism()
                .map(|parallelism| parallelism.get())
                .unwrap_or(4)
        } else {
            self.workers
        };

        let domain = shim::Arc::new(EpochDomain::new());
        let reactor = Reactor::new().expect("failed to create reactor (epoll)");

        let mut locals = Vec::with_capacity(worker_count);
        let mut stealers = Vec::with_capacity(worker_count);
        let mut participants = Vec::with_capacity(worker_count);
        let mut parkers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let participant = domain.register();
            let (local, stealer) =
                steal_queue(self.local_queue_capacity, domain.clone(), participant.clone());
            locals.push(local);
            stealers.push(stealer);
            participants.push(participant);
            parkers.push(Arc::new(Parker::new()));
        }

        let shared = Arc::new(Shared {
            inject: InjectQueue::new(),
            stealers,
            parkers: parkers.clone(),
            running: AtomicBool::new(true),
            wake_cursor: AtomicUsize::new(0),
            reactor: reactor.clone(),
            epoch: domain,
            stat: SchedulerStat::new(),
        });
        reactor.bind(&shared);

        let cores = if self.pin_workers {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut threads = Vec::with_capacity(worker_count + 1);
        threads.push(
            thread::Builder::new()
                .name("weft-reactor".to_string())
                .spawn({
                    let reactor = reactor.clone();
                    move || reactor.run()
                })
                .expect("failed to spawn reactor thread"),
        );

        for (id, (local, participant)) in locals
            .into_iter()
            .zip(participants.into_iter())
            .enumerate()
        {
            let pin_core = if cores.is_empty() {
                None
            } else {
                Some(cores[id % cores.len()])
            };
            let worker = Worker::new(
                id,
                shared.clone(),
                local,
                participant,
                parkers[id].clone(),
                pin_core,
            );
            threads.push(
                thread::Builder::new()
                    .name(format!("weft-worker-{id}"))
                    .spawn(move || worker.run())
                    .expect("failed to spawn worker thread"),
            );
        }

        tracing::info!(workers = worker_count, "scheduler online");
        Scheduler {
            inner: Arc::new(SchedulerInner {
                shared,
                threads: Mutex::new(threads),
            }),
        }
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
