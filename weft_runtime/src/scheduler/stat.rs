//! Scheduler-wide statistics.
//!
//! Plain atomic counters, readable at any time. Tests lean on these to
//! assert steal traffic and fiber accounting without instrumenting the hot
//! paths any further.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct SchedulerStat {
    spawned: AtomicU64,
    completed: AtomicU64,
    destroyed: AtomicU64,
    steals: AtomicU64,
    parks: AtomicU64,
    reactor_deliveries: AtomicU64,
}

impl SchedulerStat {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fibers ever created.
    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    /// Fibers whose body ran to completion.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Fibers fully destroyed (last reference released).
    pub fn destroyed(&self) -> u64 {
        self.destroyed.load(Ordering::Relaxed)
    }

    /// Fibers currently alive.
    pub fn alive(&self) -> u64 {
        self.spawned().saturating_sub(self.destroyed())
    }

    /// Successful steals across all workers.
    pub fn steals(&self) -> u64 {
        self.steals.load(Ordering::Relaxed)
    }

    /// Times a worker went to sleep on its parker.
    pub fn parks(&self) -> u64 {
        self.parks.load(Ordering::Relaxed)
    }

    /// Addresses the reactor handed back to the scheduler.
    pub fn reactor_deliveries(&self) -> u64 {
        self.reactor_deliveries.load(Ordering::Relaxed)
    }

    pub(crate) fn on_spawn(&self) {
        self.spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_complete(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_destroy(&self) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_steal(&self) {
        self.steals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_park(&self) {
        self.parks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_reactor_delivery(&self) {
        self.reactor_deliveries.fetch_add(1, Ordering::Relaxed);
    }
}
