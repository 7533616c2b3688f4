//! Epoch-based deferred reclamation.
//!
//! The steal queues publish their ring buffers to concurrent stealers and
//! replace them on growth. The old buffer cannot be freed while a stealer may
//! still be reading it, so the owner retires it into an [`EpochDomain`] and
//! the domain frees it only after every active participant has moved past the
//! epoch in which it was retired.
//!
//! The domain is scoped to one scheduler instance. Workers register a
//! [`Participant`] each, enter a critical section around every queue scan,
//! and must leave it before parking; a participant that stays active pins the
//! epoch and stalls reclamation for the whole domain.

use std::sync::atomic::Ordering;

use crate::shim::{Arc, AtomicBool, AtomicUsize, Mutex};

/// Retire bins rotate through three generations.
const BIN_COUNT: usize = 3;
/// A `try_advance` is attempted once per this many retires.
const ADVANCE_EVERY: usize = 64;

/// Shared handle to a participant slot.
pub type ParticipantHandle = Arc<Participant>;
/// Shared handle to a domain.
pub type DomainHandle = Arc<EpochDomain>;

/// A pointer whose destruction has been deferred.
pub struct Retired {
    ptr: *mut (),
    drop_fn: unsafe fn(*mut ()),
}

// The deferred value was Send when it was boxed; only the domain touches it
// afterwards.
unsafe impl Send for Retired {}

impl Retired {
    /// Defer destruction of a boxed value.
    pub fn new<T: Send + 'static>(value: Box<T>) -> Self {
        unsafe fn drop_boxed<T>(ptr: *mut ()) {
            drop(unsafe { Box::from_raw(ptr as *mut T) });
        }
        Retired {
            ptr: Box::into_raw(value) as *mut (),
            drop_fn: drop_boxed::<T>,
        }
    }
}

impl Drop for Retired {
    fn drop(&mut self) {
        unsafe { (self.drop_fn)(self.ptr) }
    }
}

/// Per-worker participant slot.
pub struct Participant {
    active: AtomicBool,
    observed: AtomicUsize,
    bins: [Mutex<Vec<Retired>>; BIN_COUNT],
    retire_ops: AtomicUsize,
}

impl Participant {
    fn new() -> Self {
        Participant {
            active: AtomicBool::new(false),
            observed: AtomicUsize::new(0),
            bins: [
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
            ],
            retire_ops: AtomicUsize::new(0),
        }
    }
}

/// Holds the participant inside the critical section until dropped.
#[must_use]
pub struct Guard<'a> {
    participant: &'a Participant,
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        self.participant.active.store(false, Ordering::Release);
    }
}

/// Scheduler-scoped reclamation domain.
pub struct EpochDomain {
    epoch: AtomicUsize,
    registry: Mutex<Vec<ParticipantHandle>>,
    /// Bins inherited from deregistered participants, same generation
    /// indexing as the per-participant bins.
    orphans: [Mutex<Vec<Retired>>; BIN_COUNT],
}

impl EpochDomain {
    pub fn new() -> Self {
        EpochDomain {
            epoch: AtomicUsize::new(0),
            registry: Mutex::new(Vec::new()),
            orphans: [
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
            ],
        }
    }

    /// Register a new participant with the domain.
    pub fn register(&self) -> ParticipantHandle {
        let participant = Arc::new(Participant::new());
        self.registry
            .lock()
            .expect("epoch registry poisoned")
            .push(participant.clone());
        participant
    }

    /// Enter the critical section.
    ///
    /// The SeqCst store of the activity flag is what orders it ahead of the
    /// participant's later buffer loads; with a plain release store the flag
    /// could surface after a stealer already dereferenced a retirable
    /// buffer, and `try_advance` would free it underneath the read.
    pub fn enter<'a>(&self, participant: &'a Participant) -> Guard<'a> {
        participant
            .observed
            .store(self.epoch.load(Ordering::Relaxed), Ordering::Relaxed);
        participant.active.store(true, Ordering::SeqCst);
        Guard { participant }
    }

    /// Defer destruction of `garbage` until no active participant can still
    /// hold a reference into it.
    pub fn retire(&self, participant: &Participant, garbage: Retired) {
        let epoch = self.epoch.load(Ordering::Relaxed);
        participant.bins[epoch % BIN_COUNT]
            .lock()
            .expect("retire bin poisoned")
            .push(garbage);

        let ops = participant.retire_ops.fetch_add(1, Ordering::Relaxed) + 1;
        if ops % ADVANCE_EVERY == 0 {
            self.try_advance();
        }
    }

    /// Best-effort epoch advance.
    ///
    /// Fails (harmlessly) whenever some active participant has not caught up
    /// to the current epoch. On success, drains the generation that was
    /// current two epochs back.
    pub fn try_advance(&self) -> bool {
        let epoch = self.epoch.load(Ordering::Acquire);

        let registry = self.registry.lock().expect("epoch registry poisoned");
        for participant in registry.iter() {
            if participant.active.load(Ordering::SeqCst)
                && participant.observed.load(Ordering::Relaxed) != epoch
            {
                return false;
            }
        }
        if self
            .epoch
            .compare_exchange(epoch, epoch + 1, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            // A concurrent advancer won; its drain covers this generation.
            return false;
        }

        let safe_bin = (epoch + 2) % BIN_COUNT;
        let mut drained: Vec<Retired> = Vec::new();
        for participant in registry.iter() {
            drained.append(
                &mut participant.bins[safe_bin]
                    .lock()
                    .expect("retire bin poisoned"),
            );
        }
        drop(registry);
        drained.append(&mut self.orphans[safe_bin].lock().expect("orphan bin poisoned"));

        if !drained.is_empty() {
            tracing::trace!(epoch = epoch + 1, freed = drained.len(), "advanced epoch");
        }
        drop(drained);
        true
    }

    /// Remove a participant, moving its pending retires into the domain's
    /// orphan bins so a gone worker can never stall advancement.
    pub fn deregister(&self, participant: &ParticipantHandle) {
        self.registry
            .lock()
            .expect("epoch registry poisoned")
            .retain(|other| !Arc::ptr_eq(other, participant));

        for generation in 0..BIN_COUNT {
            let mut bin = participant.bins[generation]
                .lock()
                .expect("retire bin poisoned");
            self.orphans[generation]
                .lock()
                .expect("orphan bin poisoned")
                .append(&mut bin);
        }
    }

    /// Free everything still pending. Only sound once no reader remains,
    /// which the scheduler guarantees after joining its workers.
    pub fn drain_all(&self) {
        let registry = self.registry.lock().expect("epoch registry poisoned");
        let mut freed = 0usize;
        for participant in registry.iter() {
            for generation in 0..BIN_COUNT {
                let mut bin = participant.bins[generation]
                    .lock()
                    .expect("retire bin poisoned");
                freed += bin.len();
                bin.clear();
            }
        }
        drop(registry);
        for generation in 0..BIN_COUNT {
            let mut bin = self.orphans[generation].lock().expect("orphan bin poisoned");
            freed += bin.len();
            bin.clear();
        }
        if freed > 0 {
            tracing::debug!(freed, "drained epoch domain");
        }
    }
}

impl Default for EpochDomain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool as StdAtomicBool, Ordering};
    use std::sync::Arc as StdArc;

    struct DropFlag(StdArc<StdAtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn flagged() -> (Retired, StdArc<StdAtomicBool>) {
        let flag = StdArc::new(StdAtomicBool::new(false));
        (Retired::new(Box::new(DropFlag(flag.clone()))), flag)
    }

    #[test]
    fn retire_without_readers_frees_after_two_advances() {
        let domain = EpochDomain::new();
        let participant = domain.register();
        let (garbage, flag) = flagged();

        domain.retire(&participant, garbage);
        assert!(!flag.load(Ordering::SeqCst));

        // Retired under epoch 0, bin 0. Advancing 0->1 drains bin 2,
        // advancing 1->2 drains bin 0.
        assert!(domain.try_advance());
        assert!(!flag.load(Ordering::SeqCst));
        assert!(domain.try_advance());
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn active_stale_participant_blocks_advance() {
        let domain = EpochDomain::new();
        let reader = domain.register();
        let writer = domain.register();

        let guard = domain.enter(&reader);
        let (garbage, flag) = flagged();
        domain.retire(&writer, garbage);

        // First advance succeeds: the reader observed the current epoch.
        assert!(domain.try_advance());
        // Now the reader is stale, so the epoch is pinned and the retired
        // generation stays unfreed.
        assert!(!domain.try_advance());
        assert!(!domain.try_advance());
        assert!(!flag.load(Ordering::SeqCst));

        drop(guard);
        assert!(domain.try_advance());
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn reentering_participant_does_not_block() {
        let domain = EpochDomain::new();
        let reader = domain.register();
        let writer = domain.register();

        let (garbage, flag) = flagged();
        domain.retire(&writer, garbage);

        for _ in 0..3 {
            // Enter/exit each round, like a worker scanning queues.
            let guard = domain.enter(&reader);
            drop(guard);
            domain.try_advance();
        }
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn deregistered_bins_move_to_orphans_and_still_free() {
        let domain = EpochDomain::new();
        let worker = domain.register();
        let (garbage, flag) = flagged();
        domain.retire(&worker, garbage);

        domain.deregister(&worker);
        // The gone worker no longer blocks anything.
        assert!(domain.try_advance());
        assert!(domain.try_advance());
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn drain_all_frees_everything() {
        let domain = EpochDomain::new();
        let worker = domain.register();
        let mut flags = Vec::new();
        for _ in 0..10 {
            let (garbage, flag) = flagged();
            domain.retire(&worker, garbage);
            flags.push(flag);
        }
        domain.drain_all();
        assert!(flags.iter().all(|f| f.load(Ordering::SeqCst)));
    }

    #[test]
    fn retire_churn_reclaims_under_concurrent_readers() {
        let domain = StdArc::new(EpochDomain::new());
        let stop = StdArc::new(StdAtomicBool::new(false));

        let mut readers = Vec::new();
        for _ in 0..3 {
            let domain = domain.clone();
            let stop = stop.clone();
            readers.push(std::thread::spawn(move || {
                let participant = domain.register();
                while !stop.load(Ordering::SeqCst) {
                    let guard = domain.enter(&participant);
                    std::hint::spin_loop();
                    drop(guard);
                }
                domain.deregister(&participant);
            }));
        }

        let writer = domain.register();
        let mut flags = Vec::new();
        for _ in 0..1_000 {
            let (garbage, flag) = flagged();
            domain.retire(&writer, garbage);
            flags.push(flag);
        }
        stop.store(true, Ordering::SeqCst);
        for reader in readers {
            reader.join().unwrap();
        }

        // Readers are gone; a few advances clear the tail generations.
        for _ in 0..4 {
            domain.try_advance();
        }
        assert!(flags.iter().all(|f| f.load(Ordering::SeqCst)));
    }
}
