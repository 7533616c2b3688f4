//! Worker parking primitive.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};

const EMPTY: u32 = 0;
const PARKED: u32 = 1;
const NOTIFIED: u32 = 2;

/// Three-state suspend/notify switch for a single worker thread.
///
/// An `unpark` that arrives before `park` makes the next `park` return
/// immediately, and repeated `unpark`s collapse into a single pending
/// notification.
pub(crate) struct Parker {
    state: AtomicU32,
    lock: Mutex<()>,
    cvar: Condvar,
}

impl Parker {
    pub(crate) fn new() -> Self {
        Parker {
            state: AtomicU32::new(EMPTY),
            lock: Mutex::new(()),
            cvar: Condvar::new(),
        }
    }

    /// Block the calling thread until notified.
    pub(crate) fn park(&self) {
        if self
            .state
            .compare_exchange(EMPTY, PARKED, Ordering::Acquire, Ordering::Acquire)
            .is_ok()
        {
            let mut guard = self.lock.lock().expect("parker mutex poisoned");
            while self.state.load(Ordering::Acquire) == PARKED {
                guard = self.cvar.wait(guard).expect("parker condvar poisoned");
            }
        }
        // Consumed a pending notification, or woke from the wait.
        self.state.store(EMPTY, Ordering::Release);
    }

    /// Wake the parked thread, or leave a notification for the next `park`.
    pub(crate) fn unpark(&self) {
        if self.state.swap(NOTIFIED, Ordering::Release) == PARKED {
            // Take the lock so this cannot slot between the parked thread's
            // state check and its condvar wait.
            drop(self.lock.lock().expect("parker mutex poisoned"));
            self.cvar.notify_one();
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn unpark_before_park_returns_immediately() {
        let parker = Parker::new();
        parker.unpark();

        let start = Instant::now();
        parker.park();
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn consecutive_unparks_coalesce() {
        let parker = Arc::new(Parker::new());
        parker.unpark();
        parker.unpark();
        parker.unpark();

        // The first park consumes the single pending notification.
        parker.park();

        // The second park must actually block until a fresh unpark.
        let p = parker.clone();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            p.unpark();
        });

        let start = Instant::now();
        parker.park();
        assert!(start.elapsed() >= Duration::from_millis(40));
        waker.join().unwrap();
    }

    #[test]
    fn unpark_wakes_parked_thread() {
        let parker = Arc::new(Parker::new());
        let p = parker.clone();

        let handle = std::thread::spawn(move || {
            let start = Instant::now();
            p.park();
            start.elapsed()
        });

        std::thread::sleep(Duration::from_millis(30));
        parker.unpark();
        let waited = handle.join().unwrap();
        assert!(waited >= Duration::from_millis(20));
        assert!(waited < Duration::from_secs(5));
    }
}
