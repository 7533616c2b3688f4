//! Readiness and timer event source.
//!
//! One reactor thread owns an epoll instance and a timer min-heap. Awaitables
//! arm one-shot registrations carrying a fiber address; when the fd becomes
//! ready (including peer close and error conditions) or the deadline passes,
//! the reactor hands the address back to the scheduler through the inject
//! queue. Every registration delivers exactly once: the reference the caller
//! exported is either delivered, or released when the reactor stops.

mod poller;
mod timer;

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Instant;

use crate::fiber::Fiber;
use crate::scheduler::Shared;
use poller::{Interest, Poller};
use timer::TimerHeap;

const EVENT_BATCH: usize = 128;

/// Cloneable handle to the reactor.
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<Inner>,
}

struct Inner {
    poller: Poller,
    timers: Mutex<TimerHeap>,
    /// Outstanding one-shot registrations: fd to the fiber address that will
    /// be delivered when it fires. One registration per fd at a time, like
    /// the single user-data slot epoll itself offers.
    registrations: Mutex<HashMap<RawFd, usize>>,
    running: AtomicBool,
    scheduler: OnceLock<Weak<Shared>>,
}

impl Reactor {
    pub(crate) fn new() -> io::Result<Reactor> {
        Ok(Reactor {
            inner: Arc::new(Inner {
                poller: Poller::new()?,
                timers: Mutex::new(TimerHeap::new()),
                registrations: Mutex::new(HashMap::new()),
                running: AtomicBool::new(true),
                scheduler: OnceLock::new(),
            }),
        })
    }

    /// Late-bind the scheduler the reactor delivers into.
    pub(crate) fn bind(&self, shared: &Arc<Shared>) {
        let _ = self.inner.scheduler.set(Arc::downgrade(shared));
    }

    /// Arm a one-shot read registration; `fiber`'s reference is held until
    /// the event delivers it. A kernel error releases the reference and
    /// surfaces here, and no later wakeup can occur.
    pub fn register_read(&self, fd: RawFd, fiber: Fiber) -> io::Result<()> {
        self.register(fd, Interest::Read, fiber)
    }

    /// Arm a one-shot write registration.
    pub fn register_write(&self, fd: RawFd, fiber: Fiber) -> io::Result<()> {
        self.register(fd, Interest::Write, fiber)
    }

    fn register(&self, fd: RawFd, interest: Interest, fiber: Fiber) -> io::Result<()> {
        let mut registrations = self
            .inner
            .registrations
            .lock()
            .expect("registration table poisoned");
        // Checked under the table lock: the stop path drains this table with
        // `running` already cleared, so nothing can slip in behind the drain.
        if !self.inner.running.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "reactor is shutting down",
            ));
        }
        // On error `fiber` drops here, releasing the exported reference.
        self.inner.poller.arm(fd, interest)?;
        tracing::trace!(fd, ?interest, "armed registration");
        if let Some(stale) = registrations.insert(fd, fiber.into_raw()) {
            // A previous waiter on this fd was replaced; it can no longer be
            // delivered, so its reference is dropped rather than leaked.
            tracing::warn!(fd, "replaced outstanding registration");
            drop(unsafe { Fiber::from_raw(stale) });
        }
        Ok(())
    }

    /// Arm a timer delivering `fiber` once `deadline` has passed. A deadline
    /// already in the past fires on the next loop iteration.
    pub fn add_timer(&self, deadline: Instant, fiber: Fiber) {
        let became_earliest = {
            let mut timers = self.inner.timers.lock().expect("timer heap poisoned");
            if !self.inner.running.load(Ordering::Acquire) {
                // Stop already drained the heap; releasing is all that is
                // left for this reference.
                drop(fiber);
                return;
            }
            timers.push(deadline, fiber.into_raw())
        };
        if became_earliest {
            // The loop is waiting on a stale timeout.
            self.inner.poller.wake();
        }
    }

    /// Force the poll loop to re-evaluate its state.
    pub fn wake(&self) {
        self.inner.poller.wake();
    }

    pub(crate) fn stop(&self) {
        self.inner.running.store(false, Ordering::Release);
        self.inner.poller.wake();
    }

    /// Poll loop; runs on the dedicated reactor thread until stopped.
    pub(crate) fn run(&self) {
        tracing::debug!("reactor online");
        let inner = &*self.inner;
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; EVENT_BATCH];

        while inner.running.load(Ordering::Acquire) {
            let timeout_ms = {
                let timers = inner.timers.lock().expect("timer heap poisoned");
                match timers.next_deadline() {
                    // Round up so a deadline a fraction of a millisecond out
                    // does not turn the wait into a spin.
                    Some(deadline) => {
                        let pending = deadline.saturating_duration_since(Instant::now());
                        let ms = (pending.as_nanos() + 999_999) / 1_000_000;
                        ms.min(i32::MAX as u128) as i32
                    }
                    None => -1,
                }
            };

            let fired = match inner.poller.wait(&mut events, timeout_ms) {
                Ok(n) => n,
                Err(err) => {
                    tracing::error!(%err, "epoll wait failed");
                    break;
                }
            };

            for event in &events[..fired] {
                let fd = event.u64 as RawFd;
                if inner.poller.is_wake_event(fd) {
                    inner.poller.drain_wake();
                    continue;
                }
                let delivered = inner
                    .registrations
                    .lock()
                    .expect("registration table poisoned")
                    .remove(&fd);
                match delivered {
                    Some(addr) => {
                        tracing::trace!(fd, "readiness delivered");
                        self.deliver(addr);
                    }
                    // A spent one-shot cannot refire, so this only means a
                    // racing replace already consumed the slot.
                    None => tracing::trace!(fd, "readiness with no registration"),
                }
            }

            let now = Instant::now();
            loop {
                let expired = inner
                    .timers
                    .lock()
                    .expect("timer heap poisoned")
                    .pop_expired(now);
                match expired {
                    Some(addr) => self.deliver(addr),
                    None => break,
                }
            }
        }

        self.release_pending();
        tracing::debug!("reactor offline");
    }

    fn deliver(&self, addr: usize) {
        match self.inner.scheduler.get().and_then(Weak::upgrade) {
            Some(shared) => {
                shared.stat.on_reactor_delivery();
                shared.inject_addr(addr);
            }
            // Scheduler already torn down; releasing is the delivery.
            None => drop(unsafe { Fiber::from_raw(addr) }),
        }
    }

    /// Release every reference still parked in the table or the heap.
    fn release_pending(&self) {
        let mut registrations = self
            .inner
            .registrations
            .lock()
            .expect("registration table poisoned");
        let stale_regs = registrations.len();
        for (_fd, addr) in registrations.drain() {
            drop(unsafe { Fiber::from_raw(addr) });
        }
        drop(registrations);

        let pending = self
            .inner
            .timers
            .lock()
            .expect("timer heap poisoned")
            .drain();
        if stale_regs > 0 || !pending.is_empty() {
            tracing::debug!(
                registrations = stale_regs,
                timers = pending.len(),
                "released undelivered registrations"
            );
        }
        for addr in pending {
            drop(unsafe { Fiber::from_raw(addr) });
        }
    }
}
