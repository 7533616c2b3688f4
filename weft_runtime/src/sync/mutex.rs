//! Cooperative mutual exclusion.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex as StdMutex;
use std::task::{Context, Poll};

use crate::fiber::Fiber;
use crate::scheduler::Scheduler;

struct State {
    locked: bool,
    waiters: VecDeque<Fiber>,
}

/// Fiber-aware mutex with FIFO fairness.
///
/// An uncontended `lock` acquires without suspending. A contended release
/// passes the baton: `locked` stays set while the head waiter is resubmitted
/// to the scheduler, so ownership goes to the longest waiter and a fresh
/// arrival cannot barge past the queue.
///
/// The mutex guards a critical section, not a value; share the data it
/// protects separately, as the lock order is the only thing enforced here.
pub struct AsyncMutex {
    scheduler: Scheduler,
    state: StdMutex<State>,
}

impl AsyncMutex {
    pub fn new(scheduler: &Scheduler) -> AsyncMutex {
        AsyncMutex {
            scheduler: scheduler.clone(),
            state: StdMutex::new(State {
                locked: false,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Acquire the mutex. The returned guard releases it on drop.
    ///
    /// Dropping the future after it has queued (this runtime offers no
    /// cancellation, so that only happens by leaking a suspended fiber)
    /// forfeits the baton.
    pub fn lock(&self) -> Lock<'_> {
        Lock {
            mutex: self,
            queued: false,
        }
    }

    fn unlock(&self) {
        let next = {
            let mut state = self.state.lock().expect("async mutex state poisoned");
            match state.waiters.pop_front() {
                // Baton pass: `locked` stays set for the fiber being woken.
                Some(next) => Some(next),
                None => {
                    state.locked = false;
                    None
                }
            }
        };
        if let Some(next) = next {
            tracing::trace!("mutex baton passed");
            self.scheduler.submit_fiber(next);
        }
    }
}

/// Future returned by [`AsyncMutex::lock`].
pub struct Lock<'a> {
    mutex: &'a AsyncMutex,
    queued: bool,
}

impl<'a> Future for Lock<'a> {
    type Output = MutexGuard<'a>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.queued {
            // Resumed by a baton pass; the lock is already ours.
            return Poll::Ready(MutexGuard { mutex: this.mutex });
        }

        let mut state = this
            .mutex
            .state
            .lock()
            .expect("async mutex state poisoned");
        if !state.locked {
            state.locked = true;
            return Poll::Ready(MutexGuard { mutex: this.mutex });
        }
        // Held by someone else: park this fiber in the FIFO. The decision
        // and the enqueue share one critical section, so an unlock cannot
        // slip between them.
        state.waiters.push_back(Fiber::current());
        this.queued = true;
        Poll::Pending
    }
}

/// Releases the mutex on drop.
pub struct MutexGuard<'a> {
    mutex: &'a AsyncMutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
