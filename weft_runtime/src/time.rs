//! Timer-backed sleeping.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use crate::fiber::Fiber;
use crate::reactor::Reactor;
use crate::scheduler::Scheduler;

/// Suspend the current fiber for at least `duration` on the monotonic clock.
///
/// ```no_run
/// # use std::time::Duration;
/// # use weft_runtime::{sleep_for, Scheduler};
/// let scheduler = Scheduler::new(2);
/// let handle = scheduler.clone();
/// scheduler.spawn(async move {
///     sleep_for(&handle, Duration::from_millis(50)).await;
/// });
/// ```
pub fn sleep_for(scheduler: &Scheduler, duration: Duration) -> Sleep {
    Sleep {
        reactor: scheduler.reactor().clone(),
        deadline: Instant::now() + duration,
        armed: false,
    }
}

/// Future returned by [`sleep_for`]. Arms a one-shot reactor timer on first
/// poll; resolution is the reactor's loop granularity, and a deadline already
/// in the past fires on the next loop iteration.
pub struct Sleep {
    reactor: Reactor,
    deadline: Instant,
    armed: bool,
}

impl Sleep {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.armed {
            if Instant::now() >= self.deadline {
                return Poll::Ready(());
            }
            // Re-polled before the timer fired (a combinator, not the
            // reactor); the registration is still armed.
            return Poll::Pending;
        }

        tracing::trace!(deadline = ?self.deadline, "arming sleep");
        self.reactor.add_timer(self.deadline, Fiber::current());
        self.armed = true;
        Poll::Pending
    }
}
