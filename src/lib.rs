//! `weft`: an M:N fiber runtime with work stealing and an epoll reactor.
//!
//! This crate re-exports the runtime core ([`weft_runtime`]) and the TCP
//! front end ([`weft_net`]). Applications usually depend on this facade:
//!
//! ```no_run
//! use std::time::Duration;
//! use weft::{sleep_for, Scheduler};
//!
//! let scheduler = Scheduler::new(0);
//! let handle = scheduler.clone();
//! scheduler.spawn(async move {
//!     sleep_for(&handle, Duration::from_millis(100)).await;
//!     tracing::info!("woke up");
//! });
//! ```

pub use weft_runtime::{
    channel, sleep_for, AsyncMutex, Fiber, JoinHandle, MutexGuard, Reactor, Receiver, Scheduler,
    SchedulerBuilder, SchedulerStat, Sender, Sleep,
};

pub use weft_net::{Accept, AsyncTcpListener, AsyncTcpStream, Readable, Writable};

/// Runtime building blocks, for callers that need more than the facade.
pub mod runtime {
    pub use weft_runtime::{epoch, fiber, queue, reactor, scheduler, sync, time};
}
