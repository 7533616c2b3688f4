//! Core of the `weft` asynchronous runtime.
//!
//! An M:N engine: many lightweight suspendable fibers multiplexed onto a
//! fixed pool of OS threads, coupled to a single epoll-plus-timers event
//! source. Four pieces carry the weight and lean on each other on every
//! scheduling decision:
//!
//! 1. a work-stealing scheduler with per-worker [`queue::LocalQueue`]s and a
//!    shared [`queue::InjectQueue`] overflow,
//! 2. an I/O [`reactor::Reactor`] translating readiness and timer expiry
//!    into fiber wakeups,
//! 3. a reference-counted [`fiber::Fiber`] handle whose bare address moves
//!    through the queues and the reactor,
//! 4. an [`epoch::EpochDomain`] deferring destruction of queue buffers that
//!    concurrent stealers may still observe.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use weft_runtime::{sleep_for, Scheduler};
//!
//! let scheduler = Scheduler::new(4);
//! let handle = scheduler.clone();
//! scheduler.spawn(async move {
//!     sleep_for(&handle, Duration::from_millis(10)).await;
//!     tracing::info!("tick");
//! });
//! ```
//!
//! Fibers are cooperative: they yield only at explicit suspension points
//! (awaitables that come up not-ready). Workers never block inside a fiber
//! body; blocking lives in the reactor's kernel wait and in worker parking.

pub mod epoch;
pub mod fiber;
mod park;
pub mod queue;
pub mod reactor;
pub mod scheduler;
mod shim;
pub mod sync;
pub mod time;

pub use fiber::{Fiber, JoinHandle};
pub use reactor::Reactor;
pub use scheduler::{Scheduler, SchedulerBuilder, SchedulerStat};
pub use sync::{channel, AsyncMutex, MutexGuard, Receiver, Sender};
pub use time::{sleep_for, Sleep};
