//! Cooperative synchronisation built on fiber handles.
//!
//! These primitives never block a worker thread: a fiber that cannot make
//! progress parks its own handle in a wait queue and the releasing side
//! resubmits it to the scheduler.

pub mod channel;
pub mod mutex;

pub use channel::{channel, Receiver, Sender};
pub use mutex::{AsyncMutex, MutexGuard};
