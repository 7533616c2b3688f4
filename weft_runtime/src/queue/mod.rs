//! Fiber address queues.
//!
//! Addresses move through two kinds of queue: a per-worker lock-free
//! steal queue and a shared mutex-guarded inject queue. Both store bare
//! `usize` tokens; ownership of the reference they represent travels with
//! the token.

pub mod global;
pub mod steal;

pub use global::InjectQueue;
pub use steal::{steal_queue, LocalQueue, Stealer};
