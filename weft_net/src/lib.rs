//! Non-blocking TCP for the weft runtime.
//!
//! Thin wrappers over `std::net` sockets plus the awaitables that bridge
//! them to the reactor. Every awaitable tries the syscall first and only
//! suspends on `WouldBlock`, arming a one-shot registration for the matching
//! direction; registering the wrong direction while a send buffer is full
//! would deadlock the connection permanently, so the pairing is fixed here:
//! reads and accepts arm read interest, writes arm write interest.

mod listener;
mod stream;

pub use listener::{Accept, AsyncTcpListener};
pub use stream::{AsyncTcpStream, Readable, Writable};
