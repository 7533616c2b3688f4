//! Bounded and rendezvous channels.
//!
//! Values hand off directly between fibers whenever one side is already
//! waiting; the buffer only absorbs the slack in between. A suspended
//! sender parks its value inside its wait-queue node, so the receiving side
//! takes ownership without reaching into the sender's stack frame.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};

use crate::fiber::Fiber;
use crate::scheduler::Scheduler;

/// Create a channel with room for `capacity` buffered values. Zero gives a
/// rendezvous channel: every send meets its receive.
pub fn channel<T: Send + 'static>(
    scheduler: &Scheduler,
    capacity: usize,
) -> (Sender<T>, Receiver<T>) {
    let chan = Arc::new(Chan {
        scheduler: scheduler.clone(),
        capacity,
        state: StdMutex::new(ChanState {
            buffer: VecDeque::new(),
            send_waiters: VecDeque::new(),
            recv_waiters: VecDeque::new(),
            closed: false,
            senders: 1,
            receivers: 1,
        }),
    });
    (
        Sender { chan: chan.clone() },
        Receiver { chan },
    )
}

/// Parked send: the value sits here until a receiver takes it or the
/// channel closes.
enum SendSlot<T> {
    Pending(T),
    Taken,
    Failed,
}

/// Parked receive: the result lands here before the fiber is resubmitted.
/// `Some(None)` means the channel closed empty.
type RecvSlot<T> = StdMutex<Option<Option<T>>>;

struct SendWaiter<T> {
    fiber: Fiber,
    slot: Arc<StdMutex<SendSlot<T>>>,
}

struct RecvWaiter<T> {
    fiber: Fiber,
    slot: Arc<RecvSlot<T>>,
}

struct ChanState<T> {
    buffer: VecDeque<T>,
    send_waiters: VecDeque<SendWaiter<T>>,
    recv_waiters: VecDeque<RecvWaiter<T>>,
    closed: bool,
    senders: usize,
    receivers: usize,
}

struct Chan<T> {
    scheduler: Scheduler,
    capacity: usize,
    state: StdMutex<ChanState<T>>,
}

impl<T: Send + 'static> Chan<T> {
    fn close(&self) {
        let (senders, receivers) = {
            let mut state = self.state.lock().expect("channel state poisoned");
            if state.closed {
                return;
            }
            state.closed = true;
            let senders: Vec<SendWaiter<T>> = state.send_waiters.drain(..).collect();
            let receivers: Vec<RecvWaiter<T>> = state.recv_waiters.drain(..).collect();
            (senders, receivers)
        };

        for waiter in senders {
            *waiter.slot.lock().expect("send slot poisoned") = SendSlot::Failed;
            self.scheduler.submit_fiber(waiter.fiber);
        }
        for waiter in receivers {
            *waiter.slot.lock().expect("recv slot poisoned") = Some(None);
            self.scheduler.submit_fiber(waiter.fiber);
        }
        tracing::trace!("channel closed");
    }
}

/// Sending half. Clone freely; the channel closes once every sender is gone.
pub struct Sender<T: Send + 'static> {
    chan: Arc<Chan<T>>,
}

/// Receiving half. Clone freely; the channel closes once every receiver is
/// gone.
pub struct Receiver<T: Send + 'static> {
    chan: Arc<Chan<T>>,
}

impl<T: Send + 'static> Sender<T> {
    /// Send `value`. Resolves to `true` once delivered (buffered or handed
    /// off) and `false` if the channel closed first, dropping the value.
    ///
    /// The fast paths never suspend; only a full buffer with no waiting
    /// receiver parks the calling fiber.
    pub fn send(&self, value: T) -> SendFuture<'_, T> {
        SendFuture {
            chan: &self.chan,
            value: Some(value),
            slot: None,
        }
    }

    /// Close the channel for all sides.
    pub fn close(&self) {
        self.chan.close();
    }
}

impl<T: Send + 'static> Receiver<T> {
    /// Receive the next value in FIFO order; `None` once the channel is
    /// closed and drained.
    pub fn recv(&self) -> RecvFuture<'_, T> {
        RecvFuture {
            chan: &self.chan,
            slot: None,
        }
    }

    /// Close the channel for all sides.
    pub fn close(&self) {
        self.chan.close();
    }
}

impl<T: Send + 'static> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.chan
            .state
            .lock()
            .expect("channel state poisoned")
            .senders += 1;
        Sender {
            chan: self.chan.clone(),
        }
    }
}

impl<T: Send + 'static> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.chan
            .state
            .lock()
            .expect("channel state poisoned")
            .receivers += 1;
        Receiver {
            chan: self.chan.clone(),
        }
    }
}

impl<T: Send + 'static> Drop for Sender<T> {
    fn drop(&mut self) {
        let last = {
            let mut state = self.chan.state.lock().expect("channel state poisoned");
            state.senders -= 1;
            state.senders == 0
        };
        if last {
            self.chan.close();
        }
    }
}

impl<T: Send + 'static> Drop for Receiver<T> {
    fn drop(&mut self) {
        let last = {
            let mut state = self.chan.state.lock().expect("channel state poisoned");
            state.receivers -= 1;
            state.receivers == 0
        };
        if last {
            self.chan.close();
        }
    }
}

/// Future returned by [`Sender::send`].
pub struct SendFuture<'a, T: Send + 'static> {
    chan: &'a Arc<Chan<T>>,
    value: Option<T>,
    slot: Option<Arc<StdMutex<SendSlot<T>>>>,
}

impl<T: Send + 'static> Unpin for SendFuture<'_, T> {}

impl<T: Send + 'static> Future for SendFuture<'_, T> {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<bool> {
        let this = self.get_mut();

        if let Some(slot) = &this.slot {
            // Woken after queueing: the slot says what happened.
            let outcome = match &*slot.lock().expect("send slot poisoned") {
                SendSlot::Taken => Some(true),
                SendSlot::Failed => Some(false),
                SendSlot::Pending(_) => None,
            };
            return match outcome {
                Some(delivered) => Poll::Ready(delivered),
                None => Poll::Pending,
            };
        }

        let value = this.value.take().expect("send polled after completion");
        let mut state = this.chan.state.lock().expect("channel state poisoned");

        if state.closed {
            return Poll::Ready(false);
        }

        // A waiting receiver outranks the buffer: hand the value straight
        // over and resume it.
        if let Some(waiter) = state.recv_waiters.pop_front() {
            *waiter.slot.lock().expect("recv slot poisoned") = Some(Some(value));
            drop(state);
            this.chan.scheduler.submit_fiber(waiter.fiber);
            return Poll::Ready(true);
        }

        if state.buffer.len() < this.chan.capacity {
            state.buffer.push_back(value);
            return Poll::Ready(true);
        }

        // Full and nobody waiting: park the value with this fiber.
        let slot = Arc::new(StdMutex::new(SendSlot::Pending(value)));
        state.send_waiters.push_back(SendWaiter {
            fiber: Fiber::current(),
            slot: slot.clone(),
        });
        this.slot = Some(slot);
        Poll::Pending
    }
}

/// Future returned by [`Receiver::recv`].
pub struct RecvFuture<'a, T: Send + 'static> {
    chan: &'a Arc<Chan<T>>,
    slot: Option<Arc<RecvSlot<T>>>,
}

impl<T: Send + 'static> Future for RecvFuture<'_, T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();

        if let Some(slot) = &this.slot {
            return match slot.lock().expect("recv slot poisoned").take() {
                Some(result) => Poll::Ready(result),
                None => Poll::Pending,
            };
        }

        let mut state = this.chan.state.lock().expect("channel state poisoned");

        if let Some(value) = state.buffer.pop_front() {
            // A slot opened up; pull one queued sender's value through.
            if let Some(waiter) = state.send_waiters.pop_front() {
                let mut sender_slot = waiter.slot.lock().expect("send slot poisoned");
                if let SendSlot::Pending(pending) =
                    std::mem::replace(&mut *sender_slot, SendSlot::Taken)
                {
                    state.buffer.push_back(pending);
                }
                drop(sender_slot);
                drop(state);
                this.chan.scheduler.submit_fiber(waiter.fiber);
            }
            return Poll::Ready(Some(value));
        }

        // Empty buffer: rendezvous directly with a queued sender.
        if let Some(waiter) = state.send_waiters.pop_front() {
            let mut sender_slot = waiter.slot.lock().expect("send slot poisoned");
            let value = match std::mem::replace(&mut *sender_slot, SendSlot::Taken) {
                SendSlot::Pending(value) => value,
                // Close already resolved this sender; only Pending senders
                // stay queued, so this cannot happen.
                _ => unreachable!("queued sender without a pending value"),
            };
            drop(sender_slot);
            drop(state);
            this.chan.scheduler.submit_fiber(waiter.fiber);
            return Poll::Ready(Some(value));
        }

        if state.closed {
            return Poll::Ready(None);
        }

        let slot = Arc::new(StdMutex::new(None));
        state.recv_waiters.push_back(RecvWaiter {
            fiber: Fiber::current(),
            slot: slot.clone(),
        });
        this.slot = Some(slot);
        Poll::Pending
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::Context;

    /// The buffered fast paths never suspend, so they can be driven from a
    /// plain thread with a noop waker.
    #[test]
    fn fast_paths_resolve_without_a_fiber() {
        let scheduler = Scheduler::new(1);
        let (tx, rx) = channel::<u32>(&scheduler, 2);

        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        for value in [4, 8] {
            let mut send = tx.send(value);
            match Pin::new(&mut send).poll(&mut cx) {
                Poll::Ready(true) => {}
                other => panic!("buffered send did not resolve: {other:?}"),
            }
        }

        let mut recv = rx.recv();
        assert!(matches!(
            Pin::new(&mut recv).poll(&mut cx),
            Poll::Ready(Some(4))
        ));

        scheduler.shutdown();
    }

    #[test]
    fn recv_on_closed_empty_channel_is_none() {
        let scheduler = Scheduler::new(1);
        let (tx, rx) = channel::<u32>(&scheduler, 1);
        tx.close();

        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut send = tx.send(1);
        assert!(matches!(
            Pin::new(&mut send).poll(&mut cx),
            Poll::Ready(false)
        ));
        let mut recv = rx.recv();
        assert!(matches!(Pin::new(&mut recv).poll(&mut cx), Poll::Ready(None)));

        scheduler.shutdown();
    }
}
