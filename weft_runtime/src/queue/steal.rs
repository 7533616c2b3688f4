//! Chase-Lev work-stealing queue of fiber addresses.
//!
//! One owner pushes and pops at the bottom; any number of stealers take from
//! the top. All operations are wait-free except growth, which doubles the
//! ring buffer, publishes the new one with a release store and retires the
//! old one through the epoch domain so in-flight stealers keep a valid view.
//!
//! The owner may touch the queue without entering the domain (only the owner
//! ever retires its own buffers), but every steal must happen under an epoch
//! [`Guard`], which the signature enforces.

use std::marker::PhantomData;
use std::sync::atomic::Ordering;

use crossbeam_utils::CachePadded;

use crate::epoch::{DomainHandle, Guard, ParticipantHandle, Retired};
use crate::shim::{fence, Arc, AtomicIsize, AtomicPtr, AtomicUsize};

/// Power-of-two ring of address slots.
///
/// Slot contents are only meaningful inside `[top, bottom)`; everything the
/// algorithm needs beyond that is carried by the fences around the index
/// updates, so the slots themselves are accessed relaxed.
struct Buffer {
    slots: Box<[AtomicUsize]>,
    cap: usize,
}

impl Buffer {
    fn new(cap: usize) -> Buffer {
        debug_assert!(cap.is_power_of_two());
        let slots = (0..cap).map(|_| AtomicUsize::new(0)).collect();
        Buffer { slots, cap }
    }

    fn put(&self, index: isize, addr: usize) {
        self.slots[index as usize & (self.cap - 1)].store(addr, Ordering::Relaxed);
    }

    fn get(&self, index: isize) -> usize {
        self.slots[index as usize & (self.cap - 1)].load(Ordering::Relaxed)
    }
}

struct Inner {
    top: CachePadded<AtomicIsize>,
    bottom: CachePadded<AtomicIsize>,
    buffer: AtomicPtr<Buffer>,
}

unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

impl Drop for Inner {
    fn drop(&mut self) {
        // Last handle gone; nothing else can observe the buffer.
        let ptr = self.buffer.load(Ordering::Relaxed);
        drop(unsafe { Box::from_raw(ptr) });
    }
}

/// Owner-side handle: push and pop at the bottom. Not `Sync`; it lives on
/// exactly one worker thread.
pub struct LocalQueue {
    inner: Arc<Inner>,
    domain: DomainHandle,
    participant: ParticipantHandle,
    _single_owner: PhantomData<*mut ()>,
}

// The handle may move to its worker thread, it just cannot be shared.
unsafe impl Send for LocalQueue {}

/// Stealer-side handle: take from the top, under an epoch guard.
#[derive(Clone)]
pub struct Stealer {
    inner: Arc<Inner>,
}

/// Create a queue with the given initial capacity (a power of two).
///
/// Buffers outgrown by `push` are retired to `domain` on behalf of
/// `participant`.
pub fn steal_queue(
    capacity: usize,
    domain: DomainHandle,
    participant: ParticipantHandle,
) -> (LocalQueue, Stealer) {
    assert!(capacity.is_power_of_two(), "capacity must be a power of two");
    let inner = Arc::new(Inner {
        top: CachePadded::new(AtomicIsize::new(0)),
        bottom: CachePadded::new(AtomicIsize::new(0)),
        buffer: AtomicPtr::new(Box::into_raw(Box::new(Buffer::new(capacity)))),
    });
    let stealer = Stealer {
        inner: inner.clone(),
    };
    let local = LocalQueue {
        inner,
        domain,
        participant,
        _single_owner: PhantomData,
    };
    (local, stealer)
}

impl LocalQueue {
    /// Push an address at the bottom, growing the buffer when one slot shy
    /// of capacity.
    pub fn push(&self, addr: usize) {
        let inner = &*self.inner;
        let b = inner.bottom.load(Ordering::Relaxed);
        let t = inner.top.load(Ordering::Acquire);
        let mut buffer = inner.buffer.load(Ordering::Relaxed);

        if b - t >= unsafe { &*buffer }.cap as isize - 1 {
            buffer = self.grow(buffer, b, t);
        }

        unsafe { &*buffer }.put(b, addr);
        fence(Ordering::Release);
        inner.bottom.store(b + 1, Ordering::Relaxed);
    }

    fn grow(&self, old: *mut Buffer, b: isize, t: isize) -> *mut Buffer {
        let bigger = {
            let old = unsafe { &*old };
            let bigger = Box::new(Buffer::new(old.cap * 2));
            for index in t..b {
                bigger.put(index, old.get(index));
            }
            Box::into_raw(bigger)
        };
        self.inner.buffer.store(bigger, Ordering::Release);
        tracing::trace!(cap = unsafe { &*bigger }.cap, "grew steal queue");
        self.domain
            .retire(&self.participant, Retired::new(unsafe { Box::from_raw(old) }));
        bigger
    }

    /// Pop an address from the bottom.
    ///
    /// The SeqCst fence between the speculative bottom store and the top
    /// load is Dekker-style: without it the CPU could sink the store below
    /// the load and both the owner and a stealer could claim the last slot.
    pub fn pop(&self) -> Option<usize> {
        let inner = &*self.inner;
        let b = inner.bottom.load(Ordering::Relaxed) - 1;
        let buffer = unsafe { &*inner.buffer.load(Ordering::Relaxed) };
        inner.bottom.store(b, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let t = inner.top.load(Ordering::SeqCst);

        if t > b {
            // Empty; undo the speculative decrement.
            inner.bottom.store(b + 1, Ordering::Relaxed);
            return None;
        }

        let addr = buffer.get(b);
        if t < b {
            // More than one element left; no stealer can reach this slot.
            return Some(addr);
        }

        // Last element: settle the race with any stealer on `top`.
        let won = inner
            .top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        inner.bottom.store(b + 1, Ordering::Relaxed);
        if won {
            Some(addr)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        let b = self.inner.bottom.load(Ordering::Relaxed);
        let t = self.inner.top.load(Ordering::Relaxed);
        (b - t).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Stealer {
    /// Take one address from the top. A lost CAS race returns `None`; the
    /// caller moves on to its next victim rather than spinning here.
    pub fn steal(&self, _guard: &Guard<'_>) -> Option<usize> {
        let inner = &*self.inner;
        let t = inner.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = inner.bottom.load(Ordering::Acquire);

        if t >= b {
            return None;
        }

        let buffer = unsafe { &*inner.buffer.load(Ordering::Acquire) };
        let addr = buffer.get(t);
        if inner
            .top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            Some(addr)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        let b = self.inner.bottom.load(Ordering::Relaxed);
        let t = self.inner.top.load(Ordering::Relaxed);
        (b - t).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
