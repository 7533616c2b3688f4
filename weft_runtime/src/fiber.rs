//! Fiber handles.
//!
//! A fiber is a heap-allocated, reference-counted, suspendable computation.
//! [`Fiber`] is the move-only owning handle; the address of the underlying
//! header is the token that travels through the queues and the reactor.
//!
//! The count is only ever adjusted at true fork/join points. A queue slot or
//! reactor registration holds exactly the reference that was transferred
//! into it with [`Fiber::into_raw`] and recovered with [`Fiber::from_raw`];
//! expressing that transfer as an increment followed by a decrement would
//! open a window in which the count can hit zero while the address is still
//! in flight.

use std::cell::Cell;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use crate::scheduler::Shared;

/// Continuation slot: nothing installed yet.
const CONT_EMPTY: usize = 0;
/// Continuation slot: the fiber has completed.
const CONT_DONE: usize = 1;

type FiberBody = Pin<Box<dyn Future<Output = ()> + Send>>;

pub(crate) struct Header {
    ref_count: AtomicUsize,
    is_running: AtomicBool,
    finished: AtomicBool,
    /// `CONT_EMPTY`, `CONT_DONE`, or the address of the fiber to resume on
    /// completion (one reference is parked here while installed).
    continuation: AtomicUsize,
    shared: Arc<Shared>,
    body: std::cell::UnsafeCell<Option<FiberBody>>,
}

// The body is only touched while `is_running` is held, which serialises all
// access; everything else is atomics.
unsafe impl Send for Header {}
unsafe impl Sync for Header {}

impl Drop for Header {
    fn drop(&mut self) {
        let cont = self.continuation.load(Ordering::Relaxed);
        if cont > CONT_DONE {
            // A parent was still waiting; release the parked reference.
            drop(unsafe { Fiber::from_raw(cont) });
        }
    }
}

thread_local! {
    /// Address of the fiber currently being resumed on this thread.
    static CURRENT: Cell<usize> = const { Cell::new(0) };
}

/// Outcome of a single [`Fiber::resume`].
pub(crate) enum Resumption {
    /// The body suspended; someone else now owns the next wakeup.
    Pending,
    /// Another thread is resuming this fiber right now. The caller should
    /// requeue the address instead of dropping the wakeup.
    Busy,
    /// The body finished. Carries the continuation to run next, if one was
    /// installed (symmetric transfer: the caller loops on it instead of
    /// recursing).
    Completed(Option<Fiber>),
}

/// Move-only owning handle to a fiber.
pub struct Fiber {
    header: *mut Header,
}

unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Allocate a new suspended fiber around `future`.
    ///
    /// The fiber does not run until a worker resumes it, so a spawner can
    /// never be dragged into executing the body on its own thread.
    pub(crate) fn new<F>(future: F, shared: Arc<Shared>) -> Fiber
    where
        F: Future<Output = ()> + Send + 'static,
    {
        shared.stat.on_spawn();
        let header = Box::new(Header {
            ref_count: AtomicUsize::new(1),
            is_running: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            continuation: AtomicUsize::new(CONT_EMPTY),
            shared,
            body: std::cell::UnsafeCell::new(Some(Box::pin(future))),
        });
        Fiber {
            header: Box::into_raw(header),
        }
    }

    fn header(&self) -> &Header {
        unsafe { &*self.header }
    }

    /// Export the address, transferring this handle's reference into the
    /// caller's custody. The count is not touched.
    pub fn into_raw(self) -> usize {
        let addr = self.header as usize;
        std::mem::forget(self);
        addr
    }

    /// Reclaim ownership of a reference previously exported with
    /// [`Fiber::into_raw`] or [`Fiber::clone_into_raw`].
    ///
    /// # Safety
    ///
    /// `addr` must carry exactly one outstanding reference, and it must not
    /// be reused afterwards.
    pub unsafe fn from_raw(addr: usize) -> Fiber {
        debug_assert!(addr != 0);
        Fiber {
            header: addr as *mut Header,
        }
    }

    /// Export the address with a fresh reference for the receiver; this
    /// handle stays valid.
    pub fn clone_into_raw(&self) -> usize {
        self.header().ref_count.fetch_add(1, Ordering::SeqCst);
        self.header as usize
    }

    /// Duplicate a handle out of a raw address, leaving the address's own
    /// reference in place.
    ///
    /// # Safety
    ///
    /// `addr` must carry at least one outstanding reference for the whole
    /// call.
    pub unsafe fn retain_from_raw(addr: usize) -> Fiber {
        debug_assert!(addr != 0);
        let header = addr as *mut Header;
        unsafe { &*header }.ref_count.fetch_add(1, Ordering::SeqCst);
        Fiber { header }
    }

    /// Handle to the fiber currently running on this thread.
    ///
    /// # Panics
    ///
    /// Panics when called from outside a fiber body. Awaitables use this to
    /// hand the fiber's address to the reactor or a wait queue.
    pub fn current() -> Fiber {
        let addr = CURRENT.with(|current| current.get());
        assert!(addr != 0, "no fiber is running on this thread");
        unsafe { Fiber::retain_from_raw(addr) }
    }

    /// True once the body has run to completion (or for a fiber whose body
    /// was already dropped).
    pub fn done(&self) -> bool {
        self.header().finished.load(Ordering::SeqCst)
    }

    /// Current reference count. Probe for tests and leak diagnostics.
    pub fn ref_count(&self) -> usize {
        self.header().ref_count.load(Ordering::SeqCst)
    }

    /// Resume the fiber until its next suspension point.
    ///
    /// At most one thread runs the body at a time: the `is_running` CAS
    /// turns a racing resume into [`Resumption::Busy`] so the caller can
    /// requeue the address rather than lose the wakeup or double-poll.
    pub(crate) fn resume(&self) -> Resumption {
        let header = self.header();
        if header.finished.load(Ordering::SeqCst) {
            return Resumption::Completed(None);
        }
        if header
            .is_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Resumption::Busy;
        }

        let waker = self.waker();
        let mut cx = Context::from_waker(&waker);
        let previous = CURRENT.with(|current| current.replace(self.header as usize));

        let poll = {
            // Exclusive: we hold `is_running`.
            let body = unsafe { &mut *header.body.get() };
            match body.as_mut() {
                Some(future) => {
                    match panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
                        Ok(poll) => poll,
                        Err(_) => {
                            // The runtime does not catch user panics; a
                            // poisoned fiber takes the process down.
                            tracing::error!("fiber body panicked, aborting");
                            std::process::abort();
                        }
                    }
                }
                None => {
                    CURRENT.with(|current| current.set(previous));
                    header.is_running.store(false, Ordering::SeqCst);
                    return Resumption::Completed(None);
                }
            }
        };

        CURRENT.with(|current| current.set(previous));

        match poll {
            Poll::Pending => {
                header.is_running.store(false, Ordering::SeqCst);
                Resumption::Pending
            }
            Poll::Ready(()) => {
                // Drop the body now so resources it captured are released at
                // completion rather than at the last handle drop.
                unsafe { *header.body.get() = None };
                header.finished.store(true, Ordering::SeqCst);
                header.shared.stat.on_complete();
                let installed = header.continuation.swap(CONT_DONE, Ordering::AcqRel);
                header.is_running.store(false, Ordering::SeqCst);
                let continuation = if installed > CONT_DONE {
                    Some(unsafe { Fiber::from_raw(installed) })
                } else {
                    None
                };
                Resumption::Completed(continuation)
            }
        }
    }

    /// Waker whose data pointer is this fiber's address. Holds one
    /// reference; waking transfers it into the inject queue.
    fn waker(&self) -> Waker {
        let data = self.clone_into_raw() as *const ();
        unsafe { Waker::from_raw(RawWaker::new(data, &VTABLE)) }
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        if self.header().ref_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            let header = unsafe { Box::from_raw(self.header) };
            header.shared.stat.on_destroy();
            drop(header);
        }
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("addr", &(self.header as usize))
            .field("refs", &self.ref_count())
            .field("done", &self.done())
            .finish()
    }
}

unsafe fn waker_clone(data: *const ()) -> RawWaker {
    let header = data as *mut Header;
    unsafe { &*header }.ref_count.fetch_add(1, Ordering::SeqCst);
    RawWaker::new(data, &VTABLE)
}

unsafe fn waker_wake(data: *const ()) {
    // The waker's reference rides into the inject queue.
    let header = data as *mut Header;
    let shared = unsafe { &*header }.shared.clone();
    shared.inject_addr(data as usize);
}

unsafe fn waker_wake_by_ref(data: *const ()) {
    let header = data as *mut Header;
    unsafe { &*header }.ref_count.fetch_add(1, Ordering::SeqCst);
    let shared = unsafe { &*header }.shared.clone();
    shared.inject_addr(data as usize);
}

unsafe fn waker_drop(data: *const ()) {
    drop(unsafe { Fiber::from_raw(data as usize) });
}

static VTABLE: RawWakerVTable =
    RawWakerVTable::new(waker_clone, waker_wake, waker_wake_by_ref, waker_drop);

/// Awaitable completion of a spawned fiber.
///
/// Awaiting installs the awaiting fiber as the spawned fiber's continuation;
/// on completion the worker trampolines straight into the parent without
/// growing its native stack, which keeps chains of nested awaits at constant
/// depth. One awaiter per handle.
pub struct JoinHandle {
    fiber: Fiber,
}

impl JoinHandle {
    pub(crate) fn new(fiber: Fiber) -> JoinHandle {
        JoinHandle { fiber }
    }

    /// True once the fiber has completed.
    pub fn is_finished(&self) -> bool {
        self.fiber.done()
    }
}

impl Future for JoinHandle {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let header = self.fiber.header();
        if header.finished.load(Ordering::SeqCst) {
            return Poll::Ready(());
        }

        let addr = Fiber::current().into_raw();
        match header.continuation.compare_exchange(
            CONT_EMPTY,
            addr,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Poll::Pending,
            Err(CONT_DONE) => {
                // Completion won the race; take our reference back.
                drop(unsafe { Fiber::from_raw(addr) });
                Poll::Ready(())
            }
            Err(_already_installed) => {
                drop(unsafe { Fiber::from_raw(addr) });
                Poll::Pending
            }
        }
    }
}
