//! End-to-end scheduler scenarios.

#![cfg(not(loom))]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use weft_runtime::{channel, sleep_for, AsyncMutex, Scheduler};

fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::Layer::default().with_test_writer())
        .try_init();
}

/// Spin-wait (with yielding) until `cond` holds or `timeout` elapses.
fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

#[test]
fn single_worker_sleep_resumes_in_order() {
    init_tracing();
    let scheduler = Scheduler::new(1);
    let trace = Arc::new(Mutex::new(String::new()));
    let done = Arc::new(AtomicBool::new(false));

    let started = Instant::now();
    {
        let scheduler = scheduler.clone();
        let trace = trace.clone();
        let done = done.clone();
        let handle = scheduler.clone();
        scheduler.spawn(async move {
            trace.lock().unwrap().push('A');
            sleep_for(&handle, Duration::from_millis(50)).await;
            trace.lock().unwrap().push('B');
            done.store(true, Ordering::SeqCst);
        });
    }

    assert!(wait_until(Duration::from_secs(5), || done.load(Ordering::SeqCst)));
    let elapsed = started.elapsed();
    assert_eq!(trace.lock().unwrap().as_str(), "AB");
    assert!(elapsed >= Duration::from_millis(50), "woke early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(1), "woke far too late: {elapsed:?}");

    scheduler.shutdown();
}

#[test]
fn fan_out_runs_and_destroys_every_fiber() {
    init_tracing();
    const FIBERS: usize = 10_000;

    let scheduler = Scheduler::new(4);
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..FIBERS {
        let counter = counter.clone();
        scheduler.spawn(async move {
            counter.fetch_add(1, Ordering::Relaxed);
        });
    }

    assert!(wait_until(Duration::from_secs(10), || {
        counter.load(Ordering::Relaxed) == FIBERS
    }));

    // Every handle is dropped and every body has run; the headers must all
    // be gone shortly after.
    let stats = scheduler.stats();
    assert!(wait_until(Duration::from_secs(5), || stats.alive() == 0));
    assert_eq!(stats.spawned(), FIBERS as u64);
    assert_eq!(stats.completed(), FIBERS as u64);
    assert_eq!(stats.destroyed(), FIBERS as u64);

    scheduler.shutdown();
}

#[test]
fn producer_consumer_preserves_order() {
    init_tracing();
    let scheduler = Scheduler::new(2);
    let (tx, rx) = channel::<u32>(&scheduler, 2);
    let received = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));

    scheduler.spawn(async move {
        for value in 0..=4 {
            assert!(tx.send(value).await, "channel closed under the producer");
        }
        tx.close();
    });

    {
        let received = received.clone();
        let done = done.clone();
        scheduler.spawn(async move {
            while let Some(value) = rx.recv().await {
                received.lock().unwrap().push(value);
            }
            done.store(true, Ordering::SeqCst);
        });
    }

    assert!(wait_until(Duration::from_secs(5), || done.load(Ordering::SeqCst)));
    assert_eq!(*received.lock().unwrap(), vec![0, 1, 2, 3, 4]);

    scheduler.shutdown();
}

#[test]
fn rendezvous_channel_hands_off_directly() {
    init_tracing();
    let scheduler = Scheduler::new(2);
    let (tx, rx) = channel::<u32>(&scheduler, 0);
    let sum = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(false));

    scheduler.spawn(async move {
        for value in 1..=10 {
            assert!(tx.send(value).await);
        }
        tx.close();
    });

    {
        let sum = sum.clone();
        let done = done.clone();
        scheduler.spawn(async move {
            while let Some(value) = rx.recv().await {
                sum.fetch_add(value as usize, Ordering::Relaxed);
            }
            done.store(true, Ordering::SeqCst);
        });
    }

    assert!(wait_until(Duration::from_secs(5), || done.load(Ordering::SeqCst)));
    assert_eq!(sum.load(Ordering::Relaxed), 55);

    scheduler.shutdown();
}

/// Non-atomic counter; the async mutex is the only thing keeping increments
/// from tearing.
struct RacyCounter(std::cell::UnsafeCell<u64>);

// SAFETY: every access happens while holding the AsyncMutex in the test.
unsafe impl Sync for RacyCounter {}
unsafe impl Send for RacyCounter {}

#[test]
fn async_mutex_excludes_concurrent_increments() {
    init_tracing();
    const FIBERS: usize = 64;
    const INCREMENTS: u64 = 1_000;

    let scheduler = Scheduler::new(4);
    let mutex = Arc::new(AsyncMutex::new(&scheduler));
    let counter = Arc::new(RacyCounter(std::cell::UnsafeCell::new(0)));
    let finished = Arc::new(AtomicUsize::new(0));

    for _ in 0..FIBERS {
        let mutex = mutex.clone();
        let counter = counter.clone();
        let finished = finished.clone();
        scheduler.spawn(async move {
            let guard = mutex.lock().await;
            for _ in 0..INCREMENTS {
                // SAFETY: the guard serialises access.
                unsafe { *counter.0.get() += 1 };
            }
            drop(guard);
            finished.fetch_add(1, Ordering::SeqCst);
        });
    }

    assert!(wait_until(Duration::from_secs(10), || {
        finished.load(Ordering::SeqCst) == FIBERS
    }));
    assert_eq!(unsafe { *counter.0.get() }, FIBERS as u64 * INCREMENTS);

    scheduler.shutdown();
}

#[test]
fn async_mutex_is_fifo_fair() {
    init_tracing();
    const WAITERS: usize = 10;

    // One worker: spawn order is poll order, so the wait queue builds up
    // in a known order while the holder sleeps.
    let scheduler = Scheduler::new(1);
    let mutex = Arc::new(AsyncMutex::new(&scheduler));
    let order = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicUsize::new(0));

    {
        let mutex = mutex.clone();
        let handle = scheduler.clone();
        let done = done.clone();
        scheduler.spawn(async move {
            let guard = mutex.lock().await;
            sleep_for(&handle, Duration::from_millis(50)).await;
            drop(guard);
            done.fetch_add(1, Ordering::SeqCst);
        });
    }
    // Give the holder time to take the lock before the waiters line up.
    std::thread::sleep(Duration::from_millis(10));

    for id in 0..WAITERS {
        let mutex = mutex.clone();
        let order = order.clone();
        let done = done.clone();
        scheduler.spawn(async move {
            let guard = mutex.lock().await;
            order.lock().unwrap().push(id);
            drop(guard);
            done.fetch_add(1, Ordering::SeqCst);
        });
    }

    assert!(wait_until(Duration::from_secs(5), || {
        done.load(Ordering::SeqCst) == WAITERS + 1
    }));
    let order = order.lock().unwrap();
    let expected: Vec<usize> = (0..WAITERS).collect();
    assert_eq!(*order, expected, "baton passing broke FIFO order");

    scheduler.shutdown();
}

#[test]
fn join_handle_resumes_parent_after_child() {
    init_tracing();
    let scheduler = Scheduler::new(2);
    let events = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));

    {
        let scheduler_inner = scheduler.clone();
        let events = events.clone();
        let done = done.clone();
        scheduler.spawn(async move {
            events.lock().unwrap().push("parent:start");
            let child_events = events.clone();
            let child = scheduler_inner.spawn(async move {
                child_events.lock().unwrap().push("child");
            });
            child.await;
            events.lock().unwrap().push("parent:end");
            done.store(true, Ordering::SeqCst);
        });
    }

    assert!(wait_until(Duration::from_secs(5), || done.load(Ordering::SeqCst)));
    assert_eq!(
        *events.lock().unwrap(),
        vec!["parent:start", "child", "parent:end"]
    );

    scheduler.shutdown();
}

#[test]
fn join_macro_awaits_two_children() {
    init_tracing();
    let scheduler = Scheduler::new(2);
    let total = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(false));

    {
        let scheduler_inner = scheduler.clone();
        let total = total.clone();
        let done = done.clone();
        scheduler.spawn(async move {
            let left_total = total.clone();
            let left = scheduler_inner.spawn(async move {
                left_total.fetch_add(1, Ordering::SeqCst);
            });
            let right_total = total.clone();
            let right = scheduler_inner.spawn(async move {
                right_total.fetch_add(2, Ordering::SeqCst);
            });
            futures::join!(left, right);
            assert_eq!(total.load(Ordering::SeqCst), 3);
            done.store(true, Ordering::SeqCst);
        });
    }

    assert!(wait_until(Duration::from_secs(5), || done.load(Ordering::SeqCst)));
    scheduler.shutdown();
}

#[test]
fn deep_await_chain_completes() {
    init_tracing();
    use std::future::Future;
    use std::pin::Pin;

    const DEPTH: u32 = 200;

    fn chain(
        scheduler: Scheduler,
        depth: u32,
        flag: Arc<AtomicBool>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            if depth == 0 {
                flag.store(true, Ordering::SeqCst);
                return;
            }
            let child = scheduler.spawn(chain(scheduler.clone(), depth - 1, flag));
            child.await;
        })
    }

    let scheduler = Scheduler::new(2);
    let flag = Arc::new(AtomicBool::new(false));
    scheduler.spawn(chain(scheduler.clone(), DEPTH, flag.clone()));

    assert!(wait_until(Duration::from_secs(10), || flag.load(Ordering::SeqCst)));
    scheduler.shutdown();
}

#[test]
fn steals_drain_a_busy_workers_queue() {
    init_tracing();
    const SHORT_FIBERS: usize = 1_000;
    const SPIN: Duration = Duration::from_micros(10);

    let scheduler = Scheduler::new(4);
    let counter = Arc::new(AtomicUsize::new(0));

    {
        let scheduler_inner = scheduler.clone();
        let counter = counter.clone();
        scheduler.spawn(async move {
            // All of these land on this worker's local queue.
            for _ in 0..SHORT_FIBERS {
                let counter = counter.clone();
                scheduler_inner.spawn(async move {
                    let start = Instant::now();
                    while start.elapsed() < SPIN {
                        std::hint::spin_loop();
                    }
                    counter.fetch_add(1, Ordering::Relaxed);
                });
            }
            // Hog this worker so the peers have to steal the backlog.
            let busy = Instant::now();
            while busy.elapsed() < Duration::from_millis(30) {
                std::hint::spin_loop();
            }
        });
    }

    assert!(wait_until(Duration::from_secs(10), || {
        counter.load(Ordering::Relaxed) == SHORT_FIBERS
    }));
    // Counter holds exactly once per fiber, so nothing ran twice; the
    // backlog must have moved predominantly by stealing.
    let steals = scheduler.stats().steals();
    assert!(
        steals > 750,
        "expected the peers to steal most of the backlog, saw {steals} steals"
    );

    scheduler.shutdown();
}

#[test]
fn past_deadline_timer_fires_promptly() {
    init_tracing();
    let scheduler = Scheduler::new(1);
    let done = Arc::new(AtomicBool::new(false));

    {
        let handle = scheduler.clone();
        let done = done.clone();
        scheduler.spawn(async move {
            sleep_for(&handle, Duration::ZERO).await;
            done.store(true, Ordering::SeqCst);
        });
    }

    assert!(wait_until(Duration::from_millis(500), || {
        done.load(Ordering::SeqCst)
    }));
    scheduler.shutdown();
}

#[test]
fn shutdown_destroys_never_run_fibers() {
    init_tracing();
    let scheduler = Scheduler::new(2);

    // Park a fiber in a long sleep and leave a burst in the queues.
    {
        let handle = scheduler.clone();
        scheduler.spawn(async move {
            sleep_for(&handle, Duration::from_secs(3600)).await;
        });
    }
    std::thread::sleep(Duration::from_millis(50));
    for _ in 0..100 {
        scheduler.spawn(async {});
    }

    scheduler.shutdown();
    // Second call is a no-op.
    scheduler.shutdown();

    let stats = scheduler.stats();
    assert_eq!(
        stats.destroyed(),
        stats.spawned(),
        "shutdown leaked fibers: {stats:?}"
    );
}

#[test]
fn spawn_wakes_an_idle_pool() {
    init_tracing();
    let scheduler = Scheduler::new(2);
    // Let the workers spin down and park.
    std::thread::sleep(Duration::from_millis(100));

    let done = Arc::new(AtomicBool::new(false));
    {
        let done = done.clone();
        scheduler.spawn(async move {
            done.store(true, Ordering::SeqCst);
        });
    }
    assert!(wait_until(Duration::from_secs(1), || done.load(Ordering::SeqCst)));
    assert!(scheduler.stats().parks() > 0);

    scheduler.shutdown();
}
