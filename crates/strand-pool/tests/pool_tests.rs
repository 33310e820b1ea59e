//! End-to-end pool behaviour: adaptive sizing, trimming, queue extension,
//! shutdown accounting, and the lifecycle invariants.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use strand_pool::{ManagementTicker, Pool, PoolError, PoolOptions, PoolState};

/// Options with a fast controller so tests observe decisions quickly.
fn fast_options() -> PoolOptions {
    PoolOptions {
        management_period_ms: 20,
        ticker: Some(ManagementTicker::new("test", Duration::from_millis(5))),
        ..PoolOptions::default()
    }
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

// ============================================================================
// ADAPTIVE SIZING
// ============================================================================

#[test]
fn single_item_spawns_a_worker_then_trims_to_zero() {
    let pool = Pool::new(
        0,
        4,
        0,
        "spawn-trim",
        false,
        PoolOptions {
            trim_period_ms: 200,
            steal_awake_period_ms: 100,
            ..fast_options()
        },
    )
    .unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let done2 = Arc::clone(&done);
    pool.submit(move || {
        thread::sleep(Duration::from_millis(50));
        done2.store(true, Ordering::SeqCst);
    })
    .unwrap();

    assert!(
        wait_until(Duration::from_secs(1), || pool.active_workers() >= 1),
        "fast spawn must bring a worker up"
    );
    assert!(wait_until(Duration::from_secs(2), || done
        .load(Ordering::SeqCst)));
    assert!(
        wait_until(Duration::from_secs(3), || pool.active_workers() == 0),
        "idle worker must deactivate after the trim period, active = {}",
        pool.active_workers()
    );
    assert!(
        wait_until(Duration::from_secs(3), || pool.total_workers() == 0),
        "idle worker must retire, total = {}",
        pool.total_workers()
    );
    pool.stop(true);
}

#[test]
fn burst_completes_within_bounds_and_drains() {
    let pool = Arc::new(
        Pool::new(
            0,
            8,
            0,
            "burst",
            false,
            PoolOptions {
                trim_period_ms: 150,
                steal_awake_period_ms: 100,
                ..fast_options()
            },
        )
        .unwrap(),
    );

    // Census invariants sampled continuously while the burst runs.
    let sampling = Arc::new(AtomicBool::new(true));
    let sampler = {
        let pool = Arc::clone(&pool);
        let sampling = Arc::clone(&sampling);
        thread::spawn(move || {
            while sampling.load(Ordering::Acquire) {
                let (active, total) = pool.worker_counts();
                assert!(active <= total, "active {active} > total {total}");
                assert!(total <= 8, "total {total} above max");
                thread::yield_now();
            }
        })
    };

    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..500 {
        let counter = Arc::clone(&counter);
        pool.submit(move || {
            thread::sleep(Duration::from_millis(1));
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }

    assert!(
        wait_until(Duration::from_secs(20), || counter.load(Ordering::SeqCst) == 500),
        "only {} of 500 items completed",
        counter.load(Ordering::SeqCst)
    );
    assert!(
        wait_until(Duration::from_secs(5), || pool.active_workers() == 0),
        "pool must drain back to zero active workers"
    );

    sampling.store(false, Ordering::Release);
    sampler.join().unwrap();
    pool.stop(true);
}

#[test]
fn prewarm_brings_workers_up_ahead_of_load() {
    let pool = Pool::new(0, 4, 0, "prewarm", false, fast_options()).unwrap();
    pool.prewarm(3).unwrap();
    assert!(
        wait_until(Duration::from_secs(1), || pool.total_workers() >= 3),
        "prewarm reached only {} workers",
        pool.total_workers()
    );
    pool.stop(true);
}

#[test]
fn pool_never_trims_below_min_workers() {
    let pool = Pool::new(
        2,
        4,
        0,
        "min-floor",
        false,
        PoolOptions {
            trim_period_ms: 100,
            steal_awake_period_ms: 50,
            ..fast_options()
        },
    )
    .unwrap();
    pool.start().unwrap();
    assert!(wait_until(Duration::from_secs(1), || pool.total_workers() == 2));

    // A long idle stretch, many trim periods deep.
    thread::sleep(Duration::from_millis(800));
    assert_eq!(pool.total_workers(), 2, "total fell below min_workers");
    assert_eq!(pool.state(), PoolState::Running);
    pool.stop(true);
}

#[test]
fn disabled_trimming_keeps_idle_workers_alive() {
    let pool = Pool::new(
        0,
        2,
        0,
        "no-trim",
        false,
        PoolOptions {
            trim_period_ms: -1,
            reasonable_workers: Some(2),
            fast_spawn_limit: Some(2),
            ..fast_options()
        },
    )
    .unwrap();

    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let counter = Arc::clone(&counter);
        pool.submit(move || {
            thread::sleep(Duration::from_millis(100));
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    assert!(wait_until(Duration::from_secs(2), || counter
        .load(Ordering::SeqCst)
        == 2));

    thread::sleep(Duration::from_millis(700));
    assert_eq!(
        pool.active_workers(),
        2,
        "workers must persist with trimming disabled"
    );
    pool.stop(true);
}

// ============================================================================
// STARVATION AND QUEUE EXTENSION
// ============================================================================

#[test]
fn starved_pool_is_rescued_within_a_management_tick() {
    // Fast spawn disabled: only the controller can bring a worker up.
    let pool = Pool::new(
        0,
        2,
        0,
        "rescue",
        false,
        PoolOptions {
            fast_spawn_limit: Some(0),
            ..fast_options()
        },
    )
    .unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    let ran2 = Arc::clone(&ran);
    pool.submit(move || ran2.store(true, Ordering::SeqCst)).unwrap();

    assert!(
        wait_until(Duration::from_secs(1), || ran.load(Ordering::SeqCst)),
        "controller must rescue a starved queue"
    );
    pool.stop(true);
}

#[test]
fn stalled_bounded_queue_extends_once_instead_of_spawning() {
    let pool = Pool::new(
        0,
        4,
        4,
        "extend",
        false,
        PoolOptions {
            reasonable_workers: Some(4),
            fast_spawn_limit: Some(4),
            ..fast_options()
        },
    )
    .unwrap();

    pool.prewarm(4).unwrap();

    let gate = Arc::new(Mutex::new(()));
    let held = gate.lock().unwrap();
    let finished = Arc::new(AtomicUsize::new(0));

    // Four items that pin all four workers on the gate.
    for _ in 0..4 {
        let gate = Arc::clone(&gate);
        let finished = Arc::clone(&finished);
        pool.submit(move || {
            drop(gate.lock().unwrap());
            finished.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    assert!(
        wait_until(Duration::from_secs(2), || {
            pool.queued() == 0 && pool.active_workers() == 4
        }),
        "all four workers must be pinned (active={}, queued={})",
        pool.active_workers(),
        pool.queued()
    );

    // Fill the bounded queue, then overflow it.
    for _ in 0..4 {
        assert_eq!(pool.try_submit(|| ()).unwrap(), true);
    }
    assert_eq!(
        pool.try_submit(|| ()).unwrap(),
        false,
        "queue at base capacity must reject"
    );

    assert!(
        wait_until(Duration::from_secs(2), || {
            pool.queue_extended_capacity() > pool.queue_capacity()
        }),
        "a stalled bounded queue must be extended"
    );
    assert!(pool.queue_extended_capacity() - pool.queue_capacity() <= 256);
    assert_eq!(
        pool.try_submit(|| ()).unwrap(),
        true,
        "extension must admit new work"
    );

    drop(held);
    assert!(wait_until(Duration::from_secs(2), || finished
        .load(Ordering::SeqCst)
        == 4));
    pool.stop(true);
    assert_eq!(pool.state(), PoolState::Stopped);
}

// ============================================================================
// SHUTDOWN
// ============================================================================

#[test]
fn stop_let_finish_executes_every_accepted_item() {
    let pool = Pool::new(2, 2, 0, "graceful", false, fast_options()).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..100 {
        let counter = Arc::clone(&counter);
        pool.submit(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    pool.stop(true);

    assert_eq!(counter.load(Ordering::SeqCst), 100);
    assert_eq!(pool.state(), PoolState::Stopped);
    assert_eq!(pool.executed_items(), 100);
    assert_eq!(pool.cancelled_items(), 0);
}

#[test]
fn immediate_stop_accounts_for_every_item() {
    let pool = Pool::new(0, 2, 0, "abrupt", false, fast_options()).unwrap();
    for _ in 0..50 {
        pool.submit(|| thread::sleep(Duration::from_millis(5))).unwrap();
    }
    pool.stop(false);

    assert_eq!(pool.state(), PoolState::Stopped);
    assert_eq!(
        pool.executed_items() + pool.cancelled_items(),
        pool.accepted_items(),
        "every accepted item must be executed or cancelled"
    );
    assert!(matches!(
        pool.submit(|| ()),
        Err(PoolError::Closed)
    ));
    assert!(matches!(pool.try_submit(|| ()), Err(PoolError::Closed)));
}

#[test]
fn stop_is_idempotent() {
    let pool = Pool::new(1, 2, 0, "twice", false, fast_options()).unwrap();
    pool.submit(|| ()).unwrap();
    pool.stop(true);
    pool.stop(true);
    pool.stop(false);
    assert_eq!(pool.state(), PoolState::Stopped);
}

#[test]
fn panicking_items_do_not_kill_the_pool() {
    let pool = Pool::new(1, 2, 0, "panics", false, fast_options()).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    pool.submit(|| panic!("bad item")).unwrap();
    let counter2 = Arc::clone(&counter);
    pool.submit(move || {
        counter2.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || counter.load(Ordering::SeqCst) == 1),
        "a panicked item must not take its worker down"
    );
    pool.stop(true);
}

// ============================================================================
// CONSTRUCTION
// ============================================================================

#[test]
fn invalid_configurations_are_rejected() {
    let cases = [
        Pool::new(0, 0, 0, "bad", false, PoolOptions::default()),
        Pool::new(0, 4096, 0, "bad", false, PoolOptions::default()),
        Pool::new(5, 4, 0, "bad", false, PoolOptions::default()),
        Pool::new(
            0,
            4,
            0,
            "bad",
            false,
            PoolOptions {
                management_period_ms: 0,
                ..PoolOptions::default()
            },
        ),
    ];
    for case in cases {
        assert!(matches!(case, Err(PoolError::InvalidArgument(_))));
    }
}

#[test]
fn pool_starts_lazily_on_first_submission() {
    let pool = Pool::new(2, 4, 0, "lazy", false, fast_options()).unwrap();
    assert_eq!(pool.state(), PoolState::Created);
    assert_eq!(pool.total_workers(), 0);

    pool.submit(|| ()).unwrap();
    assert_eq!(pool.state(), PoolState::Running);
    assert!(
        wait_until(Duration::from_secs(1), || pool.total_workers() >= 2),
        "first submission must prewarm to min_workers"
    );
    pool.stop(true);
}
