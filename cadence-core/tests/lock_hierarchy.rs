use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cadence_core::config::ThreadConfig;
use cadence_core::thread::{held_ranks, max_held_rank};
use cadence_core::{CadenceError, LockRank, ThreadManager};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn manager() -> ThreadManager {
    ThreadManager::new(ThreadConfig {
        fail_fast_on_order_violation: false,
        lock_timeout_ms: 50,
        ..ThreadConfig::default()
    })
}

#[test]
fn lower_rank_request_fails_immediately_and_keeps_held_locks() {
    let tm = manager();
    let component = tm
        .acquire_named(LockRank::Component, Duration::from_millis(50))
        .expect("component");

    let started = Instant::now();
    let err = tm
        .acquire_named(LockRank::State, Duration::from_secs(5))
        .err()
        .expect("out of order");
    assert!(started.elapsed() < Duration::from_secs(1));
    match err {
        CadenceError::LockOrderViolation { requested, held } => {
            assert_eq!(requested, LockRank::State);
            assert_eq!(held, LockRank::Component);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(held_ranks(), vec![LockRank::Component]);

    // Still allowed to go up.
    let update = tm
        .acquire_named(LockRank::Update, Duration::from_millis(50))
        .expect("update");
    assert_eq!(held_ranks(), vec![LockRank::Component, LockRank::Update]);

    tm.release(update);
    tm.release(component);
    assert!(held_ranks().is_empty());
    assert_eq!(tm.metrics().expect("metrics").order_violations, 1);
}

#[test]
fn same_rank_is_not_reentrant() {
    let tm = manager();
    let _perf = tm
        .acquire_named(LockRank::Perf, Duration::from_millis(50))
        .expect("perf");
    assert!(matches!(
        tm.acquire_named(LockRank::Perf, Duration::from_millis(50)),
        Err(CadenceError::LockOrderViolation { .. })
    ));
}

#[test]
fn contended_lock_times_out_instead_of_blocking() {
    let tm = Arc::new(manager());
    let (held_tx, held_rx) = crossbeam_channel::bounded::<()>(0);
    let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);

    let holder = {
        let tm = Arc::clone(&tm);
        thread::spawn(move || {
            let _guard = tm
                .acquire_named(LockRank::Metrics, Duration::from_millis(50))
                .expect("metrics");
            held_tx.send(()).expect("signal");
            let _ = done_rx.recv();
        })
    };

    held_rx.recv().expect("holder ready");
    let err = tm
        .acquire_named(LockRank::Metrics, Duration::from_millis(20))
        .err()
        .expect("contended");
    assert!(matches!(err, CadenceError::LockTimeout { lock: LockRank::Metrics, .. }));
    assert!(held_ranks().is_empty());

    done_tx.send(()).expect("release holder");
    holder.join().expect("holder");
    assert!(tm
        .acquire_named(LockRank::Metrics, Duration::from_millis(50))
        .is_ok());
}

#[test]
fn randomized_acquisition_never_deadlocks_and_always_rejects_out_of_order() {
    const THREADS: u64 = 8;
    const ITERATIONS: usize = 500;

    let tm = Arc::new(manager());
    let acquired = Arc::new(AtomicU64::new(0));
    let rejected = Arc::new(AtomicU64::new(0));

    let started = Instant::now();
    let handles: Vec<_> = (0..THREADS)
        .map(|seed| {
            let tm = Arc::clone(&tm);
            let acquired = Arc::clone(&acquired);
            let rejected = Arc::clone(&rejected);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(0xC0FFEE + seed);
                for _ in 0..ITERATIONS {
                    let mut held = Vec::new();
                    for _ in 0..rng.gen_range(1..=4) {
                        let rank = LockRank::ALL[rng.gen_range(0..LockRank::ALL.len())];
                        let must_reject = max_held_rank().is_some_and(|top| rank <= top);
                        match tm.acquire_named(rank, Duration::from_millis(20)) {
                            Ok(guard) => {
                                assert!(!must_reject, "granted {rank} out of order");
                                acquired.fetch_add(1, Ordering::Relaxed);
                                held.push(guard);
                            }
                            Err(CadenceError::LockOrderViolation { .. }) => {
                                assert!(must_reject, "rejected in-order request for {rank}");
                                rejected.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(CadenceError::LockTimeout { .. }) => {}
                            Err(other) => panic!("unexpected error: {other}"),
                        }
                    }
                    if rng.gen_bool(0.5) {
                        held.reverse();
                    }
                    drop(held);
                    assert!(held_ranks().is_empty());
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("stress thread");
    }

    assert!(started.elapsed() < Duration::from_secs(60));
    assert!(acquired.load(Ordering::Relaxed) > 0);
    assert!(rejected.load(Ordering::Relaxed) > 0);
    assert_eq!(
        tm.metrics().expect("metrics").order_violations,
        rejected.load(Ordering::Relaxed)
    );
}
