use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cadence_core::config::{ResourceConfig, TierConfig};
use cadence_core::{CadenceError, ResourceHandle, ResourceKind, Runtime, RuntimeConfig, Tier};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn runtime(resources: ResourceConfig) -> Runtime {
    let mut config = RuntimeConfig::default();
    config.threads.fail_fast_on_order_violation = false;
    config.resources = resources;
    Runtime::new(config).expect("runtime")
}

fn small_pool(capacity: usize, max_overflow: usize) -> ResourceConfig {
    ResourceConfig {
        small: TierConfig {
            ceiling: 4 * 1024,
            capacity,
        },
        max_overflow,
        memory_budget_bytes: 64 * 1024 * 1024,
        ..ResourceConfig::default()
    }
}

#[test]
fn full_small_tier_spills_to_overflow_and_recovers() {
    let rt = runtime(small_pool(500, 200));

    let handles: Vec<ResourceHandle> = (0..600)
        .map(|_| {
            rt.allocate_resource("capture-0", ResourceKind::Audio, 4 * 1024, Some(0))
                .expect("allocate")
        })
        .collect();

    let pooled = handles.iter().filter(|h| h.tier() == Tier::Small).count();
    let overflow = handles.iter().filter(|h| h.is_overflow()).count();
    assert_eq!(pooled, 500);
    assert_eq!(overflow, 100);

    let metrics = rt.resources().metrics().expect("metrics");
    assert_eq!(metrics.live_handles, 600);
    assert_eq!(metrics.overflow_live, 100);
    assert_eq!(metrics.tiers[0].live, 500);
    assert_eq!(metrics.tiers[0].free, 0);

    for handle in handles {
        rt.deallocate_resource(handle).expect("deallocate");
    }

    let metrics = rt.resources().metrics().expect("metrics");
    assert_eq!(metrics.tiers[0].free, 500);
    assert_eq!(metrics.overflow_live, 0);
    assert_eq!(metrics.live_handles, 0);
    assert_eq!(metrics.live_bytes, 0);
    assert_eq!(metrics.allocations, 600);
    assert_eq!(metrics.deallocations, 600);
}

#[test]
fn overflow_bucket_is_bounded() {
    let rt = runtime(small_pool(2, 1));
    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(
            rt.allocate_resource("storage", ResourceKind::Scratch, 512, None)
                .expect("allocate"),
        );
    }
    let err = rt
        .allocate_resource("storage", ResourceKind::Scratch, 512, None)
        .err()
        .expect("exhausted");
    assert!(matches!(err, CadenceError::ResourceExhausted { .. }));

    // A failed allocation leaves no trace in accounting.
    assert_eq!(rt.resources().live_handles().expect("live").len(), 3);
    for handle in held {
        rt.deallocate_resource(handle).expect("deallocate");
    }
    assert!(rt
        .allocate_resource("storage", ResourceKind::Scratch, 512, None)
        .is_ok());
}

#[test]
fn random_churn_never_exceeds_capacity_plus_overflow() {
    const CAPACITY: usize = 64;
    const MAX_OVERFLOW: usize = 32;

    let rt = Arc::new(runtime(small_pool(CAPACITY, MAX_OVERFLOW)));
    let workers: Vec<_> = (0..4u64)
        .map(|seed| {
            let rt = Arc::clone(&rt);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                let mut held = Vec::new();
                let owner = format!("processing-{seed}");
                for _ in 0..2_000 {
                    if held.is_empty() || rng.gen_bool(0.55) {
                        let size = rng.gen_range(1..=4 * 1024);
                        match rt.allocate_resource(&owner, ResourceKind::Signal, size, Some(7)) {
                            Ok(handle) => held.push(handle),
                            Err(CadenceError::ResourceExhausted { .. }) => {}
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    } else {
                        let idx = rng.gen_range(0..held.len());
                        rt.deallocate_resource(held.swap_remove(idx))
                            .expect("deallocate");
                    }

                    let live = rt.resources().live_handles().expect("live").len();
                    assert!(live <= CAPACITY + MAX_OVERFLOW, "{live} live handles");
                }
                for handle in held {
                    rt.deallocate_resource(handle).expect("deallocate");
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().expect("worker");
    }

    let metrics = rt.resources().metrics().expect("metrics");
    assert_eq!(metrics.live_handles, 0);
    assert_eq!(metrics.tiers[0].free, CAPACITY);
    assert_eq!(metrics.allocations, metrics.deallocations);
}

#[test]
fn channels_have_independent_pools() {
    let rt = runtime(small_pool(1, 0));
    let a = rt
        .allocate_resource("capture-0", ResourceKind::Audio, 1024, Some(0))
        .expect("channel 0");
    let b = rt
        .allocate_resource("capture-1", ResourceKind::Audio, 1024, Some(1))
        .expect("channel 1");
    assert_eq!(a.tier(), Tier::Small);
    assert_eq!(b.tier(), Tier::Small);
    assert!(rt
        .allocate_resource("capture-0", ResourceKind::Audio, 1024, Some(0))
        .is_err());

    let metrics = rt.resources().metrics().expect("metrics");
    assert_eq!(metrics.channels.len(), 2);
    assert!(metrics.channels.iter().all(|c| c.live_handles == 1));

    rt.deallocate_resource(a).expect("a");
    rt.deallocate_resource(b).expect("b");
}

#[test]
fn shutdown_reclaims_leaked_handles() {
    let rt = Arc::new(runtime(small_pool(16, 16)));
    rt.install_shutdown_sequence().expect("install");
    let leaked = rt
        .allocate_resource("transcription", ResourceKind::Transcript, 2048, Some(3))
        .expect("allocate");
    std::mem::forget(leaked);

    let report = rt.execute_cleanup().expect("cleanup");
    assert!(report.checks_passed());
    assert!(rt.resources().live_handles().expect("live").is_empty());
    assert_eq!(rt.resources().metrics().expect("metrics").tiers[0].free, 16);
}

#[test]
fn pool_wait_times_out_into_overflow() {
    let mut resources = small_pool(1, 4);
    resources.pool_wait_ms = 150;
    let rt = Arc::new(runtime(resources));

    let (held_tx, held_rx) = crossbeam_channel::bounded(0);
    let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);
    let holder = {
        let rt = Arc::clone(&rt);
        thread::spawn(move || {
            let handle = rt
                .allocate_resource("capture-0", ResourceKind::Audio, 1024, Some(0))
                .expect("slot");
            held_tx.send(()).expect("held");
            done_rx.recv().expect("done");
            rt.deallocate_resource(handle).expect("release");
        })
    };
    held_rx.recv().expect("held");

    let started = Instant::now();
    let spilled = rt
        .allocate_resource("processing-0", ResourceKind::Signal, 1024, Some(0))
        .expect("overflow");
    assert!(spilled.is_overflow());
    assert!(started.elapsed() >= Duration::from_millis(150));

    done_tx.send(()).expect("done");
    holder.join().expect("holder");
    rt.deallocate_resource(spilled).expect("spilled");

    let metrics = rt.resources().metrics().expect("metrics");
    assert_eq!(metrics.live_handles, 0);
    assert_eq!(metrics.overflow_live, 0);
    assert_eq!(metrics.tiers[0].free, 1);
    assert_eq!(metrics.hit_rate, 0.5);
}
