//! `ThreadManager`: lock hierarchy, worker registry, heartbeat tracking.
//!
//! ## Workers
//!
//! ```text
//! spawn_worker(name, owner, f)     → named OS thread running f(WorkerContext)
//! register_external(name, owner)   → accounting only, for threads spawned elsewhere
//!     └─► heartbeat()              → lock-free timestamp store
//! check_heartbeats()               → stale workers flagged Failed
//! stop_all(deadline)               → stop flag set, threads joined until deadline
//! ```
//!
//! The registry is bounded by `max_workers`. Heartbeats touch a single atomic so
//! a worker may beat while holding any lock.

pub mod lock;

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use lock::{
    held_ranks, max_held_rank, LockContext, LockRank, LockStats, LockStatsSnapshot, RankedMutex,
    RankedMutexGuard, RankedReadGuard, RankedRwLock, RankedWriteGuard,
};

use crate::capability::ThreadSource;
use crate::config::ThreadConfig;
use crate::error::{CadenceError, Result};

/// Opaque worker identifier, unique per `ThreadManager`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Running,
    /// Missed its heartbeat deadline or panicked.
    Failed,
    Finished,
}

#[derive(Debug)]
struct WorkerSlot {
    id: WorkerId,
    name: String,
    owner: Option<String>,
    external: bool,
    /// Milliseconds since the manager epoch.
    last_beat_ms: AtomicU64,
    stop: AtomicBool,
    failed: AtomicBool,
    finished: AtomicBool,
}

impl WorkerSlot {
    fn status(&self) -> WorkerStatus {
        if self.finished.load(Ordering::Acquire) {
            WorkerStatus::Finished
        } else if self.failed.load(Ordering::Acquire) {
            WorkerStatus::Failed
        } else {
            WorkerStatus::Running
        }
    }
}

struct WorkerRecord {
    slot: Arc<WorkerSlot>,
    join: Option<JoinHandle<()>>,
}

/// Handle given to a worker body (or returned for an external thread).
#[derive(Debug, Clone)]
pub struct WorkerContext {
    slot: Arc<WorkerSlot>,
    epoch: Instant,
}

impl WorkerContext {
    pub fn id(&self) -> WorkerId {
        self.slot.id
    }

    pub fn name(&self) -> &str {
        &self.slot.name
    }

    /// Record liveness. Never blocks.
    pub fn heartbeat(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.slot.last_beat_ms.store(now, Ordering::Release);
    }

    /// `true` once `stop_all` (or `stop`) has been requested for this worker.
    pub fn should_stop(&self) -> bool {
        self.slot.stop.load(Ordering::Acquire)
    }

    /// Sleep up to `interval`, waking early when a stop was requested.
    /// Returns `false` if the worker should exit.
    pub fn idle(&self, interval: Duration) -> bool {
        let deadline = Instant::now() + interval;
        while Instant::now() < deadline {
            if self.should_stop() {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            std::thread::sleep(remaining.min(Duration::from_millis(10)));
        }
        !self.should_stop()
    }
}

/// Point-in-time view of one registered worker.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSummary {
    pub id: WorkerId,
    pub name: String,
    pub owner: Option<String>,
    pub external: bool,
    pub status: WorkerStatus,
    pub since_heartbeat_ms: u64,
}

/// Outcome of [`ThreadManager::stop_all`].
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopReport {
    pub joined: Vec<String>,
    pub timed_out: Vec<String>,
    pub panicked: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ThreadMetrics {
    pub registered: usize,
    pub active: usize,
    pub failed: usize,
    pub baseline: usize,
    pub max_workers: usize,
    pub lock_acquisitions: u64,
    pub lock_timeouts: u64,
    pub order_violations: u64,
    pub mean_lock_wait_us: f64,
    pub max_lock_wait_us: u64,
}

pub struct ThreadManager {
    config: ThreadConfig,
    locks: LockContext,
    epoch: Instant,
    next_id: AtomicU64,
    baseline: AtomicU64,
    workers: RankedMutex<HashMap<WorkerId, WorkerRecord>>,
    /// One coordination lock per rank, for collaborators.
    named: [RankedMutex<()>; 5],
}

impl ThreadManager {
    pub fn new(config: ThreadConfig) -> Self {
        let locks = LockContext::new(config.lock_timeout(), config.fail_fast_on_order_violation);
        Self {
            config,
            locks,
            epoch: Instant::now(),
            next_id: AtomicU64::new(1),
            baseline: AtomicU64::new(0),
            workers: RankedMutex::new(LockRank::Component, HashMap::new()),
            named: LockRank::ALL.map(|rank| RankedMutex::new(rank, ())),
        }
    }

    /// Acquisition policy shared with every other coordinator.
    pub fn lock_context(&self) -> LockContext {
        self.locks.clone()
    }

    pub fn config(&self) -> &ThreadConfig {
        &self.config
    }

    // ── Named locks ──────────────────────────────────────────────────────

    /// Acquire the coordination lock of `rank`.
    ///
    /// # Errors
    /// - `LockOrderViolation` immediately if the caller holds `rank` or higher.
    /// - `LockTimeout` if the lock is not free within `timeout`.
    pub fn acquire_named(
        &self,
        rank: LockRank,
        timeout: Duration,
    ) -> Result<RankedMutexGuard<'_, ()>> {
        self.locks.lock_for(&self.named[usize::from(rank.level() - 1)], timeout)
    }

    /// Release a named lock. Equivalent to dropping the guard.
    pub fn release(&self, guard: RankedMutexGuard<'_, ()>) {
        drop(guard);
    }

    // ── Workers ──────────────────────────────────────────────────────────

    /// Spawn a named worker thread running `body`.
    ///
    /// A panic inside `body` marks the worker failed instead of unwinding
    /// further.
    pub fn spawn_worker<F>(&self, name: &str, owner: Option<&str>, body: F) -> Result<WorkerId>
    where
        F: FnOnce(WorkerContext) + Send + 'static,
    {
        let mut workers = self.locks.lock(&self.workers)?;
        self.ensure_capacity(&workers)?;

        let ctx = self.new_context(name, owner, false);
        let slot = Arc::clone(&ctx.slot);
        let thread_slot = Arc::clone(&ctx.slot);
        let join = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let outcome = catch_unwind(AssertUnwindSafe(|| body(ctx)));
                if outcome.is_err() {
                    thread_slot.failed.store(true, Ordering::Release);
                }
                thread_slot.finished.store(true, Ordering::Release);
            })?;

        let id = slot.id;
        workers.insert(
            id,
            WorkerRecord {
                slot,
                join: Some(join),
            },
        );
        debug!(worker = name, ?owner, "worker spawned");
        Ok(id)
    }

    /// Account for a thread created outside the manager.
    pub fn register_external(&self, name: &str, owner: Option<&str>) -> Result<WorkerContext> {
        let mut workers = self.locks.lock(&self.workers)?;
        self.ensure_capacity(&workers)?;
        let ctx = self.new_context(name, owner, true);
        workers.insert(
            ctx.id(),
            WorkerRecord {
                slot: Arc::clone(&ctx.slot),
                join: None,
            },
        );
        debug!(worker = name, ?owner, "external thread registered");
        Ok(ctx)
    }

    /// Remove a worker record. Spawned workers should be stopped first.
    pub fn deregister(&self, id: WorkerId) -> Result<bool> {
        let mut workers = self.locks.lock(&self.workers)?;
        Ok(match workers.remove(&id) {
            Some(record) => {
                record.slot.finished.store(true, Ordering::Release);
                true
            }
            None => false,
        })
    }

    /// Request a single worker to stop. Does not wait.
    pub fn stop(&self, id: WorkerId) -> Result<bool> {
        let workers = self.locks.lock(&self.workers)?;
        Ok(match workers.get(&id) {
            Some(record) => {
                record.slot.stop.store(true, Ordering::Release);
                true
            }
            None => false,
        })
    }

    /// Flag every running worker whose last heartbeat is older than the
    /// configured timeout. Returns the newly failed workers.
    pub fn check_heartbeats(&self) -> Result<Vec<WorkerSummary>> {
        let now_ms = self.now_ms();
        let timeout_ms = self.config.heartbeat_timeout_ms;
        let workers = self.locks.lock(&self.workers)?;

        let mut newly_failed = Vec::new();
        for record in workers.values() {
            let slot = &record.slot;
            if slot.status() != WorkerStatus::Running {
                continue;
            }
            let silent = now_ms.saturating_sub(slot.last_beat_ms.load(Ordering::Acquire));
            if silent > timeout_ms {
                slot.failed.store(true, Ordering::Release);
                warn!(worker = %slot.name, silent_ms = silent, "worker missed heartbeat");
                newly_failed.push(self.summarize(slot, now_ms));
            }
        }
        Ok(newly_failed)
    }

    /// Signal every worker to stop, then join spawned threads until `deadline`
    /// elapses. External registrations are removed without joining.
    pub fn stop_all(&self, deadline: Duration) -> Result<StopReport> {
        let mut pending: Vec<(Arc<WorkerSlot>, JoinHandle<()>)> = Vec::new();
        {
            let mut workers = self.locks.lock(&self.workers)?;
            for record in workers.values_mut() {
                record.slot.stop.store(true, Ordering::Release);
                if let Some(join) = record.join.take() {
                    pending.push((Arc::clone(&record.slot), join));
                }
            }
            workers.retain(|_, record| !record.slot.external);
        }

        let mut report = StopReport::default();
        let until = Instant::now() + deadline;
        let mut finished_ids = Vec::new();
        while !pending.is_empty() {
            let (done, waiting): (Vec<_>, Vec<_>) =
                pending.into_iter().partition(|(_, join)| join.is_finished());
            for (slot, join) in done {
                if join.join().is_err() || slot.failed.load(Ordering::Acquire) {
                    report.panicked.push(slot.name.clone());
                }
                report.joined.push(slot.name.clone());
                finished_ids.push(slot.id);
            }
            pending = waiting;
            if pending.is_empty() || Instant::now() >= until {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }

        let mut workers = self.locks.lock(&self.workers)?;
        for id in finished_ids {
            workers.remove(&id);
        }
        // Threads still running keep their join handle so a later stop_all can
        // reap them.
        for (slot, join) in pending {
            warn!(worker = %slot.name, "worker did not stop before deadline");
            report.timed_out.push(slot.name.clone());
            if let Some(record) = workers.get_mut(&slot.id) {
                record.join = Some(join);
            }
        }
        info!(
            joined = report.joined.len(),
            timed_out = report.timed_out.len(),
            "workers stopped"
        );
        Ok(report)
    }

    /// Drop records of spawned workers whose threads already exited.
    pub fn reap_finished(&self) -> Result<usize> {
        let mut workers = self.locks.lock(&self.workers)?;
        let before = workers.len();
        workers.retain(|_, record| {
            let done = record
                .join
                .as_ref()
                .map(|j| j.is_finished())
                .unwrap_or(record.slot.finished.load(Ordering::Acquire));
            !done
        });
        Ok(before - workers.len())
    }

    pub fn workers(&self) -> Result<Vec<WorkerSummary>> {
        let now_ms = self.now_ms();
        let workers = self.locks.lock(&self.workers)?;
        let mut out: Vec<_> = workers
            .values()
            .map(|r| self.summarize(&r.slot, now_ms))
            .collect();
        out.sort_by_key(|w| w.id);
        Ok(out)
    }

    /// Record the current active count as the level cleanup must restore.
    pub fn mark_baseline(&self) -> Result<usize> {
        let active = self.active_count()?;
        self.baseline.store(active as u64, Ordering::Release);
        Ok(active)
    }

    pub fn baseline(&self) -> usize {
        self.baseline.load(Ordering::Acquire) as usize
    }

    pub fn active_count(&self) -> Result<usize> {
        let workers = self.locks.lock(&self.workers)?;
        Ok(workers
            .values()
            .filter(|r| r.slot.status() != WorkerStatus::Finished)
            .count())
    }

    pub fn metrics(&self) -> Result<ThreadMetrics> {
        let (registered, active, failed) = {
            let workers = self.locks.lock(&self.workers)?;
            let active = workers
                .values()
                .filter(|r| r.slot.status() != WorkerStatus::Finished)
                .count();
            let failed = workers
                .values()
                .filter(|r| r.slot.status() == WorkerStatus::Failed)
                .count();
            (workers.len(), active, failed)
        };
        let locks = self.locks.stats().snapshot();
        Ok(ThreadMetrics {
            registered,
            active,
            failed,
            baseline: self.baseline(),
            max_workers: self.config.max_workers,
            lock_acquisitions: locks.acquisitions,
            lock_timeouts: locks.timeouts,
            order_violations: locks.order_violations,
            mean_lock_wait_us: locks.mean_wait_us,
            max_lock_wait_us: locks.max_wait_us,
        })
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    fn ensure_capacity(&self, workers: &HashMap<WorkerId, WorkerRecord>) -> Result<()> {
        let live = workers
            .values()
            .filter(|r| r.slot.status() != WorkerStatus::Finished)
            .count();
        if live >= self.config.max_workers {
            return Err(CadenceError::WorkerLimitReached {
                max: self.config.max_workers,
            });
        }
        Ok(())
    }

    fn new_context(&self, name: &str, owner: Option<&str>, external: bool) -> WorkerContext {
        let id = WorkerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let slot = Arc::new(WorkerSlot {
            id,
            name: name.to_string(),
            owner: owner.map(str::to_string),
            external,
            last_beat_ms: AtomicU64::new(self.now_ms()),
            stop: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        });
        WorkerContext {
            slot,
            epoch: self.epoch,
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn summarize(&self, slot: &WorkerSlot, now_ms: u64) -> WorkerSummary {
        WorkerSummary {
            id: slot.id,
            name: slot.name.clone(),
            owner: slot.owner.clone(),
            external: slot.external,
            status: slot.status(),
            since_heartbeat_ms: now_ms.saturating_sub(slot.last_beat_ms.load(Ordering::Acquire)),
        }
    }
}

/// Single-entry flag for operations that must not overlap (lifecycle passes,
/// cleanup runs). Released on drop.
pub(crate) struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    pub(crate) fn try_enter(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ThreadSource for ThreadManager {
    fn failed_workers_for(&self, owner: &str) -> Result<Vec<String>> {
        let workers = self.locks.lock(&self.workers)?;
        Ok(workers
            .values()
            .filter(|r| r.slot.owner.as_deref() == Some(owner))
            .filter(|r| r.slot.status() == WorkerStatus::Failed)
            .map(|r| r.slot.name.clone())
            .collect())
    }

    fn active_threads(&self) -> Result<usize> {
        self.active_count()
    }

    fn baseline_threads(&self) -> usize {
        self.baseline()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max_workers: usize, heartbeat_timeout_ms: u64) -> ThreadManager {
        ThreadManager::new(ThreadConfig {
            max_workers,
            heartbeat_timeout_ms,
            lock_timeout_ms: 100,
            fail_fast_on_order_violation: false,
        })
    }

    #[test]
    fn worker_limit_is_enforced() {
        let tm = manager(2, 5_000);
        let _a = tm.register_external("a", None).expect("a");
        let _b = tm.register_external("b", None).expect("b");
        let err = tm.register_external("c", None).err().expect("limit");
        assert!(matches!(err, CadenceError::WorkerLimitReached { max: 2 }));
    }

    #[test]
    fn silent_worker_is_flagged_failed() {
        let tm = manager(4, 50);
        let quiet = tm.register_external("quiet", Some("capture")).expect("quiet");
        let chatty = tm.register_external("chatty", Some("capture")).expect("chatty");

        for _ in 0..8 {
            std::thread::sleep(Duration::from_millis(15));
            chatty.heartbeat();
        }

        let failed = tm.check_heartbeats().expect("check");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, quiet.id());
        assert_eq!(
            tm.failed_workers_for("capture").expect("failed"),
            vec!["quiet".to_string()]
        );
    }

    #[test]
    fn stop_all_joins_cooperative_workers() {
        let tm = manager(4, 5_000);
        for i in 0..3 {
            tm.spawn_worker(&format!("loop-{i}"), None, |ctx| {
                while ctx.idle(Duration::from_millis(5)) {
                    ctx.heartbeat();
                }
            })
            .expect("spawn");
        }
        assert_eq!(tm.active_count().expect("active"), 3);

        let report = tm.stop_all(Duration::from_secs(2)).expect("stop");
        assert_eq!(report.joined.len(), 3);
        assert!(report.timed_out.is_empty());
        assert_eq!(tm.active_count().expect("active"), 0);
    }

    #[test]
    fn panicking_worker_is_reported() {
        let tm = manager(4, 5_000);
        tm.spawn_worker("boom", Some("storage"), |_ctx| panic!("worker exploded"))
            .expect("spawn");
        let report = tm.stop_all(Duration::from_secs(2)).expect("stop");
        assert_eq!(report.panicked, vec!["boom".to_string()]);
    }

    #[test]
    fn named_locks_follow_rank_order() {
        let tm = manager(4, 5_000);
        let component = tm
            .acquire_named(LockRank::Component, Duration::from_millis(10))
            .expect("component");
        let err = tm
            .acquire_named(LockRank::State, Duration::from_millis(10))
            .err()
            .expect("state rejected");
        assert!(matches!(err, CadenceError::LockOrderViolation { .. }));
        let update = tm
            .acquire_named(LockRank::Update, Duration::from_millis(10))
            .expect("update");
        tm.release(update);
        tm.release(component);
        assert!(held_ranks().is_empty());
    }
}
