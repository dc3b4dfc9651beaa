//! `CleanupCoordinator`: dependency-ordered teardown with rollback.
//!
//! ## Run
//!
//! ```text
//! execute_cleanup(ctx)
//!     ├─ snapshot tasks under the registry lock (update), release
//!     ├─ per step in topological order:
//!     │     blocked?      → dependency failed, rolled back or blocked
//!     │     run           → own thread, recv_timeout(step deadline)
//!     │     failure       → roll back completed ancestors, newest first
//!     └─ post-conditions  → no live handles, threads at baseline, nothing mid-transition
//! ```
//!
//! Cycles are rejected at registration; a run can never discover one.

pub mod report;

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span, warn};

pub use report::{BlockedStep, CheckResult, CleanupReport, PostCheck, StepFailure, StepRecord};

use crate::capability::Coordination;
use crate::component::DependencyGraph;
use crate::config::CleanupConfig;
use crate::error::{CadenceError, Result};
use crate::thread::{LockContext, LockRank, RankedMutex, RunGuard};
use crate::ChannelId;

/// A teardown or rollback action. Runs on a dedicated thread.
pub type CleanupAction = Arc<dyn Fn() -> Result<()> + Send + Sync>;

/// A named teardown step.
#[derive(Clone)]
pub struct CleanupTask {
    name: String,
    dependencies: Vec<String>,
    channel: Option<ChannelId>,
    action: CleanupAction,
    rollback: Option<CleanupAction>,
    timeout: Option<Duration>,
}

impl CleanupTask {
    pub fn new<F>(name: &str, action: F) -> Self
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            dependencies: Vec::new(),
            channel: None,
            action: Arc::new(action),
            rollback: None,
            timeout: None,
        }
    }

    /// Steps that must complete before this one runs. They may be registered
    /// later.
    pub fn depends_on(mut self, dependencies: &[&str]) -> Self {
        self.dependencies
            .extend(dependencies.iter().map(|d| d.to_string()));
        self
    }

    pub fn on_channel(mut self, channel: ChannelId) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_rollback<F>(mut self, rollback: F) -> Self
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        self.rollback = Some(Arc::new(rollback));
        self
    }

    /// Override the configured per-step deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Returned by registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupHandle {
    pub name: String,
    pub dependencies: Vec<String>,
    pub channel: Option<ChannelId>,
    pub has_rollback: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CleanupMetrics {
    pub registered: usize,
    pub runs: u64,
    pub last_success: Option<bool>,
    pub last_elapsed_ms: Option<f64>,
    pub last_failed: usize,
    pub last_rolled_back: usize,
}

#[derive(Default)]
struct Registry {
    graph: DependencyGraph,
    tasks: HashMap<String, CleanupTask>,
    last_report: Option<CleanupReport>,
}

enum StepOutcome {
    Done,
    Failed(String),
    TimedOut,
}

pub struct CleanupCoordinator {
    config: CleanupConfig,
    locks: LockContext,
    registry: RankedMutex<Registry>,
    running: AtomicBool,
    runs: AtomicU64,
}

impl CleanupCoordinator {
    pub fn new(config: CleanupConfig, locks: LockContext) -> Self {
        Self {
            config,
            locks,
            registry: RankedMutex::new(LockRank::Update, Registry::default()),
            running: AtomicBool::new(false),
            runs: AtomicU64::new(0),
        }
    }

    /// Register a step.
    ///
    /// # Errors
    /// - `DuplicateCleanupTask` if the name is taken.
    /// - `CircularDependency` if the step closes a cycle with any registered
    ///   or pending edge. Nothing is registered in either case.
    pub fn register(&self, task: CleanupTask) -> Result<CleanupHandle> {
        let mut registry = self.locks.lock(&self.registry)?;
        if registry.tasks.contains_key(&task.name) {
            return Err(CadenceError::DuplicateCleanupTask(task.name));
        }

        let mut candidate = registry.graph.clone();
        candidate.insert(&task.name, &task.dependencies);
        if let Some(cycle) = candidate.find_cycle() {
            warn!(task = %task.name, cycle = ?cycle, "cleanup task rejected");
            return Err(CadenceError::CircularDependency { cycle });
        }
        registry.graph = candidate;

        let handle = CleanupHandle {
            name: task.name.clone(),
            dependencies: registry.graph.dependencies(&task.name).to_vec(),
            channel: task.channel,
            has_rollback: task.rollback.is_some(),
        };
        debug!(task = %task.name, deps = ?handle.dependencies, "cleanup task registered");
        registry.tasks.insert(task.name.clone(), task);
        Ok(handle)
    }

    pub fn is_registered(&self, name: &str) -> Result<bool> {
        Ok(self.locks.lock(&self.registry)?.tasks.contains_key(name))
    }

    /// Run every registered step, then verify post-conditions.
    pub fn execute_cleanup(&self, ctx: &dyn Coordination) -> Result<CleanupReport> {
        self.run(ctx, None)
    }

    /// Run only the steps scoped to `channel`. Only the in-transition
    /// post-condition applies; other channels keep their resources and workers.
    ///
    /// A scoped step that depends on a step outside the scope is reported as
    /// blocked by it, since that dependency does not run here.
    pub fn execute_cleanup_channel(
        &self,
        ctx: &dyn Coordination,
        channel: ChannelId,
    ) -> Result<CleanupReport> {
        self.run(ctx, Some(channel))
    }

    pub fn last_report(&self) -> Result<Option<CleanupReport>> {
        Ok(self.locks.lock(&self.registry)?.last_report.clone())
    }

    pub fn metrics(&self) -> Result<CleanupMetrics> {
        let registry = self.locks.lock(&self.registry)?;
        let last = registry.last_report.as_ref();
        Ok(CleanupMetrics {
            registered: registry.tasks.len(),
            runs: self.runs.load(Ordering::Relaxed),
            last_success: last.map(CleanupReport::is_success),
            last_elapsed_ms: last.map(|r| r.elapsed_ms),
            last_failed: last.map(|r| r.failed.len()).unwrap_or(0),
            last_rolled_back: last.map(|r| r.rolled_back.len()).unwrap_or(0),
        })
    }

    // ── Run ──────────────────────────────────────────────────────────────

    fn run(&self, ctx: &dyn Coordination, channel: Option<ChannelId>) -> Result<CleanupReport> {
        let _run = RunGuard::try_enter(&self.running).ok_or(CadenceError::CleanupInProgress)?;
        let _span = info_span!("execute_cleanup", ?channel).entered();
        let started = Instant::now();

        let (order, graph, tasks) = {
            let registry = self.locks.lock(&self.registry)?;
            let order: Vec<String> = registry
                .graph
                .topological_order()?
                .into_iter()
                .filter(|name| {
                    channel.is_none()
                        || registry.tasks.get(name).and_then(|t| t.channel) == channel
                })
                .collect();
            (order, registry.graph.clone(), registry.tasks.clone())
        };
        info!(steps = order.len(), "cleanup started");

        let mut report = CleanupReport::new(channel, order.clone());
        // Completed steps, oldest first; rolled-back entries are removed.
        let mut completed: Vec<String> = Vec::new();
        let mut unavailable: HashSet<String> = HashSet::new();
        let in_scope: HashSet<&String> = order.iter().collect();

        for name in &order {
            let Some(task) = tasks.get(name) else { continue };

            let blocker = task
                .dependencies
                .iter()
                .find(|d| {
                    unavailable.contains(*d) || (tasks.contains_key(*d) && !in_scope.contains(d))
                })
                .cloned();
            if let Some(blocked_by) = blocker {
                warn!(step = %name, blocked_by = %blocked_by, "cleanup step blocked");
                report.blocked.push(BlockedStep {
                    name: name.clone(),
                    blocked_by,
                });
                unavailable.insert(name.clone());
                continue;
            }

            let step_start = Instant::now();
            let outcome = match task.dependencies.iter().find(|d| !tasks.contains_key(*d)) {
                Some(missing) => StepOutcome::Failed(format!("unresolved dependency {missing}")),
                None => self.run_action(name, &task.action, self.deadline(task)),
            };
            let duration_ms = step_start.elapsed().as_secs_f64() * 1_000.0;

            match outcome {
                StepOutcome::Done => {
                    debug!(step = %name, duration_ms, "cleanup step done");
                    report.succeeded.push(StepRecord {
                        name: name.clone(),
                        duration_ms,
                    });
                    completed.push(name.clone());
                }
                StepOutcome::Failed(reason) => {
                    self.record_failure(&mut report, name, reason, duration_ms, false);
                    unavailable.insert(name.clone());
                    self.roll_back_ancestors(
                        &graph,
                        &tasks,
                        name,
                        &mut completed,
                        &mut unavailable,
                        &mut report,
                    );
                }
                StepOutcome::TimedOut => {
                    let reason = format!("no result within {:?}", self.deadline(task));
                    self.record_failure(&mut report, name, reason, duration_ms, true);
                    unavailable.insert(name.clone());
                    self.roll_back_ancestors(
                        &graph,
                        &tasks,
                        name,
                        &mut completed,
                        &mut unavailable,
                        &mut report,
                    );
                }
            }
        }

        report.checks = self.verify(ctx, channel)?;
        report.elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
        self.runs.fetch_add(1, Ordering::Relaxed);

        if report.is_success() {
            info!(
                succeeded = report.succeeded.len(),
                elapsed_ms = report.elapsed_ms,
                "cleanup finished"
            );
        } else {
            error!(
                failed = report.failed.len(),
                blocked = report.blocked.len(),
                rolled_back = report.rolled_back.len(),
                checks_passed = report.checks_passed(),
                "cleanup finished with failures"
            );
        }
        self.locks.lock(&self.registry)?.last_report = Some(report.clone());
        Ok(report)
    }

    fn deadline(&self, task: &CleanupTask) -> Duration {
        task.timeout.unwrap_or_else(|| self.config.step_timeout())
    }

    fn record_failure(
        &self,
        report: &mut CleanupReport,
        name: &str,
        reason: String,
        duration_ms: f64,
        timed_out: bool,
    ) {
        let failure = StepFailure {
            name: name.to_string(),
            reason,
            duration_ms,
            timed_out,
        };
        warn!(timed_out, "{}", failure.to_error());
        report.failed.push(failure);
    }

    /// Undo completed ancestors of `failed`, most recently completed first.
    fn roll_back_ancestors(
        &self,
        graph: &DependencyGraph,
        tasks: &HashMap<String, CleanupTask>,
        failed: &str,
        completed: &mut Vec<String>,
        unavailable: &mut HashSet<String>,
        report: &mut CleanupReport,
    ) {
        let ancestors = graph.ancestors(failed);
        let targets: Vec<String> = completed
            .iter()
            .rev()
            .filter(|n| ancestors.contains(*n))
            .filter(|n| tasks.get(*n).is_some_and(|t| t.rollback.is_some()))
            .cloned()
            .collect();

        for name in targets {
            let Some(rollback) = tasks.get(&name).and_then(|t| t.rollback.as_ref()) else {
                continue;
            };
            let deadline = tasks
                .get(&name)
                .map(|t| self.deadline(t))
                .unwrap_or_else(|| self.config.step_timeout());
            let started = Instant::now();
            let outcome = self.run_action(&format!("{name}-rollback"), rollback, deadline);
            let duration_ms = started.elapsed().as_secs_f64() * 1_000.0;

            completed.retain(|n| n != &name);
            unavailable.insert(name.clone());
            match outcome {
                StepOutcome::Done => {
                    info!(step = %name, failed_dependent = failed, "cleanup step rolled back");
                    report.rolled_back.push(StepRecord { name, duration_ms });
                }
                StepOutcome::Failed(reason) => {
                    warn!(step = %name, "rollback failed: {reason}");
                    report.rollback_failures.push(StepFailure {
                        name,
                        reason,
                        duration_ms,
                        timed_out: false,
                    });
                }
                StepOutcome::TimedOut => {
                    warn!(step = %name, "rollback timed out");
                    report.rollback_failures.push(StepFailure {
                        name,
                        reason: format!("no result within {deadline:?}"),
                        duration_ms,
                        timed_out: true,
                    });
                }
            }
        }
    }

    /// Run `action` on its own thread and wait up to `deadline`. A step that
    /// overruns is abandoned; its thread finishes on its own.
    fn run_action(&self, label: &str, action: &CleanupAction, deadline: Duration) -> StepOutcome {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let action = Arc::clone(action);
        let spawned = thread::Builder::new()
            .name(format!("cadence-cleanup-{label}"))
            .spawn(move || {
                let result = catch_unwind(AssertUnwindSafe(|| action()));
                let _ = tx.send(result);
            });
        if let Err(e) = spawned {
            return StepOutcome::Failed(format!("could not spawn step thread: {e}"));
        }

        match rx.recv_timeout(deadline) {
            Ok(Ok(Ok(()))) => StepOutcome::Done,
            Ok(Ok(Err(e))) => StepOutcome::Failed(e.to_string()),
            Ok(Err(_)) => StepOutcome::Failed("step panicked".into()),
            Err(RecvTimeoutError::Timeout) => StepOutcome::TimedOut,
            Err(RecvTimeoutError::Disconnected) => {
                StepOutcome::Failed("step thread exited without a result".into())
            }
        }
    }

    fn verify(&self, ctx: &dyn Coordination, channel: Option<ChannelId>) -> Result<Vec<CheckResult>> {
        let mut checks = Vec::with_capacity(3);
        if channel.is_none() {
            let live = ctx.live_allocations()?;
            checks.push(CheckResult {
                check: PostCheck::ResourcesReleased,
                passed: live == 0,
                detail: format!("{live} live handles"),
            });

            let active = ctx.active_threads()?;
            let baseline = ctx.baseline_threads();
            checks.push(CheckResult {
                check: PostCheck::ThreadsAtBaseline,
                passed: active <= baseline,
                detail: format!("{active} active, baseline {baseline}"),
            });
        }

        let in_transition = ctx.components_in_transition()?;
        checks.push(CheckResult {
            check: PostCheck::NoComponentInTransition,
            passed: in_transition.is_empty(),
            detail: if in_transition.is_empty() {
                "none".to_string()
            } else {
                in_transition.join(", ")
            },
        });

        for failed in checks.iter().filter(|c| !c.passed) {
            error!(check = ?failed.check, detail = %failed.detail, "cleanup post-condition failed");
        }
        Ok(checks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use parking_lot::Mutex;

    use crate::capability::{ResourceSource, StateControl, StateSource, ThreadSource};
    use crate::state::{State, StateEvent};

    #[derive(Default)]
    struct Quiet {
        live: usize,
    }

    impl StateSource for Quiet {
        fn state_of(&self, component: &str) -> Result<State> {
            Err(CadenceError::ComponentNotRegistered(component.to_string()))
        }
        fn components_in_transition(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    impl StateControl for Quiet {
        fn transition(&self, component: &str, _target: State) -> Result<StateEvent> {
            Err(CadenceError::ComponentNotRegistered(component.to_string()))
        }
    }

    impl ResourceSource for Quiet {
        fn live_allocations_for(&self, _owner: &str) -> Result<usize> {
            Ok(self.live)
        }
        fn live_allocations(&self) -> Result<usize> {
            Ok(self.live)
        }
    }

    impl ThreadSource for Quiet {
        fn failed_workers_for(&self, _owner: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        fn active_threads(&self) -> Result<usize> {
            Ok(0)
        }
        fn baseline_threads(&self) -> usize {
            0
        }
    }

    fn coordinator() -> CleanupCoordinator {
        CleanupCoordinator::new(
            CleanupConfig::default(),
            LockContext::new(Duration::from_millis(200), false),
        )
    }

    fn logging(
        log: &Arc<Mutex<Vec<String>>>,
        entry: &str,
    ) -> impl Fn() -> Result<()> + Send + Sync + 'static {
        let log = Arc::clone(log);
        let entry = entry.to_string();
        move || {
            log.lock().push(entry.clone());
            Ok(())
        }
    }

    #[test]
    fn steps_run_dependencies_first() {
        let cc = coordinator();
        let log = Arc::new(Mutex::new(Vec::new()));
        cc.register(CleanupTask::new("close-files", logging(&log, "close")).depends_on(&["flush"]))
            .expect("register");
        cc.register(CleanupTask::new("flush", logging(&log, "flush")))
            .expect("register");

        let report = cc.execute_cleanup(&Quiet::default()).expect("run");
        assert!(report.is_success());
        assert_eq!(*log.lock(), vec!["flush", "close"]);
        assert_eq!(report.order, vec!["flush", "close-files"]);
    }

    #[test]
    fn cycle_is_rejected_at_registration() {
        let cc = coordinator();
        cc.register(CleanupTask::new("a", || Ok(())).depends_on(&["c"]))
            .expect("a");
        cc.register(CleanupTask::new("b", || Ok(())).depends_on(&["a"]))
            .expect("b");
        let err = cc
            .register(CleanupTask::new("c", || Ok(())).depends_on(&["b"]))
            .err()
            .expect("cycle");
        assert!(matches!(err, CadenceError::CircularDependency { .. }));
        assert!(!cc.is_registered("c").expect("lookup"));
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let cc = coordinator();
        cc.register(CleanupTask::new("a", || Ok(()))).expect("a");
        let err = cc.register(CleanupTask::new("a", || Ok(()))).err().expect("dup");
        assert!(matches!(err, CadenceError::DuplicateCleanupTask(ref n) if n == "a"));
    }

    #[test]
    fn failure_rolls_back_ancestors_and_blocks_dependents() {
        let cc = coordinator();
        let log = Arc::new(Mutex::new(Vec::new()));
        cc.register(
            CleanupTask::new("drain", logging(&log, "drain"))
                .with_rollback(logging(&log, "undo-drain")),
        )
        .expect("drain");
        cc.register(
            CleanupTask::new("detach", logging(&log, "detach"))
                .depends_on(&["drain"])
                .with_rollback(logging(&log, "undo-detach")),
        )
        .expect("detach");
        cc.register(
            CleanupTask::new("release", || Err(anyhow::anyhow!("device busy").into()))
                .depends_on(&["detach"]),
        )
        .expect("release");
        cc.register(CleanupTask::new("report", logging(&log, "report")).depends_on(&["release"]))
            .expect("report");
        cc.register(CleanupTask::new("independent", logging(&log, "independent")))
            .expect("independent");

        let report = cc.execute_cleanup(&Quiet::default()).expect("run");
        assert!(!report.is_success());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].name, "release");
        let rolled: Vec<&str> = report.rolled_back.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(rolled, vec!["detach", "drain"]);
        assert_eq!(
            report.blocked,
            vec![BlockedStep {
                name: "report".into(),
                blocked_by: "release".into()
            }]
        );
        assert_eq!(
            *log.lock(),
            vec!["drain", "detach", "undo-detach", "undo-drain", "independent"]
        );
    }

    #[test]
    fn overrunning_step_times_out() {
        let cc = coordinator();
        cc.register(
            CleanupTask::new("stuck", || {
                thread::sleep(Duration::from_millis(500));
                Ok(())
            })
            .with_timeout(Duration::from_millis(20)),
        )
        .expect("register");
        let report = cc.execute_cleanup(&Quiet::default()).expect("run");
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].timed_out);
    }

    #[test]
    fn unresolved_dependency_fails_the_step() {
        let cc = coordinator();
        cc.register(CleanupTask::new("a", || Ok(())).depends_on(&["never-registered"]))
            .expect("register");
        let report = cc.execute_cleanup(&Quiet::default()).expect("run");
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].reason.contains("never-registered"));
    }

    #[test]
    fn leaked_handles_fail_post_conditions() {
        let cc = coordinator();
        let report = cc.execute_cleanup(&Quiet { live: 2 }).expect("run");
        assert!(!report.is_success());
        let check = report
            .checks
            .iter()
            .find(|c| c.check == PostCheck::ResourcesReleased)
            .expect("check");
        assert!(!check.passed);
    }

    #[test]
    fn channel_run_only_executes_scoped_steps() {
        let cc = coordinator();
        let log = Arc::new(Mutex::new(Vec::new()));
        cc.register(CleanupTask::new("ch1", logging(&log, "ch1")).on_channel(1))
            .expect("ch1");
        cc.register(CleanupTask::new("ch2", logging(&log, "ch2")).on_channel(2))
            .expect("ch2");
        cc.register(CleanupTask::new("global", logging(&log, "global")))
            .expect("global");

        let report = cc.execute_cleanup_channel(&Quiet { live: 5 }, 1).expect("run");
        assert!(report.is_success());
        assert_eq!(*log.lock(), vec!["ch1"]);
        assert_eq!(cc.metrics().expect("metrics").runs, 1);
    }

    #[test]
    fn channel_step_with_out_of_scope_dependency_is_blocked() {
        let cc = coordinator();
        let log = Arc::new(Mutex::new(Vec::new()));
        cc.register(CleanupTask::new("flush-all", logging(&log, "flush-all")))
            .expect("flush-all");
        cc.register(
            CleanupTask::new("close-ch1", logging(&log, "close-ch1"))
                .depends_on(&["flush-all"])
                .on_channel(1),
        )
        .expect("close-ch1");
        cc.register(CleanupTask::new("pause-ch1", logging(&log, "pause-ch1")).on_channel(1))
            .expect("pause-ch1");

        let report = cc.execute_cleanup_channel(&Quiet { live: 0 }, 1).expect("run");
        assert_eq!(*log.lock(), vec!["pause-ch1"]);
        assert_eq!(report.blocked.len(), 1);
        assert_eq!(report.blocked[0].name, "close-ch1");
        assert_eq!(report.blocked[0].blocked_by, "flush-all");
        assert!(report.failed.is_empty());

        let full = cc.execute_cleanup(&Quiet { live: 0 }).expect("full run");
        assert!(full.blocked.is_empty());
        assert_eq!(log.lock().len(), 4);
    }
}
