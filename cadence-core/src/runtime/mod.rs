//! `Runtime`: the one explicitly constructed coordination context.
//!
//! Owns every coordinator and implements the capability traits by delegation,
//! so coordinators that need each other (components → state/resources/threads,
//! cleanup → everything) receive `&Runtime` as a `&dyn Coordination` instead of
//! holding references to one another.
//!
//! ```text
//!                         Runtime
//!   ┌──────────┬──────────┬──────────┬────────────┬──────────┬──────────┐
//!   threads    resources  state      components   cleanup    monitor
//!      ▲           ▲         ▲            │            │
//!      └───────────┴─────────┴── &dyn Coordination ────┘
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::capability::{ResourceSource, StateControl, StateSource, ThreadSource};
use crate::cleanup::{CleanupCoordinator, CleanupHandle, CleanupReport, CleanupTask};
use crate::component::{Component, ComponentKind, ComponentManager, HealthReport, InitReport, ShutdownReport};
use crate::config::RuntimeConfig;
use crate::error::{CadenceError, Result};
use crate::monitor::{Metric, MetricsSnapshot, MonitoringManager};
use crate::resource::{PressureProbe, ResourceHandle, ResourceKind, ResourceManager};
use crate::state::{CallbackId, ComponentHandle, ConsistencyReport, State, StateEvent, StateManager};
use crate::thread::{ThreadManager, WorkerContext, WorkerId};
use crate::ChannelId;

/// Names of the steps registered by [`Runtime::install_shutdown_sequence`].
pub const SHUTDOWN_COMPONENTS: &str = "shutdown-components";
pub const STOP_WORKERS: &str = "stop-workers";
pub const RECLAIM_RESOURCES: &str = "reclaim-resources";
pub const STOP_DISPATCHER: &str = "stop-dispatcher";

pub struct Runtime {
    config: RuntimeConfig,
    threads: ThreadManager,
    resources: ResourceManager,
    state: StateManager,
    components: ComponentManager,
    cleanup: CleanupCoordinator,
    monitor: MonitoringManager,
    probe: Option<Arc<dyn PressureProbe>>,
    background: AtomicU64,
}

impl Runtime {
    /// Build every coordinator from `config` and start the state dispatcher.
    pub fn new(mut config: RuntimeConfig) -> Result<Self> {
        config.normalize();
        let threads = ThreadManager::new(config.threads.clone());
        let locks = threads.lock_context();
        let state = StateManager::new(&config.state, locks.clone())?;
        let runtime = Self {
            resources: ResourceManager::new(config.resources.clone(), locks.clone()),
            components: ComponentManager::new(locks.clone()),
            cleanup: CleanupCoordinator::new(config.cleanup.clone(), locks.clone()),
            monitor: MonitoringManager::new(&config.monitor, locks),
            state,
            threads,
            config,
            probe: None,
            background: AtomicU64::new(0),
        };
        runtime.threads.mark_baseline()?;
        info!(
            max_workers = runtime.config.threads.max_workers,
            lock_timeout_ms = runtime.config.threads.lock_timeout_ms,
            "runtime ready"
        );
        Ok(runtime)
    }

    /// Feed the adaptive buffer policy from `probe` instead of pool usage and
    /// host CPU.
    pub fn with_probe(config: RuntimeConfig, probe: Arc<dyn PressureProbe>) -> Result<Self> {
        let mut runtime = Self::new(config)?;
        runtime.probe = Some(probe);
        Ok(runtime)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn threads(&self) -> &ThreadManager {
        &self.threads
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn components(&self) -> &ComponentManager {
        &self.components
    }

    pub fn cleanup(&self) -> &CleanupCoordinator {
        &self.cleanup
    }

    pub fn monitor(&self) -> &MonitoringManager {
        &self.monitor
    }

    // ── Components and state ─────────────────────────────────────────────

    /// Track a component's state without lifecycle management.
    pub fn register_component(
        &self,
        name: &str,
        kind: ComponentKind,
        channel: Option<ChannelId>,
    ) -> Result<ComponentHandle> {
        self.state.register(name, kind, channel)
    }

    /// Track a component and let `initialize_all`/`shutdown_all` drive it.
    pub fn register_managed(
        &self,
        name: &str,
        kind: ComponentKind,
        channel: Option<ChannelId>,
        component: Box<dyn Component>,
        dependencies: &[&str],
    ) -> Result<ComponentHandle> {
        let handle = self.state.register(name, kind, channel)?;
        self.components
            .register(name, kind, channel, component, dependencies)?;
        Ok(handle)
    }

    pub fn transition_state(&self, component: &str, target: State) -> Result<()> {
        self.state.transition(component, target).map(|_| ())
    }

    pub fn get_component_state(&self, component: &str) -> Result<State> {
        self.state.get_state(component)
    }

    /// Observe every state event on the dispatcher thread.
    pub fn register_state_callback<F>(&self, callback: F) -> Result<CallbackId>
    where
        F: Fn(&StateEvent) + Send + Sync + 'static,
    {
        self.state.register_callback(callback)
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<StateEvent> {
        self.state.subscribe()
    }

    pub fn verify_consistency(&self) -> Result<ConsistencyReport> {
        self.state.verify_consistency(&self.resources)
    }

    pub fn initialize_all(&self) -> Result<InitReport> {
        self.components.initialize_all(self)
    }

    pub fn shutdown_all(&self) -> Result<ShutdownReport> {
        self.components.shutdown_all(self)
    }

    pub fn poll_health(&self) -> Result<HealthReport> {
        self.components.poll_health(self)
    }

    // ── Resources and workers ────────────────────────────────────────────

    pub fn allocate_resource(
        &self,
        owner: &str,
        kind: ResourceKind,
        size: usize,
        channel: Option<ChannelId>,
    ) -> Result<ResourceHandle> {
        self.resources.allocate(owner, kind, size, channel)
    }

    pub fn deallocate_resource(&self, handle: ResourceHandle) -> Result<()> {
        self.resources.deallocate(handle)
    }

    pub fn spawn_worker<F>(&self, name: &str, owner: Option<&str>, body: F) -> Result<WorkerId>
    where
        F: FnOnce(WorkerContext) + Send + 'static,
    {
        self.threads.spawn_worker(name, owner, body)
    }

    // ── Cleanup ──────────────────────────────────────────────────────────

    pub fn register_cleanup_task(&self, task: CleanupTask) -> Result<CleanupHandle> {
        self.cleanup.register(task)
    }

    pub fn execute_cleanup(&self) -> Result<CleanupReport> {
        let report = self.cleanup.execute_cleanup(self)?;
        self.after_cleanup(&report);
        Ok(report)
    }

    pub fn execute_cleanup_channel(&self, channel: ChannelId) -> Result<CleanupReport> {
        let report = self.cleanup.execute_cleanup_channel(self, channel)?;
        self.after_cleanup(&report);
        Ok(report)
    }

    /// Register the standard teardown:
    /// `shutdown-components → stop-workers → reclaim-resources → stop-dispatcher`.
    ///
    /// Steps hold a weak reference; once the runtime is gone they do nothing.
    pub fn install_shutdown_sequence(self: &Arc<Self>) -> Result<Vec<CleanupHandle>> {
        let step_timeout = self.config.cleanup.step_timeout();
        // Leave the step its own deadline for reporting.
        let inner_deadline = step_timeout / 2;

        let weak = Arc::downgrade(self);
        let shutdown_components = CleanupTask::new(SHUTDOWN_COMPONENTS, move || {
            with_runtime(&weak, |rt| {
                let report = rt.shutdown_all()?;
                match report.failed.first() {
                    Some(f) => Err(CadenceError::ComponentFailed {
                        component: f.name.clone(),
                        reason: f.reason.clone(),
                    }),
                    None => Ok(()),
                }
            })
        });

        let weak = Arc::downgrade(self);
        let stop_workers = CleanupTask::new(STOP_WORKERS, move || {
            with_runtime(&weak, |rt| {
                rt.background.store(0, Ordering::Release);
                let report = rt.threads.stop_all(inner_deadline)?;
                if report.timed_out.is_empty() {
                    Ok(())
                } else {
                    Err(anyhow::anyhow!("workers still running: {}", report.timed_out.join(", ")).into())
                }
            })
        })
        .depends_on(&[SHUTDOWN_COMPONENTS]);

        let weak = Arc::downgrade(self);
        let reclaim = CleanupTask::new(RECLAIM_RESOURCES, move || {
            with_runtime(&weak, |rt| match rt.resources.reclaim_all()? {
                0 => Ok(()),
                leaked => Err(anyhow::anyhow!("reclaimed {leaked} leaked handles").into()),
            })
        })
        .depends_on(&[STOP_WORKERS]);

        let weak = Arc::downgrade(self);
        let stop_dispatcher = CleanupTask::new(STOP_DISPATCHER, move || {
            with_runtime(&weak, |rt| {
                if rt.state.shutdown_dispatcher(inner_deadline)? {
                    Ok(())
                } else {
                    Err(anyhow::anyhow!("state dispatcher still running").into())
                }
            })
        })
        .depends_on(&[RECLAIM_RESOURCES]);

        [shutdown_components, stop_workers, reclaim, stop_dispatcher]
            .into_iter()
            .map(|task| self.cleanup.register(task))
            .collect()
    }

    // ── Monitoring ───────────────────────────────────────────────────────

    /// Latest published snapshot. Takes no coordination lock.
    pub fn get_metrics(&self) -> Arc<MetricsSnapshot> {
        self.monitor.latest()
    }

    pub fn subscribe_metrics(&self) -> watch::Receiver<Arc<MetricsSnapshot>> {
        self.monitor.subscribe()
    }

    /// Collect every coordinator's metrics and publish a new snapshot.
    pub fn refresh_metrics(&self) -> Result<Arc<MetricsSnapshot>> {
        self.monitor.sample_lock_waits(self.threads.lock_context().stats())?;
        let metrics = vec![
            Metric::Threads(self.threads.metrics()?),
            Metric::Resources(self.resources.metrics()?),
            Metric::State(self.state.metrics()?),
            Metric::Components(self.components.metrics()?),
            Metric::Cleanup(self.cleanup.metrics()?),
            Metric::Latency(self.monitor.latency()?),
        ];
        self.monitor.publish(metrics)
    }

    /// One monitoring pass: policy, heartbeats, health, metrics.
    pub fn tick(&self) -> Result<()> {
        let decision = match &self.probe {
            Some(probe) => self.resources.tick_policy(probe.as_ref()),
            None => self.resources.tick_policy(&self.resources),
        }?;
        debug!(?decision, "policy tick");

        let failed = self.threads.check_heartbeats()?;
        for worker in &failed {
            warn!(worker = %worker.name, owner = ?worker.owner, "worker missed heartbeats");
        }
        self.threads.reap_finished()?;
        self.poll_health()?;
        self.refresh_metrics()?;
        Ok(())
    }

    /// Spawn the monitoring worker ticking every `interval`. Returns the
    /// existing worker if one is already running.
    pub fn start_background(self: &Arc<Self>, interval: Duration) -> Result<WorkerId> {
        let current = self.background.load(Ordering::Acquire);
        if current != 0 {
            return Ok(WorkerId(current));
        }

        let weak = Arc::downgrade(self);
        let id = self
            .threads
            .spawn_worker("cadence-monitor", None, move |ctx| {
                ctx.heartbeat();
                while ctx.idle(interval) {
                    let Some(rt) = weak.upgrade() else { break };
                    ctx.heartbeat();
                    if let Err(e) = rt.tick() {
                        warn!("monitor tick failed: {e}");
                    }
                }
                debug!("monitor worker exiting");
            })?;
        self.background.store(id.0, Ordering::Release);
        info!(interval_ms = interval.as_millis() as u64, "monitor worker started");
        Ok(id)
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    fn after_cleanup(&self, report: &CleanupReport) {
        if let Err(e) = self.monitor.record_cleanup(report) {
            warn!("could not record cleanup latencies: {e}");
        }
        if let Err(e) = self.refresh_metrics() {
            warn!("could not refresh metrics after cleanup: {e}");
        }
    }
}

fn with_runtime(weak: &Weak<Runtime>, f: impl FnOnce(&Runtime) -> Result<()>) -> Result<()> {
    match weak.upgrade() {
        Some(rt) => f(&rt),
        None => Ok(()),
    }
}

impl StateSource for Runtime {
    fn state_of(&self, component: &str) -> Result<State> {
        self.state.state_of(component)
    }

    fn components_in_transition(&self) -> Result<Vec<String>> {
        self.state.components_in_transition()
    }
}

impl StateControl for Runtime {
    fn transition(&self, component: &str, target: State) -> Result<StateEvent> {
        self.state.transition(component, target)
    }
}

impl ResourceSource for Runtime {
    fn live_allocations_for(&self, owner: &str) -> Result<usize> {
        self.resources.live_allocations_for(owner)
    }

    fn live_allocations(&self) -> Result<usize> {
        self.resources.live_allocations()
    }
}

impl ThreadSource for Runtime {
    fn failed_workers_for(&self, owner: &str) -> Result<Vec<String>> {
        self.threads.failed_workers_for(owner)
    }

    fn active_threads(&self) -> Result<usize> {
        self.threads.active_threads()
    }

    fn baseline_threads(&self) -> usize {
        self.threads.baseline_threads()
    }
}
