//! `ComponentManager`: dependency-ordered initialization and shutdown.
//!
//! ## Lifecycle pass
//!
//! ```text
//! initialize_all(ctx)
//!     ├─ topological order (CircularDependency before any side effect)
//!     └─ per component, dependencies first:
//!          Registered/Stopped/Error ─► Initializing ─► initialize() ─► Initialized ─► Running(Active)
//!                                                         └── Err ─► Error (dependents blocked)
//! shutdown_all(ctx)
//!     └─ reverse order: Stopping ─► shutdown() ─► Stopped   (Err ─► Error, pass continues)
//! ```
//!
//! The registry lock (rank `component`) is never held while a component's
//! `initialize`/`shutdown` runs: the instance is taken out of the registry,
//! driven with no lock held, then put back.

pub mod graph;
pub mod health;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn};

pub use graph::DependencyGraph;
pub use health::{ComponentHealth, HealthReport, HealthStatus};

use crate::capability::Coordination;
use crate::error::{CadenceError, Result};
use crate::state::State;
use crate::thread::{LockContext, LockRank, RankedMutex, RunGuard};
use crate::ChannelId;

/// What a component does; drives resource expectations in health and
/// consistency checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Capture,
    Processing,
    Transcription,
    Storage,
    Display,
    Service,
}

impl ComponentKind {
    /// Kinds expected to hold at least one live buffer while running.
    pub fn holds_buffers(self) -> bool {
        matches!(
            self,
            ComponentKind::Capture | ComponentKind::Processing | ComponentKind::Transcription
        )
    }
}

/// Contract for lifecycle-managed components.
pub trait Component: Send + 'static {
    /// Bring the component up. Called once per lifecycle pass, after every
    /// dependency reached `Running`.
    ///
    /// # Errors
    /// An error moves the component to `Error` and blocks its dependents.
    fn initialize(&mut self) -> Result<()>;

    /// Release everything acquired in `initialize`.
    fn shutdown(&mut self) -> Result<()>;

    /// Self-reported health. Called under the registry lock, so it must be
    /// cheap and must not call back into the runtime.
    fn health(&self) -> HealthStatus {
        HealthStatus::Healthy
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentFailure {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitReport {
    /// Resolved initialization order.
    pub order: Vec<String>,
    pub initialized: Vec<String>,
    pub failed: Vec<ComponentFailure>,
    /// Skipped because a dependency failed or is not running.
    pub blocked: Vec<String>,
    /// Already initialized or running.
    pub skipped: Vec<String>,
    pub elapsed_ms: f64,
}

impl InitReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.blocked.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownReport {
    pub order: Vec<String>,
    pub stopped: Vec<String>,
    pub failed: Vec<ComponentFailure>,
    /// Never initialized or already stopped.
    pub skipped: Vec<String>,
    pub elapsed_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentMetrics {
    pub registered: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub failed: usize,
    pub overall: HealthStatus,
}

struct Managed {
    kind: ComponentKind,
    channel: Option<ChannelId>,
    instance: Option<Box<dyn Component>>,
}

#[derive(Default)]
struct Registry {
    graph: DependencyGraph,
    managed: HashMap<String, Managed>,
    last_health: Option<HealthReport>,
}

pub struct ComponentManager {
    locks: LockContext,
    registry: RankedMutex<Registry>,
    busy: AtomicBool,
}

impl ComponentManager {
    pub fn new(locks: LockContext) -> Self {
        Self {
            locks,
            registry: RankedMutex::new(LockRank::Component, Registry::default()),
            busy: AtomicBool::new(false),
        }
    }

    /// Add a component and its declared dependencies to the graph.
    ///
    /// Dependencies may name components registered later; they must all exist
    /// by the time `initialize_all` runs.
    pub fn register(
        &self,
        name: &str,
        kind: ComponentKind,
        channel: Option<ChannelId>,
        component: Box<dyn Component>,
        dependencies: &[&str],
    ) -> Result<()> {
        let deps: Vec<String> = dependencies.iter().map(|d| d.to_string()).collect();
        let mut registry = self.locks.lock(&self.registry)?;
        if !registry.graph.insert(name, &deps) {
            return Err(CadenceError::DuplicateComponent(name.to_string()));
        }
        registry.managed.insert(
            name.to_string(),
            Managed {
                kind,
                channel,
                instance: Some(component),
            },
        );
        Ok(())
    }

    pub fn names(&self) -> Result<Vec<String>> {
        Ok(self.locks.lock(&self.registry)?.graph.nodes().to_vec())
    }

    pub fn dependencies(&self, name: &str) -> Result<Vec<String>> {
        let registry = self.locks.lock(&self.registry)?;
        if !registry.graph.contains(name) {
            return Err(CadenceError::ComponentNotRegistered(name.to_string()));
        }
        Ok(registry.graph.dependencies(name).to_vec())
    }

    /// Resolve the initialization order without side effects.
    pub fn initialization_order(&self) -> Result<Vec<String>> {
        let registry = self.locks.lock(&self.registry)?;
        if let Some((_, missing)) = registry.graph.missing_dependencies().into_iter().next() {
            return Err(CadenceError::ComponentNotRegistered(missing));
        }
        registry.graph.topological_order()
    }

    /// Initialize every registered component, dependencies first.
    ///
    /// # Errors
    /// - `CircularDependency` / `ComponentNotRegistered` before anything runs.
    /// - `LifecycleInProgress` if another pass is running.
    ///
    /// Individual component failures are reported in the [`InitReport`].
    pub fn initialize_all(&self, ctx: &dyn Coordination) -> Result<InitReport> {
        let _pass = RunGuard::try_enter(&self.busy).ok_or(CadenceError::LifecycleInProgress)?;
        let _span = info_span!("initialize_all").entered();
        let started = Instant::now();

        let order = self.initialization_order()?;
        let deps = self.dependency_map()?;
        let mut report = InitReport {
            order: order.clone(),
            ..InitReport::default()
        };
        let mut unavailable: HashSet<String> = HashSet::new();

        for name in &order {
            let state = match ctx.state_of(name) {
                Ok(state) => state,
                Err(e) => {
                    self.record_init_failure(&mut report, &mut unavailable, name, e.to_string());
                    continue;
                }
            };
            if matches!(state, State::Initialized | State::Running(_)) {
                report.skipped.push(name.clone());
                continue;
            }

            let blocked_by = deps.get(name).and_then(|deps| {
                deps.iter().find(|d| {
                    unavailable.contains(*d)
                        || !ctx.state_of(d).map(State::is_running).unwrap_or(false)
                })
            });
            if let Some(dep) = blocked_by {
                warn!(component = %name, dependency = %dep, "initialization blocked");
                report.blocked.push(name.clone());
                unavailable.insert(name.clone());
                continue;
            }

            match self.bring_up(ctx, name) {
                Ok(()) => report.initialized.push(name.clone()),
                Err(e) => self.record_init_failure(&mut report, &mut unavailable, name, e.to_string()),
            }
        }

        report.elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
        info!(
            initialized = report.initialized.len(),
            failed = report.failed.len(),
            blocked = report.blocked.len(),
            "initialization pass finished"
        );
        Ok(report)
    }

    /// Stop every component in reverse initialization order. Failures are
    /// recorded and the pass continues.
    pub fn shutdown_all(&self, ctx: &dyn Coordination) -> Result<ShutdownReport> {
        let _pass = RunGuard::try_enter(&self.busy).ok_or(CadenceError::LifecycleInProgress)?;
        let _span = info_span!("shutdown_all").entered();
        let started = Instant::now();

        let mut order = {
            let registry = self.locks.lock(&self.registry)?;
            registry.graph.topological_order()?
        };
        order.reverse();

        let mut report = ShutdownReport {
            order: order.clone(),
            ..ShutdownReport::default()
        };
        for name in &order {
            let needs_shutdown = ctx
                .state_of(name)
                .map(State::needs_shutdown)
                .unwrap_or(false);
            if !needs_shutdown {
                report.skipped.push(name.clone());
                continue;
            }
            match self.bring_down(ctx, name) {
                Ok(()) => report.stopped.push(name.clone()),
                Err(e) => {
                    warn!(component = %name, "shutdown failed: {e}");
                    report.failed.push(ComponentFailure {
                        name: name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        report.elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
        info!(
            stopped = report.stopped.len(),
            failed = report.failed.len(),
            "shutdown pass finished"
        );
        Ok(report)
    }

    /// Combine state, worker liveness, resource accounting and self-reports
    /// into one status per component.
    pub fn poll_health(&self, ctx: &dyn Coordination) -> Result<HealthReport> {
        let snapshot: Vec<(String, ComponentKind, HealthStatus)> = {
            let registry = self.locks.lock(&self.registry)?;
            registry
                .graph
                .nodes()
                .iter()
                .filter_map(|name| {
                    registry.managed.get(name).map(|m| {
                        let reported = m
                            .instance
                            .as_ref()
                            .map(|c| c.health())
                            .unwrap_or_default();
                        (name.clone(), m.kind, reported)
                    })
                })
                .collect()
        };

        let mut components = Vec::with_capacity(snapshot.len());
        for (name, kind, reported) in snapshot {
            let mut health = ComponentHealth::healthy(&name);
            if reported != HealthStatus::Healthy {
                health.degrade(reported, "self-reported");
            }

            match ctx.state_of(&name) {
                Ok(State::Error) => health.degrade(HealthStatus::Failed, "state is error"),
                Ok(state) if state.is_transitional() => {
                    health.degrade(HealthStatus::Degraded, format!("mid-transition ({state})"))
                }
                Ok(state) if state.is_running() && kind.holds_buffers() => {
                    if ctx.live_allocations_for(&name)? == 0 {
                        health.degrade(HealthStatus::Degraded, "running without live buffers");
                    }
                }
                Ok(_) => {}
                Err(e) => health.degrade(HealthStatus::Failed, e.to_string()),
            }

            for worker in ctx.failed_workers_for(&name)? {
                health.degrade(HealthStatus::Failed, format!("worker {worker} failed"));
            }
            components.push(health);
        }

        let report = HealthReport::from_components(components);
        self.locks.lock(&self.registry)?.last_health = Some(report.clone());
        Ok(report)
    }

    pub fn last_health(&self) -> Result<Option<HealthReport>> {
        Ok(self.locks.lock(&self.registry)?.last_health.clone())
    }

    pub fn channel_of(&self, name: &str) -> Result<Option<ChannelId>> {
        let registry = self.locks.lock(&self.registry)?;
        registry
            .managed
            .get(name)
            .map(|m| m.channel)
            .ok_or_else(|| CadenceError::ComponentNotRegistered(name.to_string()))
    }

    pub fn metrics(&self) -> Result<ComponentMetrics> {
        let registry = self.locks.lock(&self.registry)?;
        let count = |status| {
            registry
                .last_health
                .as_ref()
                .map(|h| h.components.iter().filter(|c| c.status == status).count())
                .unwrap_or(0)
        };
        Ok(ComponentMetrics {
            registered: registry.managed.len(),
            healthy: count(HealthStatus::Healthy),
            degraded: count(HealthStatus::Degraded),
            failed: count(HealthStatus::Failed),
            overall: registry
                .last_health
                .as_ref()
                .map(|h| h.overall)
                .unwrap_or_default(),
        })
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    fn dependency_map(&self) -> Result<HashMap<String, Vec<String>>> {
        let registry = self.locks.lock(&self.registry)?;
        Ok(registry
            .graph
            .nodes()
            .iter()
            .map(|n| (n.clone(), registry.graph.dependencies(n).to_vec()))
            .collect())
    }

    fn bring_up(&self, ctx: &dyn Coordination, name: &str) -> Result<()> {
        ctx.transition(name, State::Initializing)?;
        let outcome = self.with_instance(name, |c| c.initialize());
        match outcome {
            Ok(()) => {
                ctx.transition(name, State::Initialized)?;
                ctx.transition(name, State::RUNNING)?;
                info!(component = name, "component running");
                Ok(())
            }
            Err(e) => {
                if let Err(te) = ctx.transition(name, State::Error) {
                    warn!(component = name, "could not mark component errored: {te}");
                }
                Err(CadenceError::ComponentFailed {
                    component: name.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    fn bring_down(&self, ctx: &dyn Coordination, name: &str) -> Result<()> {
        ctx.transition(name, State::Stopping)?;
        match self.with_instance(name, |c| c.shutdown()) {
            Ok(()) => {
                ctx.transition(name, State::Stopped)?;
                info!(component = name, "component stopped");
                Ok(())
            }
            Err(e) => {
                if let Err(te) = ctx.transition(name, State::Error) {
                    warn!(component = name, "could not mark component errored: {te}");
                }
                Err(e)
            }
        }
    }

    /// Run `f` on the component instance with no registry lock held.
    fn with_instance(
        &self,
        name: &str,
        f: impl FnOnce(&mut dyn Component) -> Result<()>,
    ) -> Result<()> {
        let mut instance = {
            let mut registry = self.locks.lock(&self.registry)?;
            registry
                .managed
                .get_mut(name)
                .ok_or_else(|| CadenceError::ComponentNotRegistered(name.to_string()))?
                .instance
                .take()
                .ok_or_else(|| CadenceError::ComponentFailed {
                    component: name.to_string(),
                    reason: "instance is in use".into(),
                })?
        };

        let outcome = f(instance.as_mut());

        let mut registry = self.locks.lock(&self.registry)?;
        if let Some(managed) = registry.managed.get_mut(name) {
            managed.instance = Some(instance);
        }
        outcome
    }

    fn record_init_failure(
        &self,
        report: &mut InitReport,
        unavailable: &mut HashSet<String>,
        name: &str,
        reason: String,
    ) {
        warn!(component = name, "initialization failed: {reason}");
        report.failed.push(ComponentFailure {
            name: name.to_string(),
            reason,
        });
        unavailable.insert(name.to_string());
    }
}
