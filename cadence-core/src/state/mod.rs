//! `StateManager`: authoritative component state.
//!
//! ## Transition
//!
//! ```text
//! transition(name, target)
//!     ├─ table read lock (state)   → clone the component's entry, release
//!     ├─ entry lock (state)        → validate edge, mutate, push history, release
//!     └─ dispatcher queue          → callbacks + broadcast on the dispatch thread
//! ```
//!
//! The table lock and the entry locks share the `state` rank and are never
//! held together. History only records successful transitions; rejected
//! requests are still published to observers with `success = false`.

pub mod dispatch;
pub mod table;

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub use dispatch::{CallbackId, StateCallback};
pub use table::{is_legal, successors, Activity, State, TRANSITIONS};

use crate::capability::{ResourceSource, StateControl, StateSource};
use crate::component::ComponentKind;
use crate::config::StateConfig;
use crate::error::{CadenceError, Result};
use crate::thread::{LockContext, LockRank, RankedMutex, RankedRwLock};
use crate::ChannelId;
use dispatch::Dispatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Transition,
    Rollback,
}

/// One state change, as recorded in history and delivered to observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateEvent {
    /// Process-wide sequence number; orders events of one component.
    pub seq: u64,
    pub component: String,
    pub channel: Option<ChannelId>,
    pub from: State,
    pub to: State,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub kind: EventKind,
}

/// Returned by registration; identifies a component to collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentHandle {
    pub name: String,
    pub kind: ComponentKind,
    pub channel: Option<ChannelId>,
}

/// Snapshot of one registered component.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentInfo {
    pub name: String,
    pub kind: ComponentKind,
    pub channel: Option<ChannelId>,
    pub state: State,
    pub transitions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "violation", rename_all = "camelCase")]
pub enum ViolationKind {
    /// A buffer-holding component is running with no live allocation.
    RunningWithoutResources,
    /// The last recorded event does not end in the current state.
    HistoryMismatch { recorded: State, actual: State },
    /// The component left `Registered` without any recorded transition.
    MissingHistory { actual: State },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyViolation {
    pub component: String,
    pub kind: ViolationKind,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyReport {
    pub checked: usize,
    pub violations: Vec<ConsistencyViolation>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.violations.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StateMetrics {
    pub components: usize,
    pub running: usize,
    pub in_transition: usize,
    pub errored: usize,
    pub transitions: u64,
    pub rejected: u64,
    pub rollbacks: u64,
    pub events_delivered: u64,
    pub callback_panics: u64,
}

struct Entry {
    kind: ComponentKind,
    channel: Option<ChannelId>,
    state: State,
    history: Vec<StateEvent>,
}

pub struct StateManager {
    locks: LockContext,
    table: RankedRwLock<HashMap<String, Arc<RankedMutex<Entry>>>>,
    seq: AtomicU64,
    transitions: AtomicU64,
    rejected: AtomicU64,
    rollbacks: AtomicU64,
    dispatcher: Dispatcher,
}

impl StateManager {
    /// Create the manager and start its dispatcher thread.
    pub fn new(config: &StateConfig, locks: LockContext) -> Result<Self> {
        let dispatcher = Dispatcher::start(locks.clone(), config.broadcast_capacity)?;
        Ok(Self {
            locks,
            table: RankedRwLock::new(LockRank::State, HashMap::new()),
            seq: AtomicU64::new(0),
            transitions: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            dispatcher,
        })
    }

    /// Register a component in `Registered` state.
    ///
    /// # Errors
    /// - `DuplicateComponent` if the name was ever registered before.
    pub fn register(
        &self,
        name: &str,
        kind: ComponentKind,
        channel: Option<ChannelId>,
    ) -> Result<ComponentHandle> {
        let mut table = self.locks.write(&self.table)?;
        if table.contains_key(name) {
            return Err(CadenceError::DuplicateComponent(name.to_string()));
        }
        table.insert(
            name.to_string(),
            Arc::new(RankedMutex::new(
                LockRank::State,
                Entry {
                    kind,
                    channel,
                    state: State::Registered,
                    history: Vec::new(),
                },
            )),
        );
        debug!(component = name, ?kind, ?channel, "component registered");
        Ok(ComponentHandle {
            name: name.to_string(),
            kind,
            channel,
        })
    }

    pub fn is_registered(&self, name: &str) -> Result<bool> {
        Ok(self.locks.read(&self.table)?.contains_key(name))
    }

    pub fn get_state(&self, name: &str) -> Result<State> {
        let entry = self.entry(name)?;
        let state = self.locks.lock(&*entry)?.state;
        Ok(state)
    }

    /// Move `name` to `target` if the edge exists in the transition table.
    ///
    /// # Errors
    /// - `ComponentNotRegistered` for unknown names.
    /// - `InvalidTransition` if the edge is not declared; state is unchanged.
    /// - `LockTimeout` / `LockOrderViolation` from lock acquisition; state is unchanged.
    pub fn transition(&self, name: &str, target: State) -> Result<StateEvent> {
        let entry = self.entry(name)?;
        let outcome = {
            let mut entry = self.locks.lock(&*entry)?;
            let from = entry.state;
            let legal = is_legal(from, target);
            let event = self.event(name, entry.channel, from, target, legal, EventKind::Transition);
            if legal {
                entry.state = target;
                entry.history.push(event.clone());
            }
            event
        };

        let legal = outcome.success;
        self.dispatcher.publish(outcome.clone());
        if !legal {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(component = name, from = %outcome.from, to = %target, "transition rejected");
            return Err(CadenceError::InvalidTransition {
                component: name.to_string(),
                from: outcome.from,
                to: target,
            });
        }
        self.transitions.fetch_add(1, Ordering::Relaxed);
        debug!(component = name, from = %outcome.from, to = %target, "transition");
        Ok(outcome)
    }

    /// Undo the most recent successful transition of `name`.
    ///
    /// Pops the event from history and restores its `from` state. Returns
    /// `None` if there is nothing to undo.
    pub fn rollback(&self, name: &str) -> Result<Option<StateEvent>> {
        let entry = self.entry(name)?;
        let event = {
            let mut entry = self.locks.lock(&*entry)?;
            let Some(last) = entry.history.pop() else {
                return Ok(None);
            };
            let current = entry.state;
            entry.state = last.from;
            self.event(name, entry.channel, current, last.from, true, EventKind::Rollback)
        };
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
        info!(component = name, from = %event.from, to = %event.to, "state rolled back");
        self.dispatcher.publish(event.clone());
        Ok(Some(event))
    }

    pub fn history(&self, name: &str) -> Result<Vec<StateEvent>> {
        let entry = self.entry(name)?;
        let history = self.locks.lock(&*entry)?.history.clone();
        Ok(history)
    }

    /// Register an observer. It runs on the dispatcher thread, never under a
    /// coordination lock.
    pub fn register_callback<F>(&self, callback: F) -> Result<CallbackId>
    where
        F: Fn(&StateEvent) + Send + Sync + 'static,
    {
        self.dispatcher.register(Arc::new(callback))
    }

    pub fn unregister_callback(&self, id: CallbackId) -> Result<bool> {
        self.dispatcher.unregister(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.dispatcher.subscribe()
    }

    /// Block until every event published before this call was delivered.
    pub fn flush(&self, timeout: Duration) -> bool {
        self.dispatcher.flush(timeout)
    }

    pub fn dispatcher_running(&self) -> bool {
        self.dispatcher.is_running()
    }

    /// Stop the dispatcher thread after draining queued events.
    pub fn shutdown_dispatcher(&self, timeout: Duration) -> Result<bool> {
        self.dispatcher.shutdown(timeout)
    }

    pub fn components(&self) -> Result<Vec<ComponentInfo>> {
        let mut out = Vec::new();
        for (name, entry) in self.entries()? {
            let entry = self.locks.lock(&*entry)?;
            out.push(ComponentInfo {
                name,
                kind: entry.kind,
                channel: entry.channel,
                state: entry.state,
                transitions: entry.history.len(),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Cross-check every component against the state invariants without
    /// mutating anything.
    pub fn verify_consistency(&self, resources: &dyn ResourceSource) -> Result<ConsistencyReport> {
        let mut report = ConsistencyReport::default();
        let mut running_holders = Vec::new();

        for (name, entry) in self.entries()? {
            let entry = self.locks.lock(&*entry)?;
            report.checked += 1;
            match entry.history.last() {
                Some(last) if last.to != entry.state => {
                    report.violations.push(ConsistencyViolation {
                        component: name.clone(),
                        kind: ViolationKind::HistoryMismatch {
                            recorded: last.to,
                            actual: entry.state,
                        },
                    });
                }
                None if entry.state != State::Registered => {
                    report.violations.push(ConsistencyViolation {
                        component: name.clone(),
                        kind: ViolationKind::MissingHistory {
                            actual: entry.state,
                        },
                    });
                }
                _ => {}
            }
            if entry.state.is_running() && entry.kind.holds_buffers() {
                running_holders.push(name);
            }
        }

        // Resource accounting is queried with no state lock held.
        for name in running_holders {
            if resources.live_allocations_for(&name)? == 0 {
                report.violations.push(ConsistencyViolation {
                    component: name,
                    kind: ViolationKind::RunningWithoutResources,
                });
            }
        }

        report.violations.sort_by(|a, b| a.component.cmp(&b.component));
        if !report.is_consistent() {
            warn!(
                violations = report.violations.len(),
                "state consistency check failed"
            );
        }
        Ok(report)
    }

    pub fn metrics(&self) -> Result<StateMetrics> {
        let components = self.components()?;
        Ok(StateMetrics {
            components: components.len(),
            running: components.iter().filter(|c| c.state.is_running()).count(),
            in_transition: components
                .iter()
                .filter(|c| c.state.is_transitional())
                .count(),
            errored: components
                .iter()
                .filter(|c| c.state == State::Error)
                .count(),
            transitions: self.transitions.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            events_delivered: self.dispatcher.delivered(),
            callback_panics: self.dispatcher.callback_panics(),
        })
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    fn entry(&self, name: &str) -> Result<Arc<RankedMutex<Entry>>> {
        self.locks
            .read(&self.table)?
            .get(name)
            .cloned()
            .ok_or_else(|| CadenceError::ComponentNotRegistered(name.to_string()))
    }

    fn entries(&self) -> Result<Vec<(String, Arc<RankedMutex<Entry>>)>> {
        Ok(self
            .locks
            .read(&self.table)?
            .iter()
            .map(|(name, entry)| (name.clone(), Arc::clone(entry)))
            .collect())
    }

    fn event(
        &self,
        name: &str,
        channel: Option<ChannelId>,
        from: State,
        to: State,
        success: bool,
        kind: EventKind,
    ) -> StateEvent {
        StateEvent {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            component: name.to_string(),
            channel,
            from,
            to,
            timestamp: Utc::now(),
            success,
            kind,
        }
    }
}

impl StateSource for StateManager {
    fn state_of(&self, component: &str) -> Result<State> {
        self.get_state(component)
    }

    fn components_in_transition(&self) -> Result<Vec<String>> {
        Ok(self
            .components()?
            .into_iter()
            .filter(|c| c.state.is_transitional())
            .map(|c| c.name)
            .collect())
    }
}

impl StateControl for StateManager {
    fn transition(&self, component: &str, target: State) -> Result<StateEvent> {
        StateManager::transition(self, component, target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use parking_lot::Mutex;

    struct FixedResources(usize);

    impl ResourceSource for FixedResources {
        fn live_allocations_for(&self, _owner: &str) -> Result<usize> {
            Ok(self.0)
        }

        fn live_allocations(&self) -> Result<usize> {
            Ok(self.0)
        }
    }

    fn manager() -> StateManager {
        StateManager::new(
            &StateConfig::default(),
            LockContext::new(Duration::from_millis(200), false),
        )
        .expect("state manager")
    }

    #[test]
    fn history_counts_only_successful_transitions() {
        let sm = manager();
        sm.register("capture", ComponentKind::Capture, Some(0))
            .expect("register");

        sm.transition("capture", State::Initializing).expect("init");
        assert!(sm.transition("capture", State::Stopped).is_err());
        sm.transition("capture", State::Initialized).expect("ready");
        sm.transition("capture", State::RUNNING).expect("run");
        assert!(sm.transition("capture", State::Initialized).is_err());

        let history = sm.history("capture").expect("history");
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|e| e.success));
        assert_eq!(sm.get_state("capture").expect("state"), State::RUNNING);
    }

    #[test]
    fn invalid_transition_leaves_state_unchanged() {
        let sm = manager();
        sm.register("storage", ComponentKind::Storage, None)
            .expect("register");
        let err = sm
            .transition("storage", State::RUNNING)
            .err()
            .expect("illegal");
        assert!(matches!(
            err,
            CadenceError::InvalidTransition {
                from: State::Registered,
                ..
            }
        ));
        assert_eq!(sm.get_state("storage").expect("state"), State::Registered);
        assert!(sm.history("storage").expect("history").is_empty());
    }

    #[test]
    fn timed_out_transition_leaves_state_and_history_unchanged() {
        let sm = manager();
        sm.register("capture", ComponentKind::Capture, Some(0))
            .expect("register");
        sm.transition("capture", State::Initializing).expect("init");
        let entry = sm.entry("capture").expect("entry");

        let (sm_ref, entry_ref) = (&sm, &entry);
        let err = std::thread::scope(|s| {
            let (locked_tx, locked_rx) = crossbeam_channel::bounded(0);
            s.spawn(move || {
                let _held = sm_ref.locks.lock(&**entry_ref).expect("held");
                locked_tx.send(()).expect("signal");
                std::thread::sleep(Duration::from_millis(400));
            });
            locked_rx.recv().expect("locked");
            sm_ref
                .transition("capture", State::Initialized)
                .err()
                .expect("timed out")
        });
        assert!(matches!(
            err,
            CadenceError::LockTimeout {
                lock: LockRank::State,
                ..
            }
        ));

        assert_eq!(sm.get_state("capture").expect("state"), State::Initializing);
        let history = sm.history("capture").expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].to, State::Initializing);
        let metrics = sm.metrics().expect("metrics");
        assert_eq!(metrics.transitions, 1);
        assert_eq!(metrics.rejected, 0);
    }

    #[test]
    fn rollback_restores_previous_state_and_pops_history() {
        let sm = manager();
        sm.register("vad", ComponentKind::Processing, Some(1))
            .expect("register");
        sm.transition("vad", State::Initializing).expect("init");
        sm.transition("vad", State::Initialized).expect("ready");

        let event = sm.rollback("vad").expect("rollback").expect("some");
        assert_eq!(event.kind, EventKind::Rollback);
        assert_eq!(event.to, State::Initializing);
        assert_eq!(sm.get_state("vad").expect("state"), State::Initializing);
        assert_eq!(sm.history("vad").expect("history").len(), 1);

        sm.rollback("vad").expect("rollback");
        assert_eq!(sm.get_state("vad").expect("state"), State::Registered);
        assert!(sm.rollback("vad").expect("rollback").is_none());
    }

    #[test]
    fn duplicate_and_unknown_names_are_rejected() {
        let sm = manager();
        sm.register("gui", ComponentKind::Display, None).expect("register");
        assert!(matches!(
            sm.register("gui", ComponentKind::Display, None),
            Err(CadenceError::DuplicateComponent(_))
        ));
        assert!(matches!(
            sm.get_state("missing"),
            Err(CadenceError::ComponentNotRegistered(_))
        ));
    }

    #[test]
    fn callbacks_run_after_commit_and_may_reenter() {
        let sm = Arc::new(manager());
        sm.register("asr", ComponentKind::Transcription, None)
            .expect("register");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let observed_states = Arc::clone(&seen);
        let reentrant = Arc::clone(&sm);
        sm.register_callback(move |event| {
            // Reads the committed state; would deadlock if run under the entry lock.
            let state = reentrant.get_state(&event.component).expect("get_state");
            observed_states.lock().push((event.to, state, event.success));
        })
        .expect("callback");

        sm.transition("asr", State::Initializing).expect("init");
        let _ = sm.transition("asr", State::Stopped);
        assert!(sm.flush(Duration::from_secs(2)));

        let seen = seen.lock().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (State::Initializing, State::Initializing, true));
        assert_eq!(seen[1], (State::Stopped, State::Initializing, false));
    }

    #[test]
    fn panicking_callback_does_not_stop_delivery() {
        let sm = manager();
        sm.register("tx", ComponentKind::Service, None).expect("register");
        let count = Arc::new(AtomicUsize::new(0));
        sm.register_callback(|_| panic!("observer bug")).expect("cb");
        let counter = Arc::clone(&count);
        sm.register_callback(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        })
        .expect("cb");

        sm.transition("tx", State::Initializing).expect("init");
        sm.transition("tx", State::Initialized).expect("ready");
        assert!(sm.flush(Duration::from_secs(2)));
        assert_eq!(count.load(Ordering::Relaxed), 2);
        assert_eq!(sm.metrics().expect("metrics").callback_panics, 2);
    }

    #[test]
    fn subscribers_receive_events() {
        let sm = manager();
        let mut rx = sm.subscribe();
        sm.register("cap", ComponentKind::Capture, Some(0)).expect("register");
        sm.transition("cap", State::Initializing).expect("init");
        assert!(sm.flush(Duration::from_secs(2)));
        let event = rx.try_recv().expect("event");
        assert_eq!(event.component, "cap");
        assert_eq!(event.channel, Some(0));
        assert_eq!(event.to, State::Initializing);
    }

    #[test]
    fn verify_consistency_flags_running_buffer_holder_without_allocations() {
        let sm = manager();
        sm.register("capture", ComponentKind::Capture, Some(0))
            .expect("register");
        sm.register("storage", ComponentKind::Storage, None)
            .expect("register");
        for name in ["capture", "storage"] {
            sm.transition(name, State::Initializing).expect("init");
            sm.transition(name, State::Initialized).expect("ready");
            sm.transition(name, State::RUNNING).expect("run");
        }

        let report = sm.verify_consistency(&FixedResources(0)).expect("verify");
        assert_eq!(report.checked, 2);
        assert_eq!(
            report.violations,
            vec![ConsistencyViolation {
                component: "capture".into(),
                kind: ViolationKind::RunningWithoutResources,
            }]
        );

        let report = sm.verify_consistency(&FixedResources(3)).expect("verify");
        assert!(report.is_consistent());
    }

    #[test]
    fn state_event_serializes_with_camel_case_fields() {
        let sm = manager();
        sm.register("cap", ComponentKind::Capture, Some(2)).expect("register");
        let event = sm.transition("cap", State::Initializing).expect("init");
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["component"], "cap");
        assert_eq!(json["channel"], 2);
        assert_eq!(json["from"]["state"], "registered");
        assert_eq!(json["to"]["state"], "initializing");
        assert_eq!(json["kind"], "transition");
        assert_eq!(json["success"], true);
    }
}
