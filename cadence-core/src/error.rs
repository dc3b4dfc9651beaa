use std::time::Duration;

use thiserror::Error;

use crate::state::State;
use crate::thread::LockRank;

/// All errors produced by cadence-core.
///
/// Every variant is recoverable by the caller. The core never terminates the
/// process; retry and backoff policy belongs to whoever called in.
#[derive(Debug, Error)]
pub enum CadenceError {
    #[error("invalid transition for {component}: {from} -> {to}")]
    InvalidTransition {
        component: String,
        from: State,
        to: State,
    },

    #[error("lock order violation: requested {requested} while holding {held}")]
    LockOrderViolation { requested: LockRank, held: LockRank },

    #[error("timed out after {waited:?} waiting for {lock} lock")]
    LockTimeout { lock: LockRank, waited: Duration },

    #[error("resource exhausted for {owner}: {reason}")]
    ResourceExhausted { owner: String, reason: String },

    #[error("resource handle {id} is not live in this manager")]
    UnknownHandle { id: u64 },

    #[error("circular dependency: {}", cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },

    #[error("cleanup step {step} failed: {reason}")]
    CleanupStepFailed { step: String, reason: String },

    #[error("component not registered: {0}")]
    ComponentNotRegistered(String),

    #[error("component already registered: {0}")]
    DuplicateComponent(String),

    #[error("cleanup task already registered: {0}")]
    DuplicateCleanupTask(String),

    #[error("component {component} failed: {reason}")]
    ComponentFailed { component: String, reason: String },

    #[error("worker limit reached ({max} workers)")]
    WorkerLimitReached { max: usize },

    #[error("a lifecycle operation is already in progress")]
    LifecycleInProgress,

    #[error("a cleanup run is already in progress")]
    CleanupInProgress,

    #[error("metric {category} rejected: {reason}")]
    InvalidMetric { category: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CadenceError {
    /// `true` for the two lock-layer failures callers usually retry with backoff.
    pub fn is_lock_failure(&self) -> bool {
        matches!(
            self,
            CadenceError::LockOrderViolation { .. } | CadenceError::LockTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CadenceError>;
