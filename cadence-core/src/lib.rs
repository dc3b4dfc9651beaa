//! # cadence-core
//!
//! Coordination runtime for pipelines of concurrently running components
//! (capture, signal processing, transcription, storage, display).
//!
//! ## Architecture
//!
//! ```text
//!                 Runtime (one explicit context, no globals)
//!                        │
//!   ThreadManager ─ ranked locks, workers, heartbeats
//!   ResourceManager ─ tiered per-channel pools, caps, adaptive target size
//!   StateManager ─ transition table, history, rollback ─► dispatcher thread ─► callbacks / broadcast
//!   ComponentManager ─ dependency-ordered init/shutdown, health
//!   CleanupCoordinator ─ ordered teardown, rollback, post-condition checks
//!   MonitoringManager ─ typed snapshots over a watch channel
//! ```
//!
//! Every coordinator-internal lock carries a [`LockRank`]. A thread may only
//! acquire locks in strictly increasing rank; anything else is rejected before
//! it can wait. User code (component hooks, callbacks, cleanup actions) never
//! runs under a ranked lock.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod capability;
pub mod cleanup;
pub mod component;
pub mod config;
pub mod error;
pub mod monitor;
pub mod resource;
pub mod runtime;
pub mod state;
pub mod thread;

/// Identifies an isolated partition of resources and state (one audio channel).
pub type ChannelId = u32;

// Convenience re-exports for downstream crates
pub use capability::{Coordination, ResourceSource, StateControl, StateSource, ThreadSource};
pub use cleanup::{CleanupCoordinator, CleanupHandle, CleanupReport, CleanupTask};
pub use component::{Component, ComponentKind, ComponentManager, HealthReport, HealthStatus};
pub use config::RuntimeConfig;
pub use error::{CadenceError, Result};
pub use monitor::{Metric, MetricCategory, MetricsSnapshot, MonitoringManager};
pub use resource::{ResourceHandle, ResourceKind, ResourceManager, Tier};
pub use runtime::Runtime;
pub use state::{Activity, State, StateEvent, StateManager};
pub use thread::{LockContext, LockRank, ThreadManager, WorkerContext, WorkerId};
