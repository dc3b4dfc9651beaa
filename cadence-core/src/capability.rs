//! Narrow capability traits between coordinators.
//!
//! Coordinators never hold references to each other. An operation that needs
//! another coordinator's view takes one of these traits as a parameter, and the
//! composed [`crate::Runtime`] passes itself. Tests pass small fakes.

use crate::error::Result;
use crate::state::{State, StateEvent};

/// Read access to component states.
pub trait StateSource {
    fn state_of(&self, component: &str) -> Result<State>;

    /// Components currently in `Initializing` or `Stopping`.
    fn components_in_transition(&self) -> Result<Vec<String>>;
}

/// State mutation used by lifecycle drivers.
pub trait StateControl: StateSource {
    fn transition(&self, component: &str, target: State) -> Result<StateEvent>;
}

/// Read access to live resource accounting.
pub trait ResourceSource {
    /// Live handles owned by `owner`, across every channel partition.
    fn live_allocations_for(&self, owner: &str) -> Result<usize>;

    /// Live handles across all owners.
    fn live_allocations(&self) -> Result<usize>;
}

/// Read access to worker liveness.
pub trait ThreadSource {
    /// Names of failed workers registered under `owner`.
    fn failed_workers_for(&self, owner: &str) -> Result<Vec<String>>;

    fn active_threads(&self) -> Result<usize>;

    fn baseline_threads(&self) -> usize;
}

/// Everything the lifecycle and cleanup drivers need from the rest of the core.
pub trait Coordination: StateControl + ResourceSource + ThreadSource {}

impl<T: StateControl + ResourceSource + ThreadSource> Coordination for T {}
