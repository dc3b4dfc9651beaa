//! Component states and the static transition table.
//!
//! ```text
//! Registered ─► Initializing ─► Initialized ─► Running(Active|Idle|Paused) ─► Stopping ─► Stopped
//!                    │                │                 │                       │           │
//!                    └────► Error ◄───┼─────────────────┘◄──────────────────────┘           │
//!                             │       └──────────────► Stopping                             │
//!                             ├─► Initializing (recovery)                                   │
//!                             └─► Stopping                   Initializing ◄─────────────────┘
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Channel-level activity nested under `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activity {
    /// Processing data for its channel.
    Active,
    /// Running but starved of input.
    Idle,
    /// Deliberately suspended by a collaborator.
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "activity", rename_all = "lowercase")]
pub enum State {
    Registered,
    Initializing,
    Initialized,
    Running(Activity),
    Error,
    Stopping,
    Stopped,
}

impl State {
    pub const RUNNING: State = State::Running(Activity::Active);

    /// `Initializing` and `Stopping` are only legal as short-lived states.
    pub fn is_transitional(self) -> bool {
        matches!(self, State::Initializing | State::Stopping)
    }

    pub fn is_running(self) -> bool {
        matches!(self, State::Running(_))
    }

    /// States from which `shutdown_all` must drive the component to `Stopped`.
    pub fn needs_shutdown(self) -> bool {
        matches!(self, State::Initialized | State::Running(_) | State::Error)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Registered => f.write_str("registered"),
            State::Initializing => f.write_str("initializing"),
            State::Initialized => f.write_str("initialized"),
            State::Running(Activity::Active) => f.write_str("running(active)"),
            State::Running(Activity::Idle) => f.write_str("running(idle)"),
            State::Running(Activity::Paused) => f.write_str("running(paused)"),
            State::Error => f.write_str("error"),
            State::Stopping => f.write_str("stopping"),
            State::Stopped => f.write_str("stopped"),
        }
    }
}

use Activity::{Active, Idle, Paused};
use State::*;

/// Every legal `(from, to)` edge.
pub const TRANSITIONS: &[(State, State)] = &[
    (Registered, Initializing),
    (Initializing, Initialized),
    (Initializing, Error),
    (Initialized, Running(Active)),
    (Initialized, Running(Idle)),
    (Initialized, Stopping),
    (Running(Active), Running(Idle)),
    (Running(Active), Running(Paused)),
    (Running(Idle), Running(Active)),
    (Running(Idle), Running(Paused)),
    (Running(Paused), Running(Active)),
    (Running(Paused), Running(Idle)),
    (Running(Active), Error),
    (Running(Idle), Error),
    (Running(Paused), Error),
    (Running(Active), Stopping),
    (Running(Idle), Stopping),
    (Running(Paused), Stopping),
    (Error, Initializing),
    (Error, Stopping),
    (Stopping, Stopped),
    (Stopping, Error),
    (Stopped, Initializing),
];

pub fn is_legal(from: State, to: State) -> bool {
    TRANSITIONS.iter().any(|&(f, t)| f == from && t == to)
}

pub fn successors(from: State) -> impl Iterator<Item = State> {
    TRANSITIONS
        .iter()
        .filter(move |(f, _)| *f == from)
        .map(|(_, t)| *t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_path_is_legal() {
        let path = [
            Registered,
            Initializing,
            Initialized,
            Running(Active),
            Running(Paused),
            Stopping,
            Stopped,
        ];
        for pair in path.windows(2) {
            assert!(is_legal(pair[0], pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn skipping_states_is_illegal() {
        assert!(!is_legal(Registered, Running(Active)));
        assert!(!is_legal(Running(Active), Stopped));
        assert!(!is_legal(Stopped, Running(Active)));
        assert!(!is_legal(Running(Idle), Running(Idle)));
    }

    #[test]
    fn every_state_except_none_has_a_successor() {
        for state in [
            Registered,
            Initializing,
            Initialized,
            Running(Active),
            Running(Idle),
            Running(Paused),
            Error,
            Stopping,
            Stopped,
        ] {
            assert!(successors(state).next().is_some(), "{state} is a dead end");
        }
    }

    #[test]
    fn running_serializes_with_nested_activity() {
        let json = serde_json::to_value(Running(Paused)).expect("serialize");
        assert_eq!(json["state"], "running");
        assert_eq!(json["activity"], "paused");
        let json = serde_json::to_value(Stopping).expect("serialize");
        assert_eq!(json["state"], "stopping");
    }
}
