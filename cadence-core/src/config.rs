//! Runtime configuration.
//!
//! Every section deserializes with `#[serde(default)]`, so a partial JSON
//! document only overrides the fields it names. Call [`RuntimeConfig::normalize`]
//! after loading to clamp values into ranges the coordinators accept.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for [`crate::Runtime`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct RuntimeConfig {
    pub threads: ThreadConfig,
    pub resources: ResourceConfig,
    pub state: StateConfig,
    pub cleanup: CleanupConfig,
    pub monitor: MonitorConfig,
}

impl RuntimeConfig {
    pub fn normalize(&mut self) {
        self.threads.normalize();
        self.resources.normalize();
        self.state.normalize();
        self.cleanup.normalize();
        self.monitor.normalize();
    }
}

// ---------------------------------------------------------------------------
// Threads and locks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct ThreadConfig {
    /// Upper bound on registered workers (spawned + external). Default: 20.
    pub max_workers: usize,
    /// A worker silent for longer than this is flagged as failed. Default: 5000.
    pub heartbeat_timeout_ms: u64,
    /// Default wait for ranked lock acquisition. Default: 500.
    pub lock_timeout_ms: u64,
    /// Panic on a lock-order violation instead of returning the error.
    /// Default: on in debug builds, off in release builds.
    pub fail_fast_on_order_violation: bool,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            max_workers: 20,
            heartbeat_timeout_ms: 5_000,
            lock_timeout_ms: 500,
            fail_fast_on_order_violation: cfg!(debug_assertions),
        }
    }
}

impl ThreadConfig {
    pub fn normalize(&mut self) {
        self.max_workers = self.max_workers.clamp(1, 1_024);
        self.heartbeat_timeout_ms = self.heartbeat_timeout_ms.clamp(50, 600_000);
        self.lock_timeout_ms = self.lock_timeout_ms.clamp(1, 60_000);
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

/// Size ceiling and slot count for one pooled tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierConfig {
    pub ceiling: usize,
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct ResourceConfig {
    pub small: TierConfig,
    pub medium: TierConfig,
    pub large: TierConfig,
    /// Live overflow handles allowed per channel partition. Default: 1024.
    pub max_overflow: usize,
    /// How long an allocation waits for a full tier before overflowing. Default: 0.
    pub pool_wait_ms: u64,
    /// Materialize every pooled slot up front. Default: false.
    pub prewarm: bool,
    /// Per-owner byte cap applied when no explicit limit was set.
    pub default_owner_max_bytes: Option<usize>,
    /// Per-channel byte cap.
    pub channel_max_bytes: Option<usize>,
    /// Live byte budget used to derive memory pressure. Default: 256 MiB.
    pub memory_budget_bytes: usize,
    pub policy: BufferPolicyConfig,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            small: TierConfig {
                ceiling: 4 * 1024,
                capacity: 1_000,
            },
            medium: TierConfig {
                ceiling: 64 * 1024,
                capacity: 500,
            },
            large: TierConfig {
                ceiling: 1024 * 1024,
                capacity: 125,
            },
            max_overflow: 1_024,
            pool_wait_ms: 0,
            prewarm: false,
            default_owner_max_bytes: None,
            channel_max_bytes: None,
            memory_budget_bytes: 256 * 1024 * 1024,
            policy: BufferPolicyConfig::default(),
        }
    }
}

impl ResourceConfig {
    pub fn normalize(&mut self) {
        self.small.ceiling = self.small.ceiling.max(1);
        self.medium.ceiling = self.medium.ceiling.max(self.small.ceiling + 1);
        self.large.ceiling = self.large.ceiling.max(self.medium.ceiling + 1);
        self.pool_wait_ms = self.pool_wait_ms.min(10_000);
        self.memory_budget_bytes = self.memory_budget_bytes.max(1024 * 1024);
        self.policy.normalize();
    }

    pub fn pool_wait(&self) -> Duration {
        Duration::from_millis(self.pool_wait_ms)
    }
}

/// Adaptive target buffer size policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct BufferPolicyConfig {
    pub initial_target: usize,
    pub min_target: usize,
    pub max_target: usize,
    /// Memory usage ratio in [0, 1] considered high. Default: 0.85.
    pub memory_high_water: f32,
    /// CPU usage ratio in [0, 1] considered high. Default: 0.80.
    pub cpu_high_water: f32,
    /// Consecutive high ticks before a policy fires. Default: 3.
    pub sustain_ticks: u32,
}

impl Default for BufferPolicyConfig {
    fn default() -> Self {
        Self {
            initial_target: 16 * 1024,
            min_target: 1024,
            max_target: 1024 * 1024,
            memory_high_water: 0.85,
            cpu_high_water: 0.80,
            sustain_ticks: 3,
        }
    }
}

impl BufferPolicyConfig {
    pub fn normalize(&mut self) {
        self.min_target = self.min_target.max(1);
        self.max_target = self.max_target.max(self.min_target);
        self.initial_target = self.initial_target.clamp(self.min_target, self.max_target);
        self.memory_high_water = self.memory_high_water.clamp(0.05, 1.0);
        self.cpu_high_water = self.cpu_high_water.clamp(0.05, 1.0);
        self.sustain_ticks = self.sustain_ticks.clamp(1, 1_000);
    }
}

// ---------------------------------------------------------------------------
// State, cleanup, monitor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct StateConfig {
    /// Capacity of the broadcast channel feeding `subscribe()`. Default: 256.
    pub broadcast_capacity: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
        }
    }
}

impl StateConfig {
    pub fn normalize(&mut self) {
        self.broadcast_capacity = self.broadcast_capacity.clamp(1, 65_536);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct CleanupConfig {
    /// Deadline applied to steps registered without their own. Default: 5000.
    pub step_timeout_ms: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: 5_000,
        }
    }
}

impl CleanupConfig {
    pub fn normalize(&mut self) {
        self.step_timeout_ms = self.step_timeout_ms.clamp(1, 600_000);
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct MonitorConfig {
    /// Background tick interval. Default: 1000.
    pub interval_ms: u64,
    /// Samples kept per latency window. Default: 512.
    pub latency_window: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            latency_window: 512,
        }
    }
}

impl MonitorConfig {
    pub fn normalize(&mut self) {
        self.interval_ms = self.interval_ms.clamp(10, 3_600_000);
        self.latency_window = self.latency_window.clamp(8, 65_536);
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_overrides_only_named_fields() {
        let raw = r#"{ "threads": { "maxWorkers": 4 }, "resources": { "small": { "ceiling": 2048, "capacity": 500 } } }"#;
        let cfg: RuntimeConfig = serde_json::from_str(raw).expect("parse config");
        assert_eq!(cfg.threads.max_workers, 4);
        assert_eq!(cfg.threads.lock_timeout_ms, 500);
        assert_eq!(cfg.resources.small.capacity, 500);
        assert_eq!(cfg.resources.medium.capacity, 500);
        assert_eq!(cfg.resources.large.ceiling, 1024 * 1024);
    }

    #[test]
    fn normalize_keeps_tier_ceilings_strictly_increasing() {
        let mut cfg = RuntimeConfig::default();
        cfg.resources.medium.ceiling = 10;
        cfg.resources.large.ceiling = 0;
        cfg.normalize();
        assert!(cfg.resources.small.ceiling < cfg.resources.medium.ceiling);
        assert!(cfg.resources.medium.ceiling < cfg.resources.large.ceiling);
    }

    #[test]
    fn normalize_clamps_policy_target_into_bounds() {
        let mut policy = BufferPolicyConfig {
            initial_target: 10,
            min_target: 512,
            max_target: 100,
            ..BufferPolicyConfig::default()
        };
        policy.normalize();
        assert_eq!(policy.max_target, 512);
        assert_eq!(policy.initial_target, 512);
    }
}
