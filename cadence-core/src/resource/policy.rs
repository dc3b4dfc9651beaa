//! Adaptive target buffer size.
//!
//! The policy never reshapes pools; it only moves the size collaborators are
//! advised to request. Sustained memory pressure shrinks the target to 75%,
//! sustained CPU pressure grows it to 150%. When both are sustained on the
//! same tick, memory wins.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::config::BufferPolicyConfig;

/// Utilization ratios in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PressureSample {
    pub memory: f32,
    pub cpu: f32,
}

/// Source of pressure readings for the policy tick.
pub trait PressureProbe: Send + Sync {
    fn sample(&self) -> PressureSample;
}

/// Host-wide CPU utilization. Usage is measured between consecutive
/// samples, so the first reading after construction is zero.
pub struct CpuSampler {
    system: Mutex<System>,
}

impl CpuSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        Self {
            system: Mutex::new(system),
        }
    }

    /// Utilization in `[0, 1]` since the previous call.
    pub fn sample(&self) -> f32 {
        let mut system = self.system.lock();
        system.refresh_cpu();
        (system.global_cpu_info().cpu_usage() / 100.0).clamp(0.0, 1.0)
    }
}

impl Default for CpuSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "camelCase")]
pub enum PolicyDecision {
    Hold { target: usize },
    Shrink { from: usize, to: usize },
    Grow { from: usize, to: usize },
}

impl PolicyDecision {
    pub fn target(self) -> usize {
        match self {
            PolicyDecision::Hold { target } => target,
            PolicyDecision::Shrink { to, .. } | PolicyDecision::Grow { to, .. } => to,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferSizePolicy {
    config: BufferPolicyConfig,
    target: usize,
    memory_streak: u32,
    cpu_streak: u32,
}

impl BufferSizePolicy {
    pub fn new(config: BufferPolicyConfig) -> Self {
        let target = config
            .initial_target
            .clamp(config.min_target, config.max_target);
        Self {
            config,
            target,
            memory_streak: 0,
            cpu_streak: 0,
        }
    }

    pub fn target(&self) -> usize {
        self.target
    }

    /// Feed one sample. Streaks reset when a policy fires or pressure drops.
    pub fn observe(&mut self, sample: PressureSample) -> PolicyDecision {
        self.memory_streak = if sample.memory >= self.config.memory_high_water {
            self.memory_streak.saturating_add(1)
        } else {
            0
        };
        self.cpu_streak = if sample.cpu >= self.config.cpu_high_water {
            self.cpu_streak.saturating_add(1)
        } else {
            0
        };

        let from = self.target;
        if self.memory_streak >= self.config.sustain_ticks {
            self.memory_streak = 0;
            self.cpu_streak = 0;
            self.target = (from * 3 / 4).max(self.config.min_target);
            return if self.target == from {
                PolicyDecision::Hold { target: from }
            } else {
                PolicyDecision::Shrink {
                    from,
                    to: self.target,
                }
            };
        }
        if self.cpu_streak >= self.config.sustain_ticks {
            self.cpu_streak = 0;
            self.target = (from.saturating_mul(3) / 2).min(self.config.max_target);
            return if self.target == from {
                PolicyDecision::Hold { target: from }
            } else {
                PolicyDecision::Grow {
                    from,
                    to: self.target,
                }
            };
        }
        PolicyDecision::Hold { target: from }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BufferSizePolicy {
        BufferSizePolicy::new(BufferPolicyConfig {
            initial_target: 16_000,
            min_target: 1_000,
            max_target: 30_000,
            memory_high_water: 0.85,
            cpu_high_water: 0.80,
            sustain_ticks: 3,
        })
    }

    const MEM: PressureSample = PressureSample {
        memory: 0.9,
        cpu: 0.1,
    };
    const CPU: PressureSample = PressureSample {
        memory: 0.1,
        cpu: 0.9,
    };
    const BOTH: PressureSample = PressureSample {
        memory: 0.9,
        cpu: 0.9,
    };

    #[test]
    fn sustained_memory_pressure_shrinks_to_three_quarters() {
        let mut p = policy();
        assert_eq!(p.observe(MEM), PolicyDecision::Hold { target: 16_000 });
        assert_eq!(p.observe(MEM), PolicyDecision::Hold { target: 16_000 });
        assert_eq!(
            p.observe(MEM),
            PolicyDecision::Shrink {
                from: 16_000,
                to: 12_000
            }
        );
    }

    #[test]
    fn a_calm_tick_resets_the_streak() {
        let mut p = policy();
        p.observe(CPU);
        p.observe(CPU);
        p.observe(PressureSample::default());
        p.observe(CPU);
        assert_eq!(p.observe(CPU), PolicyDecision::Hold { target: 16_000 });
        assert_eq!(
            p.observe(CPU),
            PolicyDecision::Grow {
                from: 16_000,
                to: 24_000
            }
        );
    }

    #[test]
    fn memory_wins_when_both_fire() {
        let mut p = policy();
        p.observe(BOTH);
        p.observe(BOTH);
        assert!(matches!(p.observe(BOTH), PolicyDecision::Shrink { .. }));
        assert_eq!(p.target(), 12_000);
    }

    #[test]
    fn growth_is_bounded_by_max_target() {
        let mut p = policy();
        for _ in 0..3 {
            p.observe(CPU);
        }
        for _ in 0..3 {
            p.observe(CPU);
        }
        assert_eq!(p.target(), 30_000);
    }
}
