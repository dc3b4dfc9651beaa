//! Aggregate health model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ordered from best to worst so `max()` yields the aggregate.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    /// Why the status is not `Healthy`; empty otherwise.
    pub reasons: Vec<String>,
}

impl ComponentHealth {
    pub fn healthy(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: HealthStatus::Healthy,
            reasons: Vec::new(),
        }
    }

    /// Lower the status to at least `status`, recording `reason`.
    pub fn degrade(&mut self, status: HealthStatus, reason: impl Into<String>) {
        self.status = self.status.max(status);
        self.reasons.push(reason.into());
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub overall: HealthStatus,
    pub components: Vec<ComponentHealth>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn from_components(components: Vec<ComponentHealth>) -> Self {
        let overall = components
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or_default();
        Self {
            overall,
            components,
            checked_at: Utc::now(),
        }
    }

    pub fn status_of(&self, name: &str) -> Option<HealthStatus> {
        self.components
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degrade_never_improves_status() {
        let mut h = ComponentHealth::healthy("capture");
        h.degrade(HealthStatus::Failed, "worker died");
        h.degrade(HealthStatus::Degraded, "no buffers");
        assert_eq!(h.status, HealthStatus::Failed);
        assert_eq!(h.reasons.len(), 2);
    }

    #[test]
    fn overall_is_worst_component() {
        let mut degraded = ComponentHealth::healthy("asr");
        degraded.degrade(HealthStatus::Degraded, "slow");
        let report =
            HealthReport::from_components(vec![ComponentHealth::healthy("capture"), degraded]);
        assert_eq!(report.overall, HealthStatus::Degraded);
        assert_eq!(report.status_of("capture"), Some(HealthStatus::Healthy));
        assert_eq!(
            HealthReport::from_components(Vec::new()).overall,
            HealthStatus::Healthy
        );
    }
}
