//! Cleanup run results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CadenceError;
use crate::ChannelId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub name: String,
    pub duration_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepFailure {
    pub name: String,
    pub reason: String,
    pub duration_ms: f64,
    pub timed_out: bool,
}

impl StepFailure {
    pub fn to_error(&self) -> CadenceError {
        CadenceError::CleanupStepFailed {
            step: self.name.clone(),
            reason: self.reason.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedStep {
    pub name: String,
    /// The failed, rolled-back or blocked dependency that stopped this step.
    pub blocked_by: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PostCheck {
    /// No resource handle is still live.
    ResourcesReleased,
    /// Active worker count is back at the recorded baseline.
    ThreadsAtBaseline,
    /// No component is left in `Initializing` or `Stopping`.
    NoComponentInTransition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub check: PostCheck,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    /// Set for channel-scoped runs.
    pub channel: Option<ChannelId>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: f64,
    /// Steps considered by this run, in execution order.
    pub order: Vec<String>,
    pub succeeded: Vec<StepRecord>,
    pub failed: Vec<StepFailure>,
    pub rolled_back: Vec<StepRecord>,
    pub rollback_failures: Vec<StepFailure>,
    pub blocked: Vec<BlockedStep>,
    pub checks: Vec<CheckResult>,
}

impl CleanupReport {
    pub(crate) fn new(channel: Option<ChannelId>, order: Vec<String>) -> Self {
        Self {
            channel,
            started_at: Utc::now(),
            elapsed_ms: 0.0,
            order,
            succeeded: Vec::new(),
            failed: Vec::new(),
            rolled_back: Vec::new(),
            rollback_failures: Vec::new(),
            blocked: Vec::new(),
            checks: Vec::new(),
        }
    }

    pub fn checks_passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    /// Every step succeeded and every post-condition holds.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
            && self.blocked.is_empty()
            && self.rollback_failures.is_empty()
            && self.checks_passed()
    }

    /// The first failed step as a `CleanupStepFailed` error.
    pub fn first_error(&self) -> Option<CadenceError> {
        self.failed.first().map(StepFailure::to_error)
    }

    pub fn step_durations(&self) -> impl Iterator<Item = f64> + '_ {
        self.succeeded
            .iter()
            .map(|s| s.duration_ms)
            .chain(self.failed.iter().map(|f| f.duration_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_check_fails_the_run() {
        let mut report = CleanupReport::new(None, vec!["a".into()]);
        report.succeeded.push(StepRecord {
            name: "a".into(),
            duration_ms: 1.0,
        });
        report.checks.push(CheckResult {
            check: PostCheck::ResourcesReleased,
            passed: true,
            detail: "0 live".into(),
        });
        assert!(report.is_success());

        report.checks.push(CheckResult {
            check: PostCheck::ThreadsAtBaseline,
            passed: false,
            detail: "3 active, baseline 1".into(),
        });
        assert!(!report.is_success());
    }

    #[test]
    fn first_failure_surfaces_as_step_error() {
        let mut report = CleanupReport::new(None, vec!["flush".into(), "close".into()]);
        assert!(report.first_error().is_none());
        report.failed.push(StepFailure {
            name: "flush".into(),
            reason: "disk gone".into(),
            duration_ms: 2.0,
            timed_out: false,
        });
        let err = report.first_error().expect("error");
        assert!(matches!(
            err,
            CadenceError::CleanupStepFailed { ref step, ref reason }
                if step == "flush" && reason == "disk gone"
        ));
        assert_eq!(err.to_string(), "cleanup step flush failed: disk gone");
    }

    #[test]
    fn report_serializes_in_camel_case() {
        let mut report = CleanupReport::new(Some(1), vec!["flush".into()]);
        report.blocked.push(BlockedStep {
            name: "close".into(),
            blocked_by: "flush".into(),
        });
        let json = serde_json::to_value(&report).expect("json");
        assert_eq!(json["blocked"][0]["blockedBy"], "flush");
        assert_eq!(json["channel"], 1);
        assert!(json.get("rolledBack").is_some());
    }
}
