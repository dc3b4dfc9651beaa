//! `MonitoringManager`: typed metric snapshots, readable without core locks.
//!
//! Producers hand a list of [`Metric`]s to [`MonitoringManager::publish`],
//! which validates each one and swaps a new `Arc<MetricsSnapshot>` into a
//! `tokio::sync::watch` channel. Readers (`latest`, `subscribe`) only touch the
//! channel, never a ranked lock.

pub mod window;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

pub use window::{LatencySummary, LatencyWindow};

use crate::cleanup::{CleanupMetrics, CleanupReport};
use crate::component::ComponentMetrics;
use crate::config::MonitorConfig;
use crate::error::{CadenceError, Result};
use crate::resource::ResourceMetrics;
use crate::state::StateMetrics;
use crate::thread::{LockContext, LockRank, LockStats, RankedMutex, ThreadMetrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricCategory {
    Threads,
    Resources,
    State,
    Components,
    Cleanup,
    Latency,
}

impl fmt::Display for MetricCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricCategory::Threads => "threads",
            MetricCategory::Resources => "resources",
            MetricCategory::State => "state",
            MetricCategory::Components => "components",
            MetricCategory::Cleanup => "cleanup",
            MetricCategory::Latency => "latency",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyMetrics {
    /// Mean lock wait per monitoring interval, in microseconds.
    pub lock_wait_us: LatencySummary,
    pub cleanup_step_ms: LatencySummary,
}

/// One category's payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", content = "value", rename_all = "lowercase")]
pub enum Metric {
    Threads(ThreadMetrics),
    Resources(ResourceMetrics),
    State(StateMetrics),
    Components(ComponentMetrics),
    Cleanup(CleanupMetrics),
    Latency(LatencyMetrics),
}

impl Metric {
    pub fn category(&self) -> MetricCategory {
        match self {
            Metric::Threads(_) => MetricCategory::Threads,
            Metric::Resources(_) => MetricCategory::Resources,
            Metric::State(_) => MetricCategory::State,
            Metric::Components(_) => MetricCategory::Components,
            Metric::Cleanup(_) => MetricCategory::Cleanup,
            Metric::Latency(_) => MetricCategory::Latency,
        }
    }

    /// Reject payloads no producer could legitimately report.
    pub fn validate(&self) -> Result<()> {
        let reject = |reason: String| {
            Err(CadenceError::InvalidMetric {
                category: self.category().to_string(),
                reason,
            })
        };
        match self {
            Metric::Threads(m) => {
                if m.active > m.registered {
                    return reject(format!("{} active of {} registered", m.active, m.registered));
                }
                if !m.mean_lock_wait_us.is_finite() || m.mean_lock_wait_us < 0.0 {
                    return reject("mean lock wait is not a finite positive value".into());
                }
            }
            Metric::Resources(m) => {
                if !(0.0..=1.0).contains(&m.hit_rate) {
                    return reject(format!("hit rate {} outside [0, 1]", m.hit_rate));
                }
                if !(0.0..=1.0).contains(&m.fragmentation) {
                    return reject(format!("fragmentation {} outside [0, 1]", m.fragmentation));
                }
                if let Some(t) = m.tiers.iter().find(|t| t.live > t.capacity) {
                    return reject(format!("{} tier live {} above capacity {}", t.tier, t.live, t.capacity));
                }
            }
            Metric::State(m) => {
                if m.running + m.in_transition + m.errored > m.components {
                    return reject("state buckets exceed component count".into());
                }
            }
            Metric::Components(m) => {
                if m.healthy + m.degraded + m.failed > m.registered {
                    return reject("health buckets exceed registered count".into());
                }
            }
            Metric::Cleanup(m) => {
                if m.last_elapsed_ms.is_some_and(|ms| !ms.is_finite() || ms < 0.0) {
                    return reject("elapsed time is not a finite positive value".into());
                }
            }
            Metric::Latency(m) => {
                for s in [m.lock_wait_us, m.cleanup_step_ms] {
                    if s.p50 > s.p95 || s.p95 > s.p99 || s.p99 > s.max {
                        return reject("percentiles are not monotonic".into());
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Zero for the empty snapshot present before the first publish.
    pub seq: u64,
    pub taken_at: Option<DateTime<Utc>>,
    pub metrics: BTreeMap<MetricCategory, Metric>,
}

impl MetricsSnapshot {
    pub fn get(&self, category: MetricCategory) -> Option<&Metric> {
        self.metrics.get(&category)
    }

    pub fn threads(&self) -> Option<&ThreadMetrics> {
        match self.get(MetricCategory::Threads) {
            Some(Metric::Threads(m)) => Some(m),
            _ => None,
        }
    }

    pub fn resources(&self) -> Option<&ResourceMetrics> {
        match self.get(MetricCategory::Resources) {
            Some(Metric::Resources(m)) => Some(m),
            _ => None,
        }
    }

    pub fn state(&self) -> Option<&StateMetrics> {
        match self.get(MetricCategory::State) {
            Some(Metric::State(m)) => Some(m),
            _ => None,
        }
    }

    pub fn components(&self) -> Option<&ComponentMetrics> {
        match self.get(MetricCategory::Components) {
            Some(Metric::Components(m)) => Some(m),
            _ => None,
        }
    }

    pub fn cleanup(&self) -> Option<&CleanupMetrics> {
        match self.get(MetricCategory::Cleanup) {
            Some(Metric::Cleanup(m)) => Some(m),
            _ => None,
        }
    }

    pub fn latency(&self) -> Option<&LatencyMetrics> {
        match self.get(MetricCategory::Latency) {
            Some(Metric::Latency(m)) => Some(m),
            _ => None,
        }
    }
}

struct Windows {
    lock_wait_us: LatencyWindow,
    cleanup_step_ms: LatencyWindow,
    /// (acquisitions, total wait) at the previous lock sample.
    last_lock: (u64, u64),
}

pub struct MonitoringManager {
    locks: LockContext,
    windows: RankedMutex<Windows>,
    tx: watch::Sender<Arc<MetricsSnapshot>>,
    seq: AtomicU64,
    rejected: AtomicU64,
}

impl MonitoringManager {
    pub fn new(config: &MonitorConfig, locks: LockContext) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(MetricsSnapshot::default()));
        Self {
            locks,
            windows: RankedMutex::new(
                LockRank::Metrics,
                Windows {
                    lock_wait_us: LatencyWindow::new(config.latency_window),
                    cleanup_step_ms: LatencyWindow::new(config.latency_window),
                    last_lock: (0, 0),
                },
            ),
            tx,
            seq: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Most recent snapshot. Never blocks on a core lock.
    pub fn latest(&self) -> Arc<MetricsSnapshot> {
        Arc::clone(&self.tx.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<MetricsSnapshot>> {
        self.tx.subscribe()
    }

    /// Validate `metrics` and publish them as the next snapshot. Invalid
    /// entries are dropped and counted; the first rejection is returned after
    /// the valid ones were published.
    pub fn publish(&self, metrics: Vec<Metric>) -> Result<Arc<MetricsSnapshot>> {
        let mut first_error = None;
        let mut map = BTreeMap::new();
        for metric in metrics {
            match metric.validate() {
                Ok(()) => {
                    map.insert(metric.category(), metric);
                }
                Err(e) => {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    warn!("{e}");
                    first_error.get_or_insert(e);
                }
            }
        }

        let snapshot = Arc::new(MetricsSnapshot {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            taken_at: Some(Utc::now()),
            metrics: map,
        });
        self.tx.send_replace(Arc::clone(&snapshot));
        debug!(seq = snapshot.seq, categories = snapshot.metrics.len(), "metrics published");

        match first_error {
            Some(e) => Err(e),
            None => Ok(snapshot),
        }
    }

    /// Fold lock waits since the previous call into the lock-wait window.
    pub fn sample_lock_waits(&self, stats: &LockStats) -> Result<()> {
        let acquisitions = stats.acquisitions.load(Ordering::Relaxed);
        let total = stats.total_wait_us.load(Ordering::Relaxed);
        let mut windows = self.locks.lock(&self.windows)?;
        let (prev_acq, prev_total) = windows.last_lock;
        if acquisitions > prev_acq {
            let mean = total.saturating_sub(prev_total) as f64 / (acquisitions - prev_acq) as f64;
            windows.lock_wait_us.record(mean);
        }
        windows.last_lock = (acquisitions, total);
        Ok(())
    }

    pub fn record_cleanup(&self, report: &CleanupReport) -> Result<()> {
        let mut windows = self.locks.lock(&self.windows)?;
        for ms in report.step_durations() {
            windows.cleanup_step_ms.record(ms);
        }
        Ok(())
    }

    pub fn latency(&self) -> Result<LatencyMetrics> {
        let windows = self.locks.lock(&self.windows)?;
        Ok(LatencyMetrics {
            lock_wait_us: windows.lock_wait_us.summary(),
            cleanup_step_ms: windows.cleanup_step_ms.summary(),
        })
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn monitor() -> MonitoringManager {
        MonitoringManager::new(
            &MonitorConfig::default(),
            LockContext::new(Duration::from_millis(200), false),
        )
    }

    fn components(healthy: usize) -> Metric {
        Metric::Components(ComponentMetrics {
            registered: 2,
            healthy,
            degraded: 0,
            failed: 0,
            overall: Default::default(),
        })
    }

    #[test]
    fn publish_replaces_latest_and_notifies_subscribers() {
        let m = monitor();
        let mut rx = m.subscribe();
        assert_eq!(m.latest().seq, 0);

        m.publish(vec![components(2)]).expect("publish");
        assert!(rx.has_changed().expect("open"));
        let latest = m.latest();
        assert_eq!(latest.seq, 1);
        assert_eq!(latest.components().map(|c| c.healthy), Some(2));
        assert!(latest.resources().is_none());
    }

    #[test]
    fn invalid_metric_is_dropped_but_valid_ones_publish() {
        let m = monitor();
        let err = m
            .publish(vec![components(5), Metric::Latency(LatencyMetrics::default())])
            .err()
            .expect("invalid");
        assert!(matches!(err, CadenceError::InvalidMetric { ref category, .. } if category == "components"));
        let latest = m.latest();
        assert!(latest.components().is_none());
        assert!(latest.latency().is_some());
        assert_eq!(m.rejected(), 1);
    }

    #[test]
    fn metric_serializes_as_tagged_payload() {
        let json = serde_json::to_value(components(1)).expect("json");
        assert_eq!(json["category"], "components");
        assert_eq!(json["value"]["registered"], 2);
    }

    #[test]
    fn lock_waits_are_sampled_per_interval() {
        let m = monitor();
        let stats = LockStats::default();
        stats.acquisitions.store(4, Ordering::Relaxed);
        stats.total_wait_us.store(400, Ordering::Relaxed);
        m.sample_lock_waits(&stats).expect("sample");
        stats.acquisitions.store(6, Ordering::Relaxed);
        stats.total_wait_us.store(1_000, Ordering::Relaxed);
        m.sample_lock_waits(&stats).expect("sample");
        // No new acquisitions: nothing recorded.
        m.sample_lock_waits(&stats).expect("sample");

        let latency = m.latency().expect("latency");
        assert_eq!(latency.lock_wait_us.count, 2);
        approx::assert_relative_eq!(latency.lock_wait_us.max, 300.0);
        approx::assert_relative_eq!(latency.lock_wait_us.mean, 200.0);
    }
}
