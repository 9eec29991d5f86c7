//! Performance and diagnostics collection.
//!
//! The [`PerformanceCollector`] is a passive sink: the processor reports task latency,
//! queue depth and backpressure, the degradation coordinator reports service
//! transitions. Nothing reads it to make decisions; it exists for dashboards and
//! operators.
//!
//! ```rust
//! use sentinelq::diagnostics::{AlertSeverity, PerformanceCollector};
//! use std::time::Duration;
//!
//! let collector = PerformanceCollector::new();
//! collector.record_latency("scam_check", Duration::from_millis(420));
//! collector.set_queue_depth(12);
//! collector.raise_alert(AlertSeverity::Warning, "processor", "backpressure");
//!
//! let snapshot = collector.snapshot();
//! assert_eq!(snapshot.queue_depth, 12);
//! assert_eq!(snapshot.alerts.len(), 1);
//! ```

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant, SystemTime};

/// Latency samples kept per operation
pub const DEFAULT_MAX_SAMPLES: usize = 1000;

/// Alerts kept in the log
pub const DEFAULT_MAX_ALERTS: usize = 100;

/// How urgent an alert is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// One entry in the alert log
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    /// Component that raised it
    pub source: String,
    pub message: String,
    pub raised_at: SystemTime,
}

/// Latency statistics for one operation, in milliseconds
#[derive(Debug, Clone, Serialize)]
pub struct LatencySummary {
    pub operation: String,
    /// Samples ever recorded (the window keeps only the latest)
    pub total_samples: u64,
    pub avg_ms: f64,
    pub p95_ms: f64,
    pub max_ms: f64,
}

/// Everything the collector knows, at one instant
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsSnapshot {
    pub uptime_secs: u64,
    pub queue_depth: usize,
    pub peak_queue_depth: usize,
    pub latencies: Vec<LatencySummary>,
    /// Oldest first
    pub alerts: Vec<Alert>,
    pub total_alerts: u64,
}

#[derive(Debug, Default)]
struct Samples {
    window: VecDeque<f64>,
    total: u64,
}

#[derive(Debug, Default)]
struct CollectorState {
    latencies: HashMap<String, Samples>,
    queue_depth: usize,
    peak_queue_depth: usize,
    alerts: VecDeque<Alert>,
    total_alerts: u64,
}

/// Bounded in-memory store of performance samples and alerts
#[derive(Debug)]
pub struct PerformanceCollector {
    state: Mutex<CollectorState>,
    max_samples: usize,
    max_alerts: usize,
    started_at: Instant,
}

impl Default for PerformanceCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceCollector {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_SAMPLES, DEFAULT_MAX_ALERTS)
    }

    /// Collector keeping at most `max_samples` per operation and `max_alerts` alerts
    pub fn with_limits(max_samples: usize, max_alerts: usize) -> Self {
        Self {
            state: Mutex::new(CollectorState::default()),
            max_samples: max_samples.max(1),
            max_alerts: max_alerts.max(1),
            started_at: Instant::now(),
        }
    }

    pub fn record_latency(&self, operation: &str, latency: Duration) {
        let mut state = self.state.lock();
        let samples = state.latencies.entry(operation.to_string()).or_default();
        if samples.window.len() == self.max_samples {
            samples.window.pop_front();
        }
        samples.window.push_back(latency.as_secs_f64() * 1000.0);
        samples.total += 1;
    }

    pub fn set_queue_depth(&self, depth: usize) {
        let mut state = self.state.lock();
        state.queue_depth = depth;
        state.peak_queue_depth = state.peak_queue_depth.max(depth);
    }

    pub fn raise_alert(&self, severity: AlertSeverity, source: &str, message: impl Into<String>) {
        let alert = Alert {
            severity,
            source: source.to_string(),
            message: message.into(),
            raised_at: SystemTime::now(),
        };
        tracing::debug!(?severity, source, message = %alert.message, "Alert recorded");

        let mut state = self.state.lock();
        if state.alerts.len() == self.max_alerts {
            state.alerts.pop_front();
        }
        state.alerts.push_back(alert);
        state.total_alerts += 1;
    }

    /// Latency summary for one operation
    pub fn latency(&self, operation: &str) -> Option<LatencySummary> {
        let state = self.state.lock();
        state
            .latencies
            .get(operation)
            .and_then(|samples| summarize(operation, samples))
    }

    /// Up to `limit` most recent alerts, newest first
    pub fn recent_alerts(&self, limit: usize) -> Vec<Alert> {
        let state = self.state.lock();
        state.alerts.iter().rev().take(limit).cloned().collect()
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let state = self.state.lock();
        let mut latencies: Vec<LatencySummary> = state
            .latencies
            .iter()
            .filter_map(|(operation, samples)| summarize(operation, samples))
            .collect();
        latencies.sort_by(|a, b| a.operation.cmp(&b.operation));

        DiagnosticsSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            queue_depth: state.queue_depth,
            peak_queue_depth: state.peak_queue_depth,
            latencies,
            alerts: state.alerts.iter().cloned().collect(),
            total_alerts: state.total_alerts,
        }
    }
}

fn summarize(operation: &str, samples: &Samples) -> Option<LatencySummary> {
    if samples.window.is_empty() {
        return None;
    }
    let mut sorted: Vec<f64> = samples.window.iter().copied().collect();
    sorted.sort_by(f64::total_cmp);

    let n = sorted.len();
    let p95_index = ((n as f64 * 0.95).ceil() as usize).clamp(1, n) - 1;

    Some(LatencySummary {
        operation: operation.to_string(),
        total_samples: samples.total,
        avg_ms: sorted.iter().sum::<f64>() / n as f64,
        p95_ms: sorted[p95_index],
        max_ms: sorted[n - 1],
    })
}
