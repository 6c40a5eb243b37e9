//! Engine metrics and alerting
//!
//! Tracks:
//! - One counter per diagnostic condition (unroutable, duplicate, late, ...)
//! - Throughput of ticks, candles, feature vectors and persisted rows
//! - Fold latency percentiles
//! - Threshold-based alerts, plus alerts raised directly by the sinks
//!
//! A threshold alert fires once when its metric crosses the limit and again
//! only after the metric has dropped back under it.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use feed_types::errors::Diagnostic;
use serde::{Deserialize, Serialize};

pub struct EngineMetrics {
    // Ingress
    pub ticks_received: AtomicU64,
    pub ticks_routed: AtomicU64,
    pub ticks_derived: AtomicU64,

    // Aggregation
    pub candles_emitted: AtomicU64,
    pub empty_candles_emitted: AtomicU64,
    pub feature_vectors: AtomicU64,
    pub fold_latency_ns: Mutex<LatencyTracker>,

    // Persistence
    pub rows_persisted: AtomicU64,
    pub partitions_written: AtomicU64,
    pub flush_retries: AtomicU64,
    pub flush_timeouts: AtomicU64,
    pub batches_dead_lettered: AtomicU64,

    // Diagnostics, indexed like `Diagnostic::ALL`
    diagnostics: [AtomicU64; Diagnostic::ALL.len()],

    pub alerts: Mutex<Vec<Alert>>,
    // Threshold metrics currently over their limit
    firing: Mutex<BTreeSet<String>>,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            ticks_received: AtomicU64::new(0),
            ticks_routed: AtomicU64::new(0),
            ticks_derived: AtomicU64::new(0),
            candles_emitted: AtomicU64::new(0),
            empty_candles_emitted: AtomicU64::new(0),
            feature_vectors: AtomicU64::new(0),
            fold_latency_ns: Mutex::new(LatencyTracker::new(1000)),
            rows_persisted: AtomicU64::new(0),
            partitions_written: AtomicU64::new(0),
            flush_retries: AtomicU64::new(0),
            flush_timeouts: AtomicU64::new(0),
            batches_dead_lettered: AtomicU64::new(0),
            diagnostics: Default::default(),
            alerts: Mutex::new(Vec::new()),
            firing: Mutex::new(BTreeSet::new()),
        }
    }

    fn slot(diagnostic: Diagnostic) -> usize {
        Diagnostic::ALL
            .iter()
            .position(|d| *d == diagnostic)
            .unwrap_or_default()
    }

    pub fn record(&self, diagnostic: Diagnostic) {
        self.record_n(diagnostic, 1);
    }

    pub fn record_n(&self, diagnostic: Diagnostic, n: u64) {
        self.diagnostics[Self::slot(diagnostic)].fetch_add(n, Ordering::Relaxed);
    }

    pub fn count(&self, diagnostic: Diagnostic) -> u64 {
        self.diagnostics[Self::slot(diagnostic)].load(Ordering::Relaxed)
    }

    pub fn record_candle(&self, is_empty: bool) {
        self.candles_emitted.fetch_add(1, Ordering::Relaxed);
        if is_empty {
            self.empty_candles_emitted.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_fold(&self, latency_ns: u64) {
        if let Ok(mut tracker) = self.fold_latency_ns.lock() {
            tracker.record(latency_ns);
        }
    }

    /// Store an alert raised outside threshold checks (e.g. a dead-lettered batch).
    pub fn raise(&self, alert: Alert) {
        if let Ok(mut store) = self.alerts.lock() {
            store.push(alert);
        }
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }

    /// Check alert thresholds and return the alerts that started firing
    /// since the last check.
    pub fn check_thresholds(&self, thresholds: &AlertThresholds) -> Vec<Alert> {
        let mut alerts = Vec::new();

        let late = self.count(Diagnostic::LateTickDropped);
        if late > thresholds.max_late_ticks {
            alerts.push(Alert {
                level: AlertLevel::Warning,
                metric: "late_ticks_dropped".to_string(),
                message: format!("Late ticks dropped: {} > threshold {}", late, thresholds.max_late_ticks),
            });
        }

        let bp_drops = self.count(Diagnostic::SubscriberBackpressure);
        if bp_drops > thresholds.max_backpressure_drops {
            alerts.push(Alert {
                level: AlertLevel::Warning,
                metric: "subscriber_backpressure".to_string(),
                message: format!("Backpressure drops: {} > threshold {}", bp_drops, thresholds.max_backpressure_drops),
            });
        }

        let write_failures = self.count(Diagnostic::StorageWriteFailure);
        if write_failures > thresholds.max_storage_write_failures {
            alerts.push(Alert {
                level: AlertLevel::Critical,
                metric: "storage_write_failure".to_string(),
                message: format!(
                    "Storage write failures: {} > threshold {}",
                    write_failures, thresholds.max_storage_write_failures
                ),
            });
        }

        if let Ok(tracker) = self.fold_latency_ns.lock() {
            if let Some(p99) = tracker.percentile(99) {
                if p99 > thresholds.max_fold_p99_ns {
                    alerts.push(Alert {
                        level: AlertLevel::Warning,
                        metric: "fold_latency_p99".to_string(),
                        message: format!("Fold p99: {}ns > threshold {}ns", p99, thresholds.max_fold_p99_ns),
                    });
                }
            }
        }

        let mut firing = self.firing.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        firing.retain(|metric| alerts.iter().any(|a| &a.metric == metric));
        alerts.retain(|a| firing.insert(a.metric.clone()));
        drop(firing);

        if let Ok(mut store) = self.alerts.lock() {
            store.extend(alerts.clone());
        }

        alerts
    }

    /// Export metrics as a BTreeMap for Prometheus-style exposition.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let mut m = BTreeMap::new();
        m.insert("ticks_received".to_string(), self.ticks_received.load(Ordering::Relaxed));
        m.insert("ticks_routed".to_string(), self.ticks_routed.load(Ordering::Relaxed));
        m.insert("ticks_derived".to_string(), self.ticks_derived.load(Ordering::Relaxed));
        m.insert("candles_emitted".to_string(), self.candles_emitted.load(Ordering::Relaxed));
        m.insert("empty_candles_emitted".to_string(), self.empty_candles_emitted.load(Ordering::Relaxed));
        m.insert("feature_vectors".to_string(), self.feature_vectors.load(Ordering::Relaxed));
        m.insert("rows_persisted".to_string(), self.rows_persisted.load(Ordering::Relaxed));
        m.insert("partitions_written".to_string(), self.partitions_written.load(Ordering::Relaxed));
        m.insert("flush_retries".to_string(), self.flush_retries.load(Ordering::Relaxed));
        m.insert("flush_timeouts".to_string(), self.flush_timeouts.load(Ordering::Relaxed));
        m.insert("batches_dead_lettered".to_string(), self.batches_dead_lettered.load(Ordering::Relaxed));
        for diagnostic in Diagnostic::ALL {
            m.insert(format!("diagnostic_{}", diagnostic.as_str()), self.count(diagnostic));
        }
        m
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded window of latency samples for percentile calculation.
pub struct LatencyTracker {
    samples: VecDeque<u64>,
    max_samples: usize,
}

impl LatencyTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples,
        }
    }

    pub fn record(&mut self, value: u64) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Get a percentile value (0-100).
    pub fn percentile(&self, p: usize) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (p as f64 / 100.0 * (sorted.len() - 1) as f64) as usize;
        Some(sorted[idx.min(sorted.len() - 1)])
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub max_late_ticks: u64,
    pub max_backpressure_drops: u64,
    pub max_storage_write_failures: u64,
    pub max_fold_p99_ns: u64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            max_late_ticks: 10_000,
            max_backpressure_drops: 1_000,
            max_storage_write_failures: 0,
            max_fold_p99_ns: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertLevel {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub metric: String,
    pub message: String,
}
