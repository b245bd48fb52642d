//! Downsampling metrics tracking
//!
//! Thread-safe counters shared by the retry driver, the executor and the run
//! loop. A snapshot is logged at the end of every run.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DownsampleMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    measurements_started: AtomicUsize,
    measurements_succeeded: AtomicUsize,
    measurements_failed: AtomicUsize,
    measurements_resumed: AtomicUsize,
    statements_executed: AtomicUsize,
    retries_attempted: AtomicUsize,
    points_written: AtomicU64,
    points_restored: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl Default for DownsampleMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DownsampleMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::default()),
        }
    }

    pub fn record_measurement_start(&self) {
        self.inner
            .measurements_started
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record a measurement that reached `Done`
    pub fn record_measurement_success(&self, restored: u64, duration: Duration) {
        self.inner
            .measurements_succeeded
            .fetch_add(1, Ordering::Relaxed);
        self.inner
            .points_restored
            .fetch_add(restored, Ordering::Relaxed);
        self.inner
            .total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_measurement_failure(&self) {
        self.inner
            .measurements_failed
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record an interrupted swap picked up from the checkpoint journal
    pub fn record_resume(&self) {
        self.inner
            .measurements_resumed
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_statement(&self, written: u64) {
        self.inner
            .statements_executed
            .fetch_add(1, Ordering::Relaxed);
        self.inner
            .points_written
            .fetch_add(written, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.inner.retries_attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn measurements_started(&self) -> usize {
        self.inner.measurements_started.load(Ordering::Relaxed)
    }

    pub fn measurements_succeeded(&self) -> usize {
        self.inner.measurements_succeeded.load(Ordering::Relaxed)
    }

    pub fn measurements_failed(&self) -> usize {
        self.inner.measurements_failed.load(Ordering::Relaxed)
    }

    pub fn measurements_resumed(&self) -> usize {
        self.inner.measurements_resumed.load(Ordering::Relaxed)
    }

    pub fn statements_executed(&self) -> usize {
        self.inner.statements_executed.load(Ordering::Relaxed)
    }

    pub fn retries_attempted(&self) -> usize {
        self.inner.retries_attempted.load(Ordering::Relaxed)
    }

    /// Points written by every `INTO` statement, restore included
    pub fn points_written(&self) -> u64 {
        self.inner.points_written.load(Ordering::Relaxed)
    }

    pub fn points_restored(&self) -> u64 {
        self.inner.points_restored.load(Ordering::Relaxed)
    }

    /// Average wall time of a successful measurement
    pub fn avg_duration_ms(&self) -> f64 {
        let total_ms = self.inner.total_duration_ms.load(Ordering::Relaxed) as f64;
        let done = self.measurements_succeeded() as f64;

        if done > 0.0 { total_ms / done } else { 0.0 }
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            measurements_started: self.measurements_started(),
            measurements_succeeded: self.measurements_succeeded(),
            measurements_failed: self.measurements_failed(),
            measurements_resumed: self.measurements_resumed(),
            statements_executed: self.statements_executed(),
            retries_attempted: self.retries_attempted(),
            points_written: self.points_written(),
            points_restored: self.points_restored(),
            avg_duration_ms: self.avg_duration_ms(),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSummary {
    pub measurements_started: usize,
    pub measurements_succeeded: usize,
    pub measurements_failed: usize,
    pub measurements_resumed: usize,
    pub statements_executed: usize,
    pub retries_attempted: usize,
    pub points_written: u64,
    pub points_restored: u64,
    pub avg_duration_ms: f64,
}

impl MetricsSummary {
    pub fn log(&self) {
        tracing::info!(
            started = self.measurements_started,
            succeeded = self.measurements_succeeded,
            failed = self.measurements_failed,
            resumed = self.measurements_resumed,
            "Measurements"
        );
        tracing::info!(
            statements = self.statements_executed,
            retries = self.retries_attempted,
            written = self.points_written,
            restored = self.points_restored,
            avg_duration_ms = format!("{:.2}", self.avg_duration_ms),
            "Statements"
        );
    }
}
