//! Maintenance metrics tracking
//!
//! Thread-safe counters shared between the orchestrator and the admin surface.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Thread-safe metrics for compaction and sequence repair runs
#[derive(Debug, Clone)]
pub struct MaintenanceMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    runs: AtomicUsize,
    tables_started: AtomicUsize,
    tables_succeeded: AtomicUsize,
    tables_failed: AtomicUsize,
    rows_moved: AtomicU64,
    rows_dropped: AtomicU64,
    sequences_repaired: AtomicUsize,
    total_duration_ms: AtomicU64,
}

impl Default for MaintenanceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MaintenanceMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::default()),
        }
    }

    /// Record the start of a multi-table run
    pub fn record_run(&self) {
        self.inner.runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_table_start(&self) {
        self.inner.tables_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a committed (or dry-run) table compaction
    pub fn record_table_success(&self, moved: u64, dropped: u64, duration: Duration) {
        self.inner.tables_succeeded.fetch_add(1, Ordering::Relaxed);
        self.inner.rows_moved.fetch_add(moved, Ordering::Relaxed);
        self.inner.rows_dropped.fetch_add(dropped, Ordering::Relaxed);
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        let _ = self.inner.total_duration_ms.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |total| Some(total.saturating_add(millis)),
        );
    }

    pub fn record_table_failure(&self) {
        self.inner.tables_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sequence_repair(&self) {
        self.inner.sequences_repaired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn runs(&self) -> usize {
        self.inner.runs.load(Ordering::Relaxed)
    }

    pub fn tables_started(&self) -> usize {
        self.inner.tables_started.load(Ordering::Relaxed)
    }

    pub fn tables_succeeded(&self) -> usize {
        self.inner.tables_succeeded.load(Ordering::Relaxed)
    }

    pub fn tables_failed(&self) -> usize {
        self.inner.tables_failed.load(Ordering::Relaxed)
    }

    pub fn rows_moved(&self) -> u64 {
        self.inner.rows_moved.load(Ordering::Relaxed)
    }

    pub fn rows_dropped(&self) -> u64 {
        self.inner.rows_dropped.load(Ordering::Relaxed)
    }

    pub fn sequences_repaired(&self) -> usize {
        self.inner.sequences_repaired.load(Ordering::Relaxed)
    }

    /// Average duration of successful table compactions
    pub fn avg_duration_ms(&self) -> f64 {
        let total_ms = self.inner.total_duration_ms.load(Ordering::Relaxed) as f64;
        let tables = self.tables_succeeded() as f64;

        if tables > 0.0 { total_ms / tables } else { 0.0 }
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            runs: self.runs(),
            tables_started: self.tables_started(),
            tables_succeeded: self.tables_succeeded(),
            tables_failed: self.tables_failed(),
            rows_moved: self.rows_moved(),
            rows_dropped: self.rows_dropped(),
            sequences_repaired: self.sequences_repaired(),
            avg_duration_ms: self.avg_duration_ms(),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub runs: usize,
    pub tables_started: usize,
    pub tables_succeeded: usize,
    pub tables_failed: usize,
    pub rows_moved: u64,
    pub rows_dropped: u64,
    pub sequences_repaired: usize,
    pub avg_duration_ms: f64,
}

impl MetricsSummary {
    pub fn log(&self) {
        log::info!("=== Maintenance Metrics Summary ===");
        log::info!("Runs: {}", self.runs);
        log::info!(
            "Tables: {} started, {} succeeded, {} failed",
            self.tables_started,
            self.tables_succeeded,
            self.tables_failed
        );
        log::info!(
            "Rows: {} renumbered, {} dropped as unresolved",
            self.rows_moved,
            self.rows_dropped
        );
        log::info!("Sequences repaired: {}", self.sequences_repaired);
        log::info!("Average table duration: {:.2}ms", self.avg_duration_ms);
    }
}
