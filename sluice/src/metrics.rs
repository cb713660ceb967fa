//! Engine-wide counters, including the cleanup-failure count that
//! surfaces potential resource leaks best-effort cleanup would otherwise
//! hide.

use crate::executor::record::RecordCounts;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters shared by the executor, checkpoint manager, and
/// engine facade.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    runs_started: AtomicU64,
    runs_completed: AtomicU64,
    runs_failed: AtomicU64,
    records_extracted: AtomicU64,
    records_loaded: AtomicU64,
    records_failed: AtomicU64,
    cleanup_failures: AtomicU64,
    checkpoints_saved: AtomicU64,
    checkpoints_skipped: AtomicU64,
}

impl EngineMetrics {
    /// Creates zeroed metrics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts an admitted run.
    pub fn inc_runs_started(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a completed run.
    pub fn inc_runs_completed(&self) {
        self.runs_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a failed run.
    pub fn inc_runs_failed(&self) {
        self.runs_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a stage cleanup failure — the resource-leak signal.
    pub fn inc_cleanup_failures(&self) {
        self.cleanup_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a persisted checkpoint.
    pub fn inc_checkpoints_saved(&self) {
        self.checkpoints_saved.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a checkpoint skipped by the size cap.
    pub fn inc_checkpoints_skipped(&self) {
        self.checkpoints_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Folds one execution's record counters into the totals.
    pub fn add_records(&self, counts: &RecordCounts) {
        self.records_extracted
            .fetch_add(counts.extracted, Ordering::Relaxed);
        self.records_loaded
            .fetch_add(counts.succeeded, Ordering::Relaxed);
        self.records_failed
            .fetch_add(counts.failed, Ordering::Relaxed);
    }

    /// Point-in-time snapshot. Gauges the metrics object cannot know
    /// (running/registered counts) are supplied by the engine.
    #[must_use]
    pub fn snapshot(&self, currently_running: usize, registered_pipelines: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            runs_started: self.runs_started.load(Ordering::Relaxed),
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            records_extracted: self.records_extracted.load(Ordering::Relaxed),
            records_loaded: self.records_loaded.load(Ordering::Relaxed),
            records_failed: self.records_failed.load(Ordering::Relaxed),
            cleanup_failures: self.cleanup_failures.load(Ordering::Relaxed),
            checkpoints_saved: self.checkpoints_saved.load(Ordering::Relaxed),
            checkpoints_skipped: self.checkpoints_skipped.load(Ordering::Relaxed),
            currently_running,
            registered_pipelines,
        }
    }
}

/// Serializable view of the engine counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Runs admitted.
    pub runs_started: u64,
    /// Runs that completed.
    pub runs_completed: u64,
    /// Runs that failed.
    pub runs_failed: u64,
    /// Records produced by extractors.
    pub records_extracted: u64,
    /// Records loaded successfully.
    pub records_loaded: u64,
    /// Records lost to failures.
    pub records_failed: u64,
    /// Stage cleanup failures (potential resource leaks).
    pub cleanup_failures: u64,
    /// Checkpoints persisted.
    pub checkpoints_saved: u64,
    /// Checkpoints skipped by the size cap.
    pub checkpoints_skipped: u64,
    /// Executions running right now.
    pub currently_running: usize,
    /// Pipelines currently registered.
    pub registered_pipelines: usize,
}
