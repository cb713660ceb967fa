//! Execution records: the per-run value object persisted to the state
//! store, and the summary returned to callers.

use crate::errors::Phase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Admitted and executing.
    Running,
    /// All stages finished without a terminal error.
    Completed,
    /// A stage error, timeout, stop, or exhausted error budget ended the
    /// run.
    Failed,
}

impl ExecutionStatus {
    /// True for `Completed` and `Failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Wall-clock milliseconds spent in each phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTimings {
    /// Time in extraction.
    pub extract_ms: u64,
    /// Time in transformation.
    pub transform_ms: u64,
    /// Time in loading.
    pub load_ms: u64,
}

/// Record counters for one execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordCounts {
    /// Records produced by the extractor.
    pub extracted: u64,
    /// Records the loader reported as written.
    pub succeeded: u64,
    /// Records lost to transform/load failures or rejected by the
    /// destination.
    pub failed: u64,
}

/// One captured error, tagged with the phase it occurred in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseError {
    /// The phase the error occurred in.
    pub phase: Phase,
    /// The failure message.
    pub message: String,
    /// When it was captured.
    pub at: DateTime<Utc>,
}

/// The durable record of one pipeline run.
///
/// Created when the run is admitted, appended to during the run,
/// finalized and persisted on completion or failure — never mutated after
/// persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Fresh unique id for this run.
    pub execution_id: Uuid,
    /// The pipeline that ran.
    pub pipeline_id: String,
    /// Current status.
    pub status: ExecutionStatus,
    /// When the run was admitted.
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
    /// Per-phase timing.
    pub timings: PhaseTimings,
    /// Record counters.
    pub counts: RecordCounts,
    /// Captured errors in the order they occurred.
    pub errors: Vec<PhaseError>,
}

impl ExecutionRecord {
    /// Starts a new record in the `Running` state.
    #[must_use]
    pub fn begin(pipeline_id: impl Into<String>) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            pipeline_id: pipeline_id.into(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            timings: PhaseTimings::default(),
            counts: RecordCounts::default(),
            errors: Vec::new(),
        }
    }

    /// Captures an error with its phase.
    pub fn push_error(&mut self, phase: Phase, message: impl Into<String>) {
        self.errors.push(PhaseError {
            phase,
            message: message.into(),
            at: Utc::now(),
        });
    }

    /// Finalizes the record with a terminal status.
    pub fn finish(&mut self, status: ExecutionStatus) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    /// Total run duration in milliseconds; measured to now while still
    /// running.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        u64::try_from(
            end.signed_duration_since(self.started_at)
                .num_milliseconds()
                .max(0),
        )
        .unwrap_or(u64::MAX)
    }

    /// The caller-facing summary of this record.
    #[must_use]
    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            execution_id: self.execution_id,
            pipeline_id: self.pipeline_id.clone(),
            status: self.status,
            duration_ms: self.duration_ms(),
            timings: self.timings,
            counts: self.counts,
            records_processed: self.counts.succeeded,
            errors: self.errors.clone(),
        }
    }
}

/// What every execution yields to the caller, success or failure — there
/// is no silent failure mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// The run's id.
    pub execution_id: Uuid,
    /// The pipeline that ran.
    pub pipeline_id: String,
    /// Terminal status.
    pub status: ExecutionStatus,
    /// Total duration.
    pub duration_ms: u64,
    /// Per-phase timing.
    pub timings: PhaseTimings,
    /// Record counters.
    pub counts: RecordCounts,
    /// Records successfully processed end to end.
    pub records_processed: u64,
    /// Captured errors in order.
    pub errors: Vec<PhaseError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_is_running_with_fresh_id() {
        let a = ExecutionRecord::begin("p");
        let b = ExecutionRecord::begin("p");

        assert_eq!(a.status, ExecutionStatus::Running);
        assert!(a.finished_at.is_none());
        assert_ne!(a.execution_id, b.execution_id);
    }

    #[test]
    fn test_finish_sets_terminal_state() {
        let mut record = ExecutionRecord::begin("p");
        record.finish(ExecutionStatus::Completed);

        assert!(record.status.is_terminal());
        assert!(record.finished_at.is_some());
    }

    #[test]
    fn test_summary_reports_succeeded_as_processed() {
        let mut record = ExecutionRecord::begin("p");
        record.counts.extracted = 10;
        record.counts.succeeded = 8;
        record.counts.failed = 2;
        record.push_error(Phase::Load, "two rejected");
        record.finish(ExecutionStatus::Completed);

        let summary = record.summary();
        assert_eq!(summary.records_processed, 8);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].phase, Phase::Load);
    }

    #[test]
    fn test_record_serializes_with_lowercase_status() {
        let record = ExecutionRecord::begin("p");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["pipeline_id"], "p");
    }
}
