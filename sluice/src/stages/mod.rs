//! The stage contract implemented by every extractor, transformer, and
//! loader the executor drives.
//!
//! Concrete integrations (HTTP pagination clients, database drivers,
//! stream consumers) live outside this crate; the executor only ever sees
//! these traits. Stage-side failures are reported as [`anyhow::Error`] so
//! integrations keep their own error types; the executor tags them with
//! the phase they occurred in.

pub mod config;
pub mod rate_limit;

use crate::errors::EtlError;
use crate::events::{EventSink, PipelineEvent};
use crate::executor::admission::CancelFlag;
use crate::metrics::EngineMetrics;
use crate::store::checkpoint::{CheckpointManager, CheckpointOutcome};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use uuid::Uuid;

pub use config::{ExtractorConfig, LoaderConfig, PipelineConfig, TransformerConfig};
pub use rate_limit::RateLimiter;

/// A single data record moving through a pipeline.
pub type Record = serde_json::Value;

/// A lazily produced sequence of records for streaming sources.
pub type RecordStream = BoxStream<'static, anyhow::Result<Record>>;

/// What an extractor produced: a fully materialized finite sequence, or a
/// lazy stream consumed one element at a time for constant memory use.
pub enum ExtractOutput {
    /// A finite, fully materialized sequence. Sliced into batches.
    Batch(Vec<Record>),
    /// A lazy sequence from an unbounded or very large source.
    Stream(RecordStream),
}

impl ExtractOutput {
    /// An empty finite extraction.
    #[must_use]
    pub fn empty() -> Self {
        Self::Batch(Vec::new())
    }

    /// A finite extraction from any iterator of records.
    pub fn batch(records: impl IntoIterator<Item = Record>) -> Self {
        Self::Batch(records.into_iter().collect())
    }

    /// A streaming extraction.
    #[must_use]
    pub fn stream(stream: RecordStream) -> Self {
        Self::Stream(stream)
    }
}

impl Debug for ExtractOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Batch(records) => f.debug_tuple("Batch").field(&records.len()).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Per-batch result reported by a loader so the executor can aggregate
/// totals without inspecting loader internals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    /// Records written successfully.
    pub successful: usize,
    /// Records the destination rejected.
    pub failed: usize,
    /// Records that updated an existing row/document.
    pub upserted: usize,
}

impl LoadReport {
    /// A report where every record in the batch succeeded as an insert.
    #[must_use]
    pub fn all_successful(count: usize) -> Self {
        Self {
            successful: count,
            ..Self::default()
        }
    }

    /// Accumulates another batch report into this one.
    pub fn absorb(&mut self, other: Self) {
        self.successful += other.successful;
        self.failed += other.failed;
        self.upserted += other.upserted;
    }
}

/// Counters a stage reports about itself, independent of any one run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StageMetrics {
    /// Primary-operation invocations since construction.
    pub invocations: u64,
    /// Records handled.
    pub records: u64,
    /// Failures observed.
    pub failures: u64,
}

/// Everything a stage can reach during one execution: identity, effective
/// configuration, the extractor's rate budget, checkpoint persistence, and
/// the cooperative cancellation flag.
#[derive(Clone)]
pub struct StageContext {
    pipeline_id: String,
    execution_id: Uuid,
    config: PipelineConfig,
    rate_limiter: Option<Arc<RateLimiter>>,
    checkpoints: Arc<CheckpointManager>,
    events: Arc<dyn EventSink>,
    metrics: Arc<EngineMetrics>,
    cancel: Arc<CancelFlag>,
}

impl Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("pipeline_id", &self.pipeline_id)
            .field("execution_id", &self.execution_id)
            .field("rate_limited", &self.rate_limiter.is_some())
            .finish()
    }
}

impl StageContext {
    /// Creates a context for one execution.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pipeline_id: impl Into<String>,
        execution_id: Uuid,
        config: PipelineConfig,
        rate_limiter: Option<Arc<RateLimiter>>,
        checkpoints: Arc<CheckpointManager>,
        events: Arc<dyn EventSink>,
        metrics: Arc<EngineMetrics>,
        cancel: Arc<CancelFlag>,
    ) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            execution_id,
            config,
            rate_limiter,
            checkpoints,
            events,
            metrics,
            cancel,
        }
    }

    /// The pipeline being executed.
    #[must_use]
    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    /// The unique id of this run.
    #[must_use]
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// The effective pipeline configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// True once the run has been stopped or timed out. Long-running
    /// stages should poll this and return early; results produced after
    /// cancellation are discarded.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The stop reason, once the run has been cancelled.
    #[must_use]
    pub fn cancel_reason(&self) -> Option<String> {
        self.cancel.reason()
    }

    /// Suspends until the extractor's request budget allows another call.
    /// No-op when the pipeline has no rate limit configured.
    pub async fn throttle(&self) {
        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire().await;
        }
    }

    /// Persists a resumable progress marker for this pipeline.
    ///
    /// Oversized payloads are skipped, not fatal; see
    /// [`CheckpointManager::save`].
    pub async fn save_checkpoint(
        &self,
        checkpoint_id: &str,
        payload: &serde_json::Value,
    ) -> Result<(), EtlError> {
        let outcome = self
            .checkpoints
            .save(&self.pipeline_id, checkpoint_id, payload)
            .await?;
        match outcome {
            CheckpointOutcome::Saved {
                original_size,
                compressed_size,
            } => {
                self.metrics.inc_checkpoints_saved();
                self.events.emit(&PipelineEvent::CheckpointSaved {
                    pipeline_id: self.pipeline_id.clone(),
                    checkpoint_id: checkpoint_id.to_string(),
                    original_size,
                    compressed_size,
                });
            }
            CheckpointOutcome::SkippedTooLarge { .. } => {
                self.metrics.inc_checkpoints_skipped();
            }
        }
        Ok(())
    }

    /// Loads a previously saved progress marker, if any.
    pub async fn load_checkpoint(
        &self,
        checkpoint_id: &str,
    ) -> Result<Option<serde_json::Value>, EtlError> {
        self.checkpoints.load(&self.pipeline_id, checkpoint_id).await
    }
}

/// Source side of a pipeline.
#[async_trait]
pub trait Extractor: Send + Sync + Debug {
    /// Stage name for logs and error messages.
    fn name(&self) -> &str;

    /// Idempotent setup, e.g. opening connections. Called once per
    /// execution before the first `extract`.
    async fn initialize(&self, _ctx: &StageContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Produces the records for this run.
    async fn extract(&self, ctx: &StageContext) -> anyhow::Result<ExtractOutput>;

    /// Total record count when the source knows it up front; enables
    /// progress percentages in batch events.
    async fn total_count(&self, _ctx: &StageContext) -> Option<u64> {
        None
    }

    /// Releases resources. Invoked once per execution regardless of
    /// success; errors are logged, never escalated.
    async fn cleanup(&self, _ctx: &StageContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Self-reported counters.
    fn metrics(&self) -> StageMetrics {
        StageMetrics::default()
    }
}

/// Record transformation between extraction and loading.
#[async_trait]
pub trait Transformer: Send + Sync + Debug {
    /// Stage name for logs and error messages.
    fn name(&self) -> &str;

    /// Idempotent setup. Called once per execution before the first
    /// `transform`.
    async fn initialize(&self, _ctx: &StageContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Transforms one batch. The returned batch replaces the input and
    /// may differ in length.
    async fn transform(&self, ctx: &StageContext, batch: Vec<Record>)
        -> anyhow::Result<Vec<Record>>;

    /// Releases resources; best-effort, always invoked once.
    async fn cleanup(&self, _ctx: &StageContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Self-reported counters.
    fn metrics(&self) -> StageMetrics {
        StageMetrics::default()
    }
}

/// Destination side of a pipeline.
#[async_trait]
pub trait Loader: Send + Sync + Debug {
    /// Stage name for logs and error messages.
    fn name(&self) -> &str;

    /// Idempotent setup. Called once per execution before the first
    /// `load`.
    async fn initialize(&self, _ctx: &StageContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Writes one batch and reports per-batch counts.
    async fn load(&self, ctx: &StageContext, batch: Vec<Record>) -> anyhow::Result<LoadReport>;

    /// Releases resources; best-effort, always invoked once.
    async fn cleanup(&self, _ctx: &StageContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Self-reported counters.
    fn metrics(&self) -> StageMetrics {
        StageMetrics::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_report_absorb() {
        let mut total = LoadReport::default();
        total.absorb(LoadReport::all_successful(10));
        total.absorb(LoadReport {
            successful: 3,
            failed: 2,
            upserted: 1,
        });

        assert_eq!(total.successful, 13);
        assert_eq!(total.failed, 2);
        assert_eq!(total.upserted, 1);
    }

    #[test]
    fn test_extract_output_debug_hides_stream() {
        let batch = ExtractOutput::batch(vec![serde_json::json!({"id": 1})]);
        assert_eq!(format!("{batch:?}"), "Batch(1)");

        let stream = ExtractOutput::stream(Box::pin(futures::stream::empty()));
        assert_eq!(format!("{stream:?}"), "Stream(..)");
    }

    #[test]
    fn test_empty_extraction_is_finite() {
        match ExtractOutput::empty() {
            ExtractOutput::Batch(records) => assert!(records.is_empty()),
            ExtractOutput::Stream(_) => panic!("empty() must be a finite batch"),
        }
    }
}
