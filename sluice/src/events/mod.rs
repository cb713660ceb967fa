//! Event sinks: explicit observer interface for execution progress and
//! status notifications.
//!
//! Callers subscribe by handing the engine an [`EventSink`]; there is no
//! global listener registry. Sinks must be cheap and must never block or
//! panic — the executor emits from its hot path.

use crate::errors::Phase;
use crate::executor::record::ExecutionStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Notifications emitted during pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// An execution changed status.
    StatusChanged {
        /// The pipeline.
        pipeline_id: String,
        /// The run.
        execution_id: Uuid,
        /// The new status.
        status: ExecutionStatus,
        /// When the transition happened.
        at: DateTime<Utc>,
    },
    /// One batch (or stream element) finished transform and load.
    BatchCompleted {
        /// The pipeline.
        pipeline_id: String,
        /// The run.
        execution_id: Uuid,
        /// Zero-based batch index.
        batch_index: usize,
        /// Records in the batch.
        records: usize,
        /// Percentage of the source consumed, when the extractor knows
        /// its total count.
        progress_pct: Option<f64>,
    },
    /// A batch or element failed in some phase and was recorded.
    BatchFailed {
        /// The pipeline.
        pipeline_id: String,
        /// The run.
        execution_id: Uuid,
        /// The phase that failed.
        phase: Phase,
        /// The failure message.
        error: String,
    },
    /// A checkpoint was persisted.
    CheckpointSaved {
        /// The pipeline.
        pipeline_id: String,
        /// The checkpoint id within the pipeline.
        checkpoint_id: String,
        /// Serialized payload bytes.
        original_size: usize,
        /// Stored bytes when compressed.
        compressed_size: Option<usize>,
    },
    /// A stage's cleanup failed; the run outcome is unaffected.
    CleanupFailed {
        /// The pipeline.
        pipeline_id: String,
        /// The run.
        execution_id: Uuid,
        /// Name of the stage whose cleanup failed.
        stage: String,
        /// The failure message.
        error: String,
    },
}

impl PipelineEvent {
    /// Stable event-kind label for filtering and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StatusChanged { .. } => "status_changed",
            Self::BatchCompleted { .. } => "batch_completed",
            Self::BatchFailed { .. } => "batch_failed",
            Self::CheckpointSaved { .. } => "checkpoint_saved",
            Self::CleanupFailed { .. } => "cleanup_failed",
        }
    }
}

/// Receives execution events. Implementations must not block or panic.
pub trait EventSink: Send + Sync {
    /// Delivers one event.
    fn emit(&self, event: &PipelineEvent);
}

/// Discards all events. The default when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn emit(&self, _event: &PipelineEvent) {}
}

/// Logs events through the tracing framework.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn emit(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::BatchFailed { .. } | PipelineEvent::CleanupFailed { .. } => {
                tracing::warn!(kind = event.kind(), event = ?event, "pipeline event");
            }
            PipelineEvent::BatchCompleted { .. } => {
                tracing::debug!(kind = event.kind(), event = ?event, "pipeline event");
            }
            _ => {
                tracing::info!(kind = event.kind(), event = ?event, "pipeline event");
            }
        }
    }
}

/// Fans events out to a tokio broadcast channel callers can select on.
///
/// Events emitted while no subscriber is attached are dropped.
#[derive(Debug)]
pub struct BroadcastEventSink {
    sender: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl BroadcastEventSink {
    /// Creates a sink buffering up to `capacity` undelivered events per
    /// subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Opens a new subscription.
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: &PipelineEvent) {
        // A send error just means nobody is listening right now.
        let _ = self.sender.send(event.clone());
    }
}

/// Collects events for assertions in tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<PipelineEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All collected events.
    #[must_use]
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.read().clone()
    }

    /// Collected events of one kind.
    #[must_use]
    pub fn of_kind(&self, kind: &str) -> Vec<PipelineEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect()
    }

    /// Number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// True when nothing has been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

impl EventSink for CollectingEventSink {
    fn emit(&self, event: &PipelineEvent) {
        self.events.write().push(event.clone());
    }
}
