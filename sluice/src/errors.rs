//! Error types for the sluice engine.
//!
//! Structural and admission errors (duplicate registration, unknown ids,
//! concurrency rejections, dependency cycles) are surfaced synchronously to
//! the caller and never retried. Stage execution errors are recorded into
//! the execution record with the phase they occurred in.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// The pipeline phase an operation or error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Data extraction from the source.
    Extract,
    /// Record transformation.
    Transform,
    /// Loading into the destination.
    Load,
    /// Best-effort stage cleanup after the run outcome is decided.
    Cleanup,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Extract => "extract",
            Self::Transform => "transform",
            Self::Load => "load",
            Self::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

/// The main error type for sluice operations.
#[derive(Debug, Error)]
pub enum EtlError {
    /// A pipeline id was registered twice.
    #[error("pipeline '{0}' is already registered")]
    Duplicate(String),

    /// A pipeline definition failed structural validation.
    #[error("invalid pipeline definition: {0}")]
    InvalidDefinition(String),

    /// The requested pipeline id is not registered.
    #[error("pipeline '{0}' is not registered")]
    NotFound(String),

    /// The pipeline id is already present in the running set.
    #[error("pipeline '{0}' is already running")]
    AlreadyRunning(String),

    /// The global concurrent-execution cap has been reached.
    #[error("concurrency limit of {limit} concurrent pipelines reached")]
    ConcurrencyLimit {
        /// The configured global cap.
        limit: usize,
    },

    /// The dependency graph contains a cycle.
    #[error("{0}")]
    CircularDependency(#[from] CircularDependencyError),

    /// Removal was refused because the pipeline is currently executing.
    #[error("pipeline '{0}' cannot be removed while it is running")]
    PipelineRunning(String),

    /// An extractor, transformer, or loader operation failed.
    #[error("{0}")]
    Stage(#[from] StageError),

    /// The per-execution timeout elapsed.
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    /// A checkpoint payload exceeded the configured size cap.
    ///
    /// This is a soft failure: the save is skipped and the run continues.
    #[error(
        "checkpoint '{checkpoint_id}' for pipeline '{pipeline_id}' is {size} bytes, \
         exceeding the {max_size} byte cap"
    )]
    CheckpointTooLarge {
        /// Owning pipeline id.
        pipeline_id: String,
        /// Checkpoint id within the pipeline.
        checkpoint_id: String,
        /// Serialized payload size in bytes.
        size: usize,
        /// Configured maximum in bytes.
        max_size: usize,
    },

    /// A state store backend operation failed.
    #[error("state store error: {0}")]
    Store(String),

    /// Serialization or deserialization of persisted state failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error from a durable backend.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error raised when the dependency graph contains a cycle.
///
/// Detected before any stage `initialize` is invoked; no partial execution
/// of the cyclic set occurs.
#[derive(Debug, Clone, Error)]
#[error("circular pipeline dependency: {}", cycle.join(" -> "))]
pub struct CircularDependencyError {
    /// The pipeline ids forming the cycle, first id repeated at the end.
    pub cycle: Vec<String>,
}

impl CircularDependencyError {
    /// Creates a new cycle error from the offending path.
    #[must_use]
    pub fn new(cycle: Vec<String>) -> Self {
        Self { cycle }
    }
}

/// A failure in an extractor, transformer, or loader, tagged with the
/// phase it occurred in.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{phase} failed for pipeline '{pipeline_id}': {message}")]
pub struct StageError {
    /// The phase the failure occurred in.
    pub phase: Phase,
    /// The pipeline being executed.
    pub pipeline_id: String,
    /// The underlying failure message.
    pub message: String,
}

impl StageError {
    /// Creates a new stage error.
    #[must_use]
    pub fn new(phase: Phase, pipeline_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            phase,
            pipeline_id: pipeline_id.into(),
            message: message.into(),
        }
    }

    /// Wraps an arbitrary stage-side error, preserving its chain.
    #[must_use]
    pub fn wrap(phase: Phase, pipeline_id: impl Into<String>, err: &anyhow::Error) -> Self {
        Self::new(phase, pipeline_id, format!("{err:#}"))
    }
}

impl EtlError {
    /// Returns true for admission/structural errors that the caller may
    /// retry later but the engine never retries automatically.
    #[must_use]
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            Self::Duplicate(_)
                | Self::NotFound(_)
                | Self::AlreadyRunning(_)
                | Self::ConcurrencyLimit { .. }
                | Self::CircularDependency(_)
                | Self::PipelineRunning(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::Extract.to_string(), "extract");
        assert_eq!(Phase::Cleanup.to_string(), "cleanup");
    }

    #[test]
    fn test_cycle_error_names_cycle() {
        let err = CircularDependencyError::new(vec![
            "a".to_string(),
            "b".to_string(),
            "a".to_string(),
        ]);
        assert!(err.to_string().contains("a -> b -> a"));
    }

    #[test]
    fn test_stage_error_display() {
        let err = StageError::new(Phase::Load, "orders", "connection reset");
        assert!(err.to_string().contains("load"));
        assert!(err.to_string().contains("orders"));
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn test_admission_classification() {
        assert!(EtlError::Duplicate("p".into()).is_admission());
        assert!(EtlError::ConcurrencyLimit { limit: 2 }.is_admission());
        assert!(!EtlError::Store("down".into()).is_admission());
        assert!(!EtlError::Timeout(Duration::from_secs(1)).is_admission());
    }

    #[test]
    fn test_stage_error_wrap_includes_chain() {
        let inner = anyhow::anyhow!("root cause").context("fetch page 3");
        let err = StageError::wrap(Phase::Extract, "quotes", &inner);
        assert!(err.message.contains("fetch page 3"));
        assert!(err.message.contains("root cause"));
    }
}
