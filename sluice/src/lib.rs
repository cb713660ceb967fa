//! # Sluice
//!
//! An ETL pipeline orchestration engine. Sluice registers named
//! pipelines — each an extractor, a transformer, and a loader — and
//! executes them on demand or on schedule with:
//!
//! - **Admission guarantees**: at most one concurrent execution per
//!   pipeline id, and a global concurrency cap
//! - **Durable state**: execution history and resumable checkpoints in a
//!   pluggable state store (in-memory, single JSON document, or
//!   file-per-key)
//! - **Batching and streaming**: finite extractions are sliced into
//!   batches; lazy sources stream element-at-a-time in constant memory
//! - **Dependency ordering**: depth-first execution of dependency
//!   closures with cycle detection
//! - **Failure policy**: per-stage retry with backoff, stop-on-error or
//!   bounded error accumulation, and best-effort cleanup that always runs
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sluice::prelude::*;
//!
//! let engine = EtlEngine::new(Arc::new(MemoryStore::new()), EngineConfig::default());
//! engine.register_pipeline(
//!     PipelineSpec::new("orders")
//!         .with_extractor(extractor)
//!         .with_transformer(transformer)
//!         .with_loader(loader)
//!         .with_schedule("@every 5m"),
//! )?;
//! let summary = engine.execute_pipeline("orders").await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation
)]

pub mod backoff;
pub mod engine;
pub mod errors;
pub mod events;
pub mod executor;
pub mod history;
pub mod metrics;
pub mod registry;
pub mod schedule;
pub mod stages;
pub mod store;
pub mod sweeper;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backoff::{BackoffStrategy, RetryPolicy};
    pub use crate::engine::{
        EngineConfig, EngineHealth, EtlEngine, PipelineState, PipelineStatus,
    };
    pub use crate::errors::{
        CircularDependencyError, EtlError, Phase, StageError,
    };
    pub use crate::events::{
        BroadcastEventSink, CollectingEventSink, EventSink, LoggingEventSink,
        NoOpEventSink, PipelineEvent,
    };
    pub use crate::executor::record::{
        ExecutionRecord, ExecutionStatus, ExecutionSummary, PhaseError,
        PhaseTimings, RecordCounts,
    };
    pub use crate::executor::PipelineExecutor;
    pub use crate::history::HistoryConfig;
    pub use crate::metrics::MetricsSnapshot;
    pub use crate::registry::{PipelineDefinition, PipelineRegistry, PipelineSpec};
    pub use crate::schedule::Schedule;
    pub use crate::stages::{
        ExtractOutput, Extractor, LoadReport, Loader, PipelineConfig,
        RateLimiter, Record, StageContext, StageMetrics, Transformer,
    };
    pub use crate::store::{
        CheckpointConfig, CheckpointManager, DocumentStore, FsStore,
        MemoryStore, StateStore,
    };
}
