//! The pipeline executor: runs the extract→transform→load sequence for
//! one invocation, enforces admission guarantees, dispatches batches or
//! stream elements, and resolves dependency order across pipelines.

pub mod admission;
pub mod record;


use crate::backoff::{with_backoff, RetryPolicy};
use crate::errors::{CircularDependencyError, EtlError, Phase, StageError};
use crate::events::{EventSink, PipelineEvent};
use crate::history::HistoryRecorder;
use crate::metrics::EngineMetrics;
use crate::registry::{PipelineDefinition, PipelineRegistry};
use crate::stages::{ExtractOutput, RateLimiter, Record, StageContext};
use crate::store::CheckpointManager;
use admission::{AdmissionControl, RunToken};
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use record::{ExecutionRecord, ExecutionStatus, ExecutionSummary};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Orchestrates pipeline executions.
///
/// Structural and admission failures return `Err`; an admitted run always
/// returns `Ok` with a summary, whether it completed or failed.
pub struct PipelineExecutor {
    registry: Arc<PipelineRegistry>,
    admission: Arc<AdmissionControl>,
    history: Arc<HistoryRecorder>,
    checkpoints: Arc<CheckpointManager>,
    events: Arc<dyn EventSink>,
    metrics: Arc<EngineMetrics>,
    execution_timeout: Option<Duration>,
}

impl std::fmt::Debug for PipelineExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineExecutor")
            .field("limit", &self.admission.limit())
            .field("execution_timeout", &self.execution_timeout)
            .finish()
    }
}

impl PipelineExecutor {
    /// Creates an executor over shared engine components.
    #[must_use]
    pub fn new(
        registry: Arc<PipelineRegistry>,
        admission: Arc<AdmissionControl>,
        history: Arc<HistoryRecorder>,
        checkpoints: Arc<CheckpointManager>,
        events: Arc<dyn EventSink>,
        metrics: Arc<EngineMetrics>,
        execution_timeout: Option<Duration>,
    ) -> Self {
        Self {
            registry,
            admission,
            history,
            checkpoints,
            events,
            metrics,
            execution_timeout,
        }
    }

    /// The admission control shared with the registry and engine.
    #[must_use]
    pub fn admission(&self) -> &Arc<AdmissionControl> {
        &self.admission
    }

    /// Executes one pipeline invocation.
    ///
    /// Fails with [`EtlError::NotFound`] for unknown ids and with
    /// [`EtlError::AlreadyRunning`] / [`EtlError::ConcurrencyLimit`] when
    /// admission is refused; rejected calls are never queued.
    pub async fn execute(&self, pipeline_id: &str) -> Result<ExecutionSummary, EtlError> {
        if !self.registry.contains(pipeline_id) {
            return Err(EtlError::NotFound(pipeline_id.to_string()));
        }

        let token = self.admission.admit(pipeline_id)?;

        // The definition may have been removed between the existence check
        // and admission; at that point the id was not yet running, so the
        // removal was legal.
        let Some(definition) = self.registry.get(pipeline_id) else {
            return Err(EtlError::NotFound(pipeline_id.to_string()));
        };

        Ok(self.run(definition, token).await)
    }

    /// Executes `pipeline_id` after executing every dependency in
    /// depth-first order.
    ///
    /// A cycle fails with [`EtlError::CircularDependency`] naming the
    /// cycle, before any stage `initialize` is invoked. If a dependency
    /// run fails, the chain stops and that dependency's summary is
    /// returned; dependents are not started.
    pub async fn execute_with_dependencies(
        &self,
        pipeline_id: &str,
    ) -> Result<ExecutionSummary, EtlError> {
        let order = self.resolution_order(pipeline_id)?;

        let mut last = None;
        for id in &order {
            let summary = self.execute(id).await?;
            if summary.status == ExecutionStatus::Failed && id != pipeline_id {
                tracing::warn!(
                    pipeline_id,
                    dependency = %id,
                    "dependency run failed; dependents skipped"
                );
                return Ok(summary);
            }
            last = Some(summary);
        }

        last.ok_or_else(|| EtlError::NotFound(pipeline_id.to_string()))
    }

    /// Depth-first dependency resolution: dependencies first, the
    /// requested pipeline last. A node revisited while still on the
    /// traversal stack names a cycle.
    fn resolution_order(&self, pipeline_id: &str) -> Result<Vec<String>, EtlError> {
        let mut visited = HashSet::new();
        let mut stack = Vec::new();
        let mut order = Vec::new();
        self.visit(pipeline_id, &mut visited, &mut stack, &mut order)?;
        Ok(order)
    }

    fn visit(
        &self,
        id: &str,
        visited: &mut HashSet<String>,
        stack: &mut Vec<String>,
        order: &mut Vec<String>,
    ) -> Result<(), EtlError> {
        if visited.contains(id) {
            return Ok(());
        }
        if let Some(pos) = stack.iter().position(|entry| entry == id) {
            let mut cycle = stack[pos..].to_vec();
            cycle.push(id.to_string());
            return Err(CircularDependencyError::new(cycle).into());
        }

        let definition = self
            .registry
            .get(id)
            .ok_or_else(|| EtlError::NotFound(id.to_string()))?;

        stack.push(id.to_string());
        for dependency in &definition.dependencies {
            self.visit(dependency, visited, stack, order)?;
        }
        stack.pop();

        visited.insert(id.to_string());
        order.push(id.to_string());
        Ok(())
    }

    /// Drives one admitted run to its terminal state.
    async fn run(&self, definition: PipelineDefinition, token: RunToken) -> ExecutionSummary {
        let record = Arc::new(Mutex::new(ExecutionRecord::begin(&definition.id)));
        let execution_id = record.lock().execution_id;
        let started_at = record.lock().started_at;

        self.metrics.inc_runs_started();
        self.emit_status(&definition.id, execution_id, ExecutionStatus::Running);
        tracing::info!(pipeline_id = %definition.id, %execution_id, "execution started");

        let rate_limiter = RateLimiter::from_config(&definition.config.extractor);
        let ctx = StageContext::new(
            &definition.id,
            execution_id,
            definition.config.clone(),
            rate_limiter,
            self.checkpoints.clone(),
            self.events.clone(),
            self.metrics.clone(),
            token.cancel_flag(),
        );

        let initialized = Arc::new(Mutex::new(Vec::<Phase>::new()));

        let body = self.run_phases(&definition, &ctx, &record, &initialized);
        let outcome = match self.execution_timeout {
            Some(limit) => match tokio::time::timeout(limit, body).await {
                Ok(result) => result,
                // The body future is dropped here; a stage that ignores
                // cancellation cannot report results past this point, so
                // nothing late is ever persisted as a success.
                Err(_) => Err(EtlError::Timeout(limit)),
            },
            None => body.await,
        };

        // Terminal status is decided before cleanup and never changed by it.
        let status = {
            let mut rec = record.lock();
            match outcome {
                Ok(()) => rec.finish(ExecutionStatus::Completed),
                Err(ref err) => {
                    let phase = match err {
                        EtlError::Stage(stage_err) => stage_err.phase,
                        _ => current_phase(&initialized),
                    };
                    rec.push_error(phase, err.to_string());
                    rec.finish(ExecutionStatus::Failed);
                }
            }
            rec.status
        };

        self.run_cleanup(&definition, &ctx, &initialized, &record).await;

        let final_record = record.lock().clone();
        if let Err(err) = self.history.record(&final_record).await {
            tracing::error!(
                pipeline_id = %definition.id,
                %execution_id,
                error = %err,
                "failed to persist execution record"
            );
        }

        self.registry.record_run(&definition.id, started_at);
        match status {
            ExecutionStatus::Completed => self.metrics.inc_runs_completed(),
            ExecutionStatus::Failed => self.metrics.inc_runs_failed(),
            ExecutionStatus::Running => {}
        }
        self.metrics
            .add_records(&final_record.counts);
        self.emit_status(&definition.id, execution_id, status);
        tracing::info!(
            pipeline_id = %definition.id,
            %execution_id,
            status = ?status,
            extracted = final_record.counts.extracted,
            succeeded = final_record.counts.succeeded,
            failed = final_record.counts.failed,
            "execution finished"
        );

        // Slot is released only after the summary is persisted.
        drop(token);

        final_record.summary()
    }

    /// The extract→transform→load body, run under the optional timeout.
    async fn run_phases(
        &self,
        definition: &PipelineDefinition,
        ctx: &StageContext,
        record: &Arc<Mutex<ExecutionRecord>>,
        initialized: &Arc<Mutex<Vec<Phase>>>,
    ) -> Result<(), EtlError> {
        let retry = RetryPolicy::new()
            .with_max_retries(definition.config.max_retries)
            .with_base_delay(definition.config.retry_delay);

        // Extraction.
        self.ensure_initialized(definition, ctx, initialized, Phase::Extract)
            .await?;

        let extract_started = Instant::now();
        let extractor = definition.extractor.clone();
        let extract_ctx = ctx.clone();
        let pipeline_id = definition.id.clone();
        let output = with_backoff(&retry, "extract", move || {
            let extractor = extractor.clone();
            let ctx = extract_ctx.clone();
            let pipeline_id = pipeline_id.clone();
            async move {
                extractor
                    .extract(&ctx)
                    .await
                    .map_err(|e| EtlError::from(StageError::wrap(Phase::Extract, &pipeline_id, &e)))
            }
        })
        .await?;
        record.lock().timings.extract_ms += elapsed_ms(extract_started);

        let total = definition.extractor.total_count(ctx).await;

        match output {
            ExtractOutput::Batch(records) => {
                record.lock().counts.extracted = records.len() as u64;
                if records.is_empty() {
                    // An empty extraction short-circuits the remaining
                    // stages and still counts as a completed run.
                    tracing::info!(
                        pipeline_id = %definition.id,
                        "extraction returned no records; transform and load skipped"
                    );
                    return Ok(());
                }

                let batch_size = definition.config.batch_size.max(1);
                let mut index = 0;
                let mut remaining = records;
                while !remaining.is_empty() {
                    let rest = remaining.split_off(remaining.len().min(batch_size));
                    let batch = std::mem::replace(&mut remaining, rest);
                    self.check_cancelled(definition, ctx, initialized)?;
                    self.process_batch(definition, ctx, &retry, record, initialized, index, batch, total)
                        .await?;
                    index += 1;
                }
            }
            ExtractOutput::Stream(mut stream) => {
                // One element at a time through transform and load for
                // constant memory use.
                let mut index = 0;
                while let Some(item) = stream.next().await {
                    self.check_cancelled(definition, ctx, initialized)?;
                    match item {
                        Ok(element) => {
                            record.lock().counts.extracted += 1;
                            self.process_batch(
                                definition,
                                ctx,
                                &retry,
                                record,
                                initialized,
                                index,
                                vec![element],
                                total,
                            )
                            .await?;
                        }
                        Err(err) => {
                            record.lock().counts.failed += 1;
                            self.note_failure(
                                definition,
                                record,
                                ctx.execution_id(),
                                Phase::Extract,
                                format!("{err:#}"),
                            )?;
                        }
                    }
                    index += 1;
                }
            }
        }

        Ok(())
    }

    /// Feeds one batch (or one stream element) through transform then
    /// load, recording per-batch failures individually.
    #[allow(clippy::too_many_arguments)]
    async fn process_batch(
        &self,
        definition: &PipelineDefinition,
        ctx: &StageContext,
        retry: &RetryPolicy,
        record: &Arc<Mutex<ExecutionRecord>>,
        initialized: &Arc<Mutex<Vec<Phase>>>,
        index: usize,
        batch: Vec<Record>,
        total: Option<u64>,
    ) -> Result<(), EtlError> {
        let batch_len = batch.len() as u64;
        let execution_id = ctx.execution_id();

        // Transform.
        self.ensure_initialized(definition, ctx, initialized, Phase::Transform)
            .await?;
        let transform_started = Instant::now();
        let transformer = definition.transformer.clone();
        let transform_ctx = ctx.clone();
        let pipeline_id = definition.id.clone();
        let transformed = with_backoff(retry, "transform", move || {
            let transformer = transformer.clone();
            let ctx = transform_ctx.clone();
            let pipeline_id = pipeline_id.clone();
            let batch = batch.clone();
            async move {
                transformer
                    .transform(&ctx, batch)
                    .await
                    .map_err(|e| EtlError::from(StageError::wrap(Phase::Transform, &pipeline_id, &e)))
            }
        })
        .await;
        record.lock().timings.transform_ms += elapsed_ms(transform_started);

        let transformed = match transformed {
            Ok(batch) => batch,
            Err(err) => {
                record.lock().counts.failed += batch_len;
                return self.note_failure(
                    definition,
                    record,
                    execution_id,
                    Phase::Transform,
                    err.to_string(),
                );
            }
        };

        let transformed: Vec<Record> = if definition.config.transformer.skip_nulls {
            transformed.into_iter().filter(|r| !r.is_null()).collect()
        } else {
            transformed
        };
        if transformed.is_empty() {
            self.emit_batch_completed(definition, execution_id, index, 0, record, total);
            return Ok(());
        }

        // Load.
        self.ensure_initialized(definition, ctx, initialized, Phase::Load)
            .await?;
        let load_started = Instant::now();
        let loaded_len = transformed.len();
        let loader = definition.loader.clone();
        let load_ctx = ctx.clone();
        let pipeline_id = definition.id.clone();
        let report = with_backoff(retry, "load", move || {
            let loader = loader.clone();
            let ctx = load_ctx.clone();
            let pipeline_id = pipeline_id.clone();
            let batch = transformed.clone();
            async move {
                loader
                    .load(&ctx, batch)
                    .await
                    .map_err(|e| EtlError::from(StageError::wrap(Phase::Load, &pipeline_id, &e)))
            }
        })
        .await;
        record.lock().timings.load_ms += elapsed_ms(load_started);

        match report {
            Ok(report) => {
                {
                    let mut rec = record.lock();
                    rec.counts.succeeded += report.successful as u64;
                    rec.counts.failed += report.failed as u64;
                }
                if report.failed > 0 {
                    self.note_failure(
                        definition,
                        record,
                        execution_id,
                        Phase::Load,
                        format!("{} records rejected by destination", report.failed),
                    )?;
                }
                self.emit_batch_completed(
                    definition,
                    execution_id,
                    index,
                    loaded_len,
                    record,
                    total,
                );
                Ok(())
            }
            Err(err) => {
                record.lock().counts.failed += loaded_len as u64;
                self.note_failure(definition, record, execution_id, Phase::Load, err.to_string())
            }
        }
    }

    /// Records a batch/element failure and decides whether the run keeps
    /// going: `stop_on_error` aborts immediately, otherwise failures
    /// accumulate until the error budget is spent.
    fn note_failure(
        &self,
        definition: &PipelineDefinition,
        record: &Arc<Mutex<ExecutionRecord>>,
        execution_id: Uuid,
        phase: Phase,
        message: String,
    ) -> Result<(), EtlError> {
        record.lock().push_error(phase, &message);
        self.events.emit(&PipelineEvent::BatchFailed {
            pipeline_id: definition.id.clone(),
            execution_id,
            phase,
            error: message.clone(),
        });

        if definition.config.stop_on_error {
            return Err(StageError::new(
                phase,
                &definition.id,
                "stop_on_error is set; aborting after first failure",
            )
            .into());
        }

        let recorded = record.lock().errors.len();
        if recorded >= definition.config.max_errors {
            return Err(StageError::new(
                phase,
                &definition.id,
                format!(
                    "maximum error count ({}) reached",
                    definition.config.max_errors
                ),
            )
            .into());
        }

        Ok(())
    }

    /// Lazily runs a stage's `initialize` the first time its phase is
    /// entered. Initialization failures are terminal even in
    /// continue-on-error mode.
    async fn ensure_initialized(
        &self,
        definition: &PipelineDefinition,
        ctx: &StageContext,
        initialized: &Arc<Mutex<Vec<Phase>>>,
        phase: Phase,
    ) -> Result<(), EtlError> {
        if initialized.lock().contains(&phase) {
            return Ok(());
        }

        let result = match phase {
            Phase::Extract => definition.extractor.initialize(ctx).await,
            Phase::Transform => definition.transformer.initialize(ctx).await,
            Phase::Load => definition.loader.initialize(ctx).await,
            Phase::Cleanup => Ok(()),
        };
        result.map_err(|e| StageError::wrap(phase, &definition.id, &e))?;

        initialized.lock().push(phase);
        Ok(())
    }

    /// Best-effort cleanup of every initialized stage, in LIFO order.
    /// Errors are logged and counted, never escalated.
    async fn run_cleanup(
        &self,
        definition: &PipelineDefinition,
        ctx: &StageContext,
        initialized: &Arc<Mutex<Vec<Phase>>>,
        record: &Arc<Mutex<ExecutionRecord>>,
    ) {
        let mut phases = initialized.lock().clone();
        phases.reverse();

        for phase in phases {
            let (stage_name, result) = match phase {
                Phase::Extract => (
                    definition.extractor.name().to_string(),
                    definition.extractor.cleanup(ctx).await,
                ),
                Phase::Transform => (
                    definition.transformer.name().to_string(),
                    definition.transformer.cleanup(ctx).await,
                ),
                Phase::Load => (
                    definition.loader.name().to_string(),
                    definition.loader.cleanup(ctx).await,
                ),
                Phase::Cleanup => continue,
            };

            if let Err(err) = result {
                self.metrics.inc_cleanup_failures();
                record
                    .lock()
                    .push_error(Phase::Cleanup, format!("{stage_name}: {err:#}"));
                self.events.emit(&PipelineEvent::CleanupFailed {
                    pipeline_id: definition.id.clone(),
                    execution_id: ctx.execution_id(),
                    stage: stage_name.clone(),
                    error: format!("{err:#}"),
                });
                tracing::warn!(
                    pipeline_id = %definition.id,
                    stage = %stage_name,
                    error = %format!("{err:#}"),
                    "stage cleanup failed"
                );
            }
        }
    }

    fn check_cancelled(
        &self,
        definition: &PipelineDefinition,
        ctx: &StageContext,
        initialized: &Arc<Mutex<Vec<Phase>>>,
    ) -> Result<(), EtlError> {
        if ctx.is_cancelled() {
            let reason = ctx_reason(ctx);
            return Err(StageError::new(
                current_phase(initialized),
                &definition.id,
                format!("execution stopped: {reason}"),
            )
            .into());
        }
        Ok(())
    }

    fn emit_batch_completed(
        &self,
        definition: &PipelineDefinition,
        execution_id: Uuid,
        index: usize,
        records: usize,
        record: &Arc<Mutex<ExecutionRecord>>,
        total: Option<u64>,
    ) {
        let progress_pct = total.filter(|t| *t > 0).map(|t| {
            let done = {
                let rec = record.lock();
                rec.counts.succeeded + rec.counts.failed
            };
            (done as f64 / t as f64 * 100.0).min(100.0)
        });

        self.events.emit(&PipelineEvent::BatchCompleted {
            pipeline_id: definition.id.clone(),
            execution_id,
            batch_index: index,
            records,
            progress_pct,
        });
    }

    fn emit_status(&self, pipeline_id: &str, execution_id: Uuid, status: ExecutionStatus) {
        self.events.emit(&PipelineEvent::StatusChanged {
            pipeline_id: pipeline_id.to_string(),
            execution_id,
            status,
            at: Utc::now(),
        });
    }
}

fn current_phase(initialized: &Arc<Mutex<Vec<Phase>>>) -> Phase {
    initialized.lock().last().copied().unwrap_or(Phase::Extract)
}

fn ctx_reason(ctx: &StageContext) -> String {
    // The cancel flag's reason travels with the context.
    ctx.cancel_reason()
        .unwrap_or_else(|| "cancelled".to_string())
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}
