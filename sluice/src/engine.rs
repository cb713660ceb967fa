//! The engine facade: registry, executor, state store, history,
//! retention sweeps, and the schedule loop behind one surface.

use crate::errors::EtlError;
use crate::events::{EventSink, NoOpEventSink};
use crate::executor::admission::AdmissionControl;
use crate::executor::record::{ExecutionRecord, ExecutionSummary};
use crate::executor::PipelineExecutor;
use crate::history::{HistoryConfig, HistoryRecorder};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::registry::{PipelineRegistry, PipelineSpec};
use crate::store::{CheckpointConfig, CheckpointManager, StateStore};
use crate::sweeper::SweeperHandle;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Engine-level configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Global cap on concurrently running pipelines.
    pub max_concurrency: usize,
    /// Namespace prefix for all state-store keys.
    pub key_prefix: String,
    /// Per-execution timeout; `None` disables it.
    pub execution_timeout: Option<Duration>,
    /// History retention settings.
    pub history: HistoryConfig,
    /// Checkpoint settings (shorter retention than history by default).
    pub checkpoints: CheckpointConfig,
    /// Interval between retention sweep ticks.
    pub sweep_interval: Duration,
    /// Interval between schedule scans.
    pub scheduler_tick: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            key_prefix: "sluice".to_string(),
            execution_timeout: None,
            history: HistoryConfig::default(),
            checkpoints: CheckpointConfig::default(),
            sweep_interval: Duration::from_secs(60),
            scheduler_tick: Duration::from_secs(1),
        }
    }
}

impl EngineConfig {
    /// Creates a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the global concurrency cap.
    #[must_use]
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Sets the state-store key prefix.
    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Sets the per-execution timeout.
    #[must_use]
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }

    /// Sets history retention.
    #[must_use]
    pub fn with_history(mut self, history: HistoryConfig) -> Self {
        self.history = history;
        self
    }

    /// Sets checkpoint behavior.
    #[must_use]
    pub fn with_checkpoints(mut self, checkpoints: CheckpointConfig) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    /// Sets the sweep interval.
    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Sets the scheduler scan interval.
    #[must_use]
    pub fn with_scheduler_tick(mut self, tick: Duration) -> Self {
        self.scheduler_tick = tick;
        self
    }
}

/// Observable state of a registered pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    /// Registered, not running, not paused.
    Idle,
    /// Currently holds a running-set token.
    Running,
    /// Excluded from scheduled firing.
    Paused,
}

/// Read-only status snapshot for one pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    /// Pipeline id.
    pub id: String,
    /// Current state; `Running` wins over `Paused`.
    pub state: PipelineState,
    /// Schedule expression, if any.
    pub schedule: Option<String>,
    /// Dependency pipeline ids.
    pub dependencies: Vec<String>,
    /// Registration time.
    pub created_at: DateTime<Utc>,
    /// Start time of the most recent run.
    pub last_run: Option<DateTime<Utc>>,
    /// Number of runs started.
    pub run_count: u64,
}

/// Engine liveness snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    /// The engine never reports unhealthy while the process lives; the
    /// field exists so callers can alert on the serialized shape.
    pub healthy: bool,
    /// Pipelines registered.
    pub registered_pipelines: usize,
    /// Executions running right now.
    pub running_executions: usize,
    /// Pipelines currently paused.
    pub paused_pipelines: usize,
    /// Configured concurrency cap.
    pub max_concurrency: usize,
    /// Whether the sweeps and scheduler are running.
    pub background_started: bool,
}

#[derive(Debug)]
struct Background {
    sweeper: SweeperHandle,
    scheduler: JoinHandle<()>,
}

/// The ETL orchestration engine.
pub struct EtlEngine {
    config: EngineConfig,
    registry: Arc<PipelineRegistry>,
    admission: Arc<AdmissionControl>,
    executor: PipelineExecutor,
    history: Arc<HistoryRecorder>,
    checkpoints: Arc<CheckpointManager>,
    metrics: Arc<EngineMetrics>,
    paused: RwLock<HashSet<String>>,
    background: Mutex<Option<Background>>,
}

impl std::fmt::Debug for EtlEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtlEngine")
            .field("registered", &self.registry.len())
            .field("running", &self.admission.running_count())
            .field("max_concurrency", &self.config.max_concurrency)
            .finish()
    }
}

impl EtlEngine {
    /// Creates an engine over the given store with no event sink.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, config: EngineConfig) -> Arc<Self> {
        Self::with_events(store, config, Arc::new(NoOpEventSink))
    }

    /// Creates an engine delivering execution events to `events`.
    #[must_use]
    pub fn with_events(
        store: Arc<dyn StateStore>,
        config: EngineConfig,
        events: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        let admission = AdmissionControl::new(config.max_concurrency);
        let registry = Arc::new(PipelineRegistry::new(admission.clone()));
        let metrics = Arc::new(EngineMetrics::new());
        let history = Arc::new(HistoryRecorder::new(
            store.clone(),
            config.key_prefix.clone(),
            config.history.clone(),
        ));
        let checkpoints = Arc::new(CheckpointManager::new(
            store,
            config.key_prefix.clone(),
            config.checkpoints.clone(),
        ));
        let executor = PipelineExecutor::new(
            registry.clone(),
            admission.clone(),
            history.clone(),
            checkpoints.clone(),
            events,
            metrics.clone(),
            config.execution_timeout,
        );

        Arc::new(Self {
            config,
            registry,
            admission,
            executor,
            history,
            checkpoints,
            metrics,
            paused: RwLock::new(HashSet::new()),
            background: Mutex::new(None),
        })
    }

    /// Starts the retention sweeps and the schedule loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut background = self.background.lock();
        if background.is_some() {
            return;
        }

        let sweeper = SweeperHandle::spawn(
            self.history.clone(),
            self.checkpoints.clone(),
            self.config.sweep_interval,
        );

        let weak = Arc::downgrade(self);
        let tick = self.config.scheduler_tick.max(Duration::from_millis(10));
        let scheduler = tokio::spawn(async move {
            let mut next_fire: HashMap<String, DateTime<Utc>> = HashMap::new();
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(engine) = weak.upgrade() else { break };
                engine.scheduler_pass(&mut next_fire);
            }
        });

        *background = Some(Background { sweeper, scheduler });
        tracing::info!("engine background tasks started");
    }

    /// Stops the sweeps and the schedule loop. Running executions are
    /// not interrupted.
    pub fn shutdown(&self) {
        if let Some(mut background) = self.background.lock().take() {
            background.sweeper.shutdown();
            background.scheduler.abort();
            tracing::info!("engine background tasks stopped");
        }
    }

    /// One schedule scan: fire every due, unpaused pipeline. Admission
    /// rejections are benign here — the next tick retries.
    fn scheduler_pass(self: &Arc<Self>, next_fire: &mut HashMap<String, DateTime<Utc>>) {
        let now = Utc::now();
        for definition in self.registry.list() {
            let Some(schedule) = definition.schedule.clone() else {
                continue;
            };
            if self.paused.read().contains(&definition.id) {
                continue;
            }

            let due = next_fire
                .entry(definition.id.clone())
                .or_insert_with(|| schedule.next_after(now));
            if *due > now {
                continue;
            }
            *due = schedule.next_after(now);

            let engine = self.clone();
            let id = definition.id.clone();
            tokio::spawn(async move {
                match engine.execute_pipeline(&id).await {
                    Ok(summary) => {
                        tracing::debug!(
                            pipeline_id = %id,
                            status = ?summary.status,
                            "scheduled run finished"
                        );
                    }
                    Err(err) if err.is_admission() => {
                        tracing::debug!(pipeline_id = %id, error = %err, "scheduled run deferred");
                    }
                    Err(err) => {
                        tracing::warn!(pipeline_id = %id, error = %err, "scheduled run failed");
                    }
                }
            });
        }

        next_fire.retain(|id, _| self.registry.contains(id));
    }

    /// Registers a pipeline definition.
    pub fn register_pipeline(&self, spec: PipelineSpec) -> Result<(), EtlError> {
        self.registry.register(spec)
    }

    /// Removes a pipeline; refused while it is running.
    pub fn remove_pipeline(&self, id: &str) -> Result<bool, EtlError> {
        let removed = self.registry.remove(id)?;
        self.paused.write().remove(id);
        Ok(removed)
    }

    /// Executes one pipeline on demand.
    pub async fn execute_pipeline(&self, id: &str) -> Result<ExecutionSummary, EtlError> {
        self.executor.execute(id).await
    }

    /// Executes a pipeline after its full dependency closure.
    pub async fn execute_with_dependencies(
        &self,
        id: &str,
    ) -> Result<ExecutionSummary, EtlError> {
        self.executor.execute_with_dependencies(id).await
    }

    /// Excludes a pipeline from scheduled firing. On-demand execution
    /// stays available. Returns false for unknown ids.
    pub fn pause_pipeline(&self, id: &str) -> bool {
        if !self.registry.contains(id) {
            return false;
        }
        self.paused.write().insert(id.to_string())
    }

    /// Re-enables scheduled firing. Returns false when the id was not
    /// paused.
    pub fn resume_pipeline(&self, id: &str) -> bool {
        self.paused.write().remove(id)
    }

    /// Cooperatively cancels the in-flight run of a pipeline. The run
    /// finalizes as failed; stages that ignore the flag keep running
    /// detached but their results are discarded. Returns false when
    /// nothing is running under the id.
    pub fn stop_pipeline(&self, id: &str) -> bool {
        self.admission.cancel(id, "stopped by operator")
    }

    /// Status snapshot for one pipeline; `None` for unknown ids.
    #[must_use]
    pub fn pipeline_status(&self, id: &str) -> Option<PipelineStatus> {
        let definition = self.registry.get(id)?;
        let state = if self.admission.is_running(id) {
            PipelineState::Running
        } else if self.paused.read().contains(id) {
            PipelineState::Paused
        } else {
            PipelineState::Idle
        };
        Some(PipelineStatus {
            id: definition.id,
            state,
            schedule: definition.schedule.map(|s| s.expression().to_string()),
            dependencies: definition.dependencies,
            created_at: definition.created_at,
            last_run: definition.last_run,
            run_count: definition.run_count,
        })
    }

    /// Status snapshots for every registered pipeline, sorted by id.
    /// Empty when nothing is registered — never an error.
    #[must_use]
    pub fn list_pipelines(&self) -> Vec<PipelineStatus> {
        self.registry
            .list()
            .into_iter()
            .filter_map(|definition| self.pipeline_status(&definition.id))
            .collect()
    }

    /// Execution history, newest first, optionally filtered by pipeline.
    /// Store errors are logged and yield an empty list — reads never
    /// raise.
    pub async fn pipeline_history(
        &self,
        pipeline_id: Option<&str>,
        limit: usize,
    ) -> Vec<ExecutionRecord> {
        match self.history.history(pipeline_id, limit).await {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(error = %err, "history read failed; returning empty");
                Vec::new()
            }
        }
    }

    /// Engine liveness snapshot.
    #[must_use]
    pub fn health(&self) -> EngineHealth {
        EngineHealth {
            healthy: true,
            registered_pipelines: self.registry.len(),
            running_executions: self.admission.running_count(),
            paused_pipelines: self.paused.read().len(),
            max_concurrency: self.config.max_concurrency,
            background_started: self.background.lock().is_some(),
        }
    }

    /// Counter snapshot.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics
            .snapshot(self.admission.running_count(), self.registry.len())
    }

    /// The checkpoint manager, for out-of-band inspection and replay.
    #[must_use]
    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    /// The registry, for direct lookups.
    #[must_use]
    pub fn registry(&self) -> &Arc<PipelineRegistry> {
        &self.registry
    }
}

impl Drop for EtlEngine {
    fn drop(&mut self) {
        if let Some(mut background) = self.background.lock().take() {
            background.sweeper.shutdown();
            background.scheduler.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PipelineSpec;
    use crate::store::MemoryStore;
    use crate::testing::{IdentityTransformer, RecordingLoader, StaticExtractor};
    use serde_json::json;

    fn engine() -> Arc<EtlEngine> {
        EtlEngine::new(Arc::new(MemoryStore::new()), EngineConfig::default())
    }

    fn simple_spec(id: &str, records: Vec<serde_json::Value>) -> PipelineSpec {
        PipelineSpec::new(id)
            .with_extractor(Arc::new(StaticExtractor::new(records)))
            .with_transformer(Arc::new(IdentityTransformer::new()))
            .with_loader(Arc::new(RecordingLoader::new()))
    }

    #[tokio::test]
    async fn test_pause_resume_and_unknown_ids() {
        let engine = engine();
        engine
            .register_pipeline(simple_spec("p", vec![json!({"id": 1})]))
            .unwrap();

        assert!(!engine.pause_pipeline("ghost"));
        assert!(!engine.stop_pipeline("ghost"));
        assert!(!engine.resume_pipeline("p"));

        assert!(engine.pause_pipeline("p"));
        assert_eq!(
            engine.pipeline_status("p").unwrap().state,
            PipelineState::Paused
        );
        assert!(engine.resume_pipeline("p"));
        assert_eq!(
            engine.pipeline_status("p").unwrap().state,
            PipelineState::Idle
        );
    }

    #[tokio::test]
    async fn test_paused_pipeline_still_runs_on_demand() {
        let engine = engine();
        engine
            .register_pipeline(simple_spec("p", vec![json!({"id": 1})]))
            .unwrap();
        engine.pause_pipeline("p");

        let summary = engine.execute_pipeline("p").await.unwrap();
        assert_eq!(summary.records_processed, 1);
    }

    #[tokio::test]
    async fn test_health_and_metrics_reflect_activity() {
        let engine = engine();
        engine
            .register_pipeline(simple_spec("p", vec![json!({"id": 1}), json!({"id": 2})]))
            .unwrap();

        engine.execute_pipeline("p").await.unwrap();

        let health = engine.health();
        assert!(health.healthy);
        assert_eq!(health.registered_pipelines, 1);
        assert_eq!(health.running_executions, 0);
        assert!(!health.background_started);

        let metrics = engine.metrics();
        assert_eq!(metrics.runs_started, 1);
        assert_eq!(metrics.runs_completed, 1);
        assert_eq!(metrics.records_loaded, 2);
    }

    #[tokio::test]
    async fn test_list_pipelines_never_errors_on_empty() {
        let engine = engine();
        assert!(engine.list_pipelines().is_empty());
        assert!(engine.pipeline_history(None, 10).await.is_empty());
        assert!(engine.pipeline_status("nope").is_none());
    }

    #[tokio::test]
    async fn test_history_readable_through_facade() {
        let engine = engine();
        engine
            .register_pipeline(simple_spec("p", vec![json!({"id": 1})]))
            .unwrap();

        engine.execute_pipeline("p").await.unwrap();
        engine.execute_pipeline("p").await.unwrap();

        let history = engine.pipeline_history(Some("p"), 10).await;
        assert_eq!(history.len(), 2);

        let limited = engine.pipeline_history(None, 1).await;
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_clears_paused_mark() {
        let engine = engine();
        engine
            .register_pipeline(simple_spec("p", vec![]))
            .unwrap();
        engine.pause_pipeline("p");

        assert!(engine.remove_pipeline("p").unwrap());
        assert_eq!(engine.health().paused_pipelines, 0);
    }

    #[tokio::test]
    async fn test_scheduler_fires_due_pipeline() {
        let engine = EtlEngine::new(
            Arc::new(MemoryStore::new()),
            EngineConfig::new().with_scheduler_tick(Duration::from_millis(50)),
        );
        engine
            .register_pipeline(
                simple_spec("ticker", vec![json!({"tick": true})]).with_schedule("@every 1s"),
            )
            .unwrap();
        engine.start();
        assert!(engine.health().background_started);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        engine.shutdown();

        let status = engine.pipeline_status("ticker").unwrap();
        assert!(status.run_count >= 1, "scheduled run never fired");
    }

    #[tokio::test]
    async fn test_scheduler_skips_paused_pipeline() {
        let engine = EtlEngine::new(
            Arc::new(MemoryStore::new()),
            EngineConfig::new().with_scheduler_tick(Duration::from_millis(50)),
        );
        engine
            .register_pipeline(
                simple_spec("ticker", vec![json!({"tick": true})]).with_schedule("@every 1s"),
            )
            .unwrap();
        engine.pause_pipeline("ticker");
        engine.start();

        tokio::time::sleep(Duration::from_millis(1600)).await;
        engine.shutdown();

        assert_eq!(engine.pipeline_status("ticker").unwrap().run_count, 0);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let engine = engine();
        engine.start();
        engine.start();
        engine.shutdown();
        assert!(!engine.health().background_started);
    }
}
