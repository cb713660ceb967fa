//! Mock stages and helpers for exercising the engine in tests.
//!
//! These are also useful to consumers writing their own pipeline tests,
//! so the module is compiled into the library rather than gated behind
//! `cfg(test)`.

use crate::stages::{
    ExtractOutput, Extractor, LoadReport, Loader, Record, StageContext, StageMetrics, Transformer,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared, ordered log of lifecycle calls across stages. Used to assert
/// call ordering (dependencies, cleanup) in tests.
#[derive(Debug, Default)]
pub struct CallLog {
    entries: Mutex<Vec<(String, Instant)>>,
}

impl CallLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Appends a labelled entry stamped with now.
    pub fn note(&self, label: impl Into<String>) {
        self.entries.lock().push((label.into(), Instant::now()));
    }

    /// The labels in call order.
    #[must_use]
    pub fn labels(&self) -> Vec<String> {
        self.entries.lock().iter().map(|(l, _)| l.clone()).collect()
    }

    /// The instant a label was first recorded.
    #[must_use]
    pub fn instant_of(&self, label: &str) -> Option<Instant> {
        self.entries
            .lock()
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, at)| *at)
    }

    /// True when `earlier` was recorded before `later`.
    #[must_use]
    pub fn happened_before(&self, earlier: &str, later: &str) -> bool {
        match (self.instant_of(earlier), self.instant_of(later)) {
            (Some(a), Some(b)) => a <= b,
            _ => false,
        }
    }
}

fn note(log: &Option<Arc<CallLog>>, name: &str, what: &str) {
    if let Some(log) = log {
        log.note(format!("{name}.{what}"));
    }
}

/// An extractor returning a configured finite batch.
#[derive(Debug)]
pub struct StaticExtractor {
    name: String,
    records: Vec<Record>,
    total: Option<u64>,
    delay: Option<Duration>,
    fail_cleanup: bool,
    calls: Mutex<usize>,
    log: Option<Arc<CallLog>>,
}

impl StaticExtractor {
    /// Creates an extractor yielding `records` on every run.
    #[must_use]
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            name: "static-extractor".to_string(),
            records,
            total: None,
            delay: None,
            fail_cleanup: false,
            calls: Mutex::new(0),
            log: None,
        }
    }

    /// Sets the stage name used in logs and call labels.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Reports a known total count, enabling progress percentages.
    #[must_use]
    pub fn with_total_count(mut self, total: u64) -> Self {
        self.total = Some(total);
        self
    }

    /// Sleeps before returning, to keep executions in flight.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Makes `cleanup` fail, for leak-signal tests.
    #[must_use]
    pub fn with_failing_cleanup(mut self) -> Self {
        self.fail_cleanup = true;
        self
    }

    /// Attaches a shared call log.
    #[must_use]
    pub fn with_log(mut self, log: Arc<CallLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// Number of `extract` calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl Extractor for StaticExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self, _ctx: &StageContext) -> anyhow::Result<()> {
        note(&self.log, &self.name, "initialize");
        Ok(())
    }

    async fn extract(&self, _ctx: &StageContext) -> anyhow::Result<ExtractOutput> {
        *self.calls.lock() += 1;
        note(&self.log, &self.name, "extract");
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(ExtractOutput::Batch(self.records.clone()))
    }

    async fn total_count(&self, _ctx: &StageContext) -> Option<u64> {
        self.total
    }

    async fn cleanup(&self, _ctx: &StageContext) -> anyhow::Result<()> {
        note(&self.log, &self.name, "cleanup");
        if self.fail_cleanup {
            anyhow::bail!("cleanup connection already closed");
        }
        Ok(())
    }

    fn metrics(&self) -> StageMetrics {
        StageMetrics {
            invocations: self.calls() as u64,
            records: (self.calls() * self.records.len()) as u64,
            failures: 0,
        }
    }
}

/// An extractor yielding records lazily as a stream, optionally
/// injecting element errors.
#[derive(Debug)]
pub struct StreamingExtractor {
    name: String,
    records: Vec<Record>,
    error_at: Option<usize>,
}

impl StreamingExtractor {
    /// Creates a streaming extractor over `records`.
    #[must_use]
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            name: "streaming-extractor".to_string(),
            records,
            error_at: None,
        }
    }

    /// Injects an element error at the given index.
    #[must_use]
    pub fn with_error_at(mut self, index: usize) -> Self {
        self.error_at = Some(index);
        self
    }
}

#[async_trait]
impl Extractor for StreamingExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn extract(&self, _ctx: &StageContext) -> anyhow::Result<ExtractOutput> {
        let error_at = self.error_at;
        let items: Vec<anyhow::Result<Record>> = self
            .records
            .clone()
            .into_iter()
            .enumerate()
            .map(move |(i, record)| {
                if error_at == Some(i) {
                    Err(anyhow::anyhow!("source hiccup at element {i}"))
                } else {
                    Ok(record)
                }
            })
            .collect();
        Ok(ExtractOutput::stream(Box::pin(futures::stream::iter(items))))
    }
}

/// An extractor that fails a configured number of times before
/// succeeding; exercises retry/backoff.
#[derive(Debug)]
pub struct FlakyExtractor {
    name: String,
    failures_before_success: usize,
    records: Vec<Record>,
    calls: Mutex<usize>,
}

impl FlakyExtractor {
    /// Fails the first `failures_before_success` calls, then yields
    /// `records`.
    #[must_use]
    pub fn new(failures_before_success: usize, records: Vec<Record>) -> Self {
        Self {
            name: "flaky-extractor".to_string(),
            failures_before_success,
            records,
            calls: Mutex::new(0),
        }
    }

    /// Number of `extract` calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl Extractor for FlakyExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn extract(&self, _ctx: &StageContext) -> anyhow::Result<ExtractOutput> {
        let call = {
            let mut calls = self.calls.lock();
            *calls += 1;
            *calls
        };
        if call <= self.failures_before_success {
            anyhow::bail!("transient source failure (attempt {call})");
        }
        Ok(ExtractOutput::Batch(self.records.clone()))
    }
}

/// A transformer passing records through unchanged.
#[derive(Debug)]
pub struct IdentityTransformer {
    name: String,
    calls: Mutex<usize>,
    log: Option<Arc<CallLog>>,
}

impl IdentityTransformer {
    /// Creates an identity transformer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: "identity-transformer".to_string(),
            calls: Mutex::new(0),
            log: None,
        }
    }

    /// Sets the stage name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Attaches a shared call log.
    #[must_use]
    pub fn with_log(mut self, log: Arc<CallLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// Number of `transform` calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

impl Default for IdentityTransformer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transformer for IdentityTransformer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self, _ctx: &StageContext) -> anyhow::Result<()> {
        note(&self.log, &self.name, "initialize");
        Ok(())
    }

    async fn transform(
        &self,
        _ctx: &StageContext,
        batch: Vec<Record>,
    ) -> anyhow::Result<Vec<Record>> {
        *self.calls.lock() += 1;
        note(&self.log, &self.name, "transform");
        Ok(batch)
    }

    async fn cleanup(&self, _ctx: &StageContext) -> anyhow::Result<()> {
        note(&self.log, &self.name, "cleanup");
        Ok(())
    }
}

/// A transformer applying a function to each record.
pub struct MappingTransformer<F>
where
    F: Fn(Record) -> Record + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> MappingTransformer<F>
where
    F: Fn(Record) -> Record + Send + Sync,
{
    /// Creates a transformer applying `func` per record.
    pub fn new(func: F) -> Self {
        Self {
            name: "mapping-transformer".to_string(),
            func,
        }
    }
}

impl<F> std::fmt::Debug for MappingTransformer<F>
where
    F: Fn(Record) -> Record + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappingTransformer")
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
impl<F> Transformer for MappingTransformer<F>
where
    F: Fn(Record) -> Record + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn transform(
        &self,
        _ctx: &StageContext,
        batch: Vec<Record>,
    ) -> anyhow::Result<Vec<Record>> {
        Ok(batch.into_iter().map(&self.func).collect())
    }
}

/// A transformer that always fails.
#[derive(Debug)]
pub struct FailingTransformer {
    name: String,
    message: String,
}

impl FailingTransformer {
    /// Creates a transformer failing with `message`.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: "failing-transformer".to_string(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Transformer for FailingTransformer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn transform(
        &self,
        _ctx: &StageContext,
        _batch: Vec<Record>,
    ) -> anyhow::Result<Vec<Record>> {
        anyhow::bail!("{}", self.message)
    }
}

/// A loader recording every batch it receives; all records succeed.
#[derive(Debug)]
pub struct RecordingLoader {
    name: String,
    batches: Mutex<Vec<Vec<Record>>>,
    log: Option<Arc<CallLog>>,
    fail_cleanup: bool,
}

impl RecordingLoader {
    /// Creates a recording loader.
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: "recording-loader".to_string(),
            batches: Mutex::new(Vec::new()),
            log: None,
            fail_cleanup: false,
        }
    }

    /// Sets the stage name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Attaches a shared call log.
    #[must_use]
    pub fn with_log(mut self, log: Arc<CallLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// Makes `cleanup` fail, for leak-signal tests.
    #[must_use]
    pub fn with_failing_cleanup(mut self) -> Self {
        self.fail_cleanup = true;
        self
    }

    /// The batches received so far.
    #[must_use]
    pub fn batches(&self) -> Vec<Vec<Record>> {
        self.batches.lock().clone()
    }

    /// Number of `load` calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.batches.lock().len()
    }

    /// All loaded records, flattened in arrival order.
    #[must_use]
    pub fn records(&self) -> Vec<Record> {
        self.batches.lock().iter().flatten().cloned().collect()
    }
}

impl Default for RecordingLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Loader for RecordingLoader {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self, _ctx: &StageContext) -> anyhow::Result<()> {
        note(&self.log, &self.name, "initialize");
        Ok(())
    }

    async fn load(&self, _ctx: &StageContext, batch: Vec<Record>) -> anyhow::Result<LoadReport> {
        note(&self.log, &self.name, "load");
        let count = batch.len();
        self.batches.lock().push(batch);
        Ok(LoadReport::all_successful(count))
    }

    async fn cleanup(&self, _ctx: &StageContext) -> anyhow::Result<()> {
        note(&self.log, &self.name, "cleanup");
        if self.fail_cleanup {
            anyhow::bail!("destination handle leak");
        }
        Ok(())
    }
}

/// A loader rejecting a fixed number of records per batch.
#[derive(Debug)]
pub struct RejectingLoader {
    name: String,
    reject_per_batch: usize,
}

impl RejectingLoader {
    /// Rejects up to `reject_per_batch` records from each batch.
    #[must_use]
    pub fn new(reject_per_batch: usize) -> Self {
        Self {
            name: "rejecting-loader".to_string(),
            reject_per_batch,
        }
    }
}

#[async_trait]
impl Loader for RejectingLoader {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self, _ctx: &StageContext, batch: Vec<Record>) -> anyhow::Result<LoadReport> {
        let failed = self.reject_per_batch.min(batch.len());
        Ok(LoadReport {
            successful: batch.len() - failed,
            failed,
            upserted: 0,
        })
    }
}

/// A loader that always fails.
#[derive(Debug)]
pub struct FailingLoader {
    name: String,
}

impl FailingLoader {
    /// Creates a loader that always fails.
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: "failing-loader".to_string(),
        }
    }
}

impl Default for FailingLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Loader for FailingLoader {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self, _ctx: &StageContext, _batch: Vec<Record>) -> anyhow::Result<LoadReport> {
        anyhow::bail!("destination unavailable")
    }
}

/// Installs a test subscriber for tracing output. Safe to call from
/// every test; only the first call wins.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}
