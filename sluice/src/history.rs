//! Execution history: persists finalized execution records and enforces
//! count- and age-based retention.

use crate::errors::EtlError;
use crate::executor::record::ExecutionRecord;
use crate::store::{history_key, StateStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// History retention knobs.
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// Age window for records; older entries are evicted by the sweep.
    pub retention: Duration,
    /// Hard cap on retained records; oldest-first eviction on write.
    pub max_count: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            max_count: 1000,
        }
    }
}

impl HistoryConfig {
    /// Creates a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the age window.
    #[must_use]
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Sets the record cap.
    #[must_use]
    pub fn with_max_count(mut self, max_count: usize) -> Self {
        self.max_count = max_count.max(1);
        self
    }
}

/// Persists execution records into the state store.
#[derive(Debug)]
pub struct HistoryRecorder {
    store: Arc<dyn StateStore>,
    prefix: String,
    config: HistoryConfig,
}

impl HistoryRecorder {
    /// Creates a recorder over the given store and key prefix.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, prefix: impl Into<String>, mut config: HistoryConfig) -> Self {
        config.max_count = config.max_count.max(1);
        Self {
            store,
            prefix: prefix.into(),
            config,
        }
    }

    /// The configured age window.
    #[must_use]
    pub fn retention(&self) -> Duration {
        self.config.retention
    }

    /// Persists a finalized record, then enforces the count cap with
    /// oldest-first eviction.
    pub async fn record(&self, record: &ExecutionRecord) -> Result<(), EtlError> {
        let key = history_key(&self.prefix, &record.execution_id.to_string());
        let value = serde_json::to_value(record)?;
        self.store
            .set(&key, value, Some(self.config.retention))
            .await?;
        self.enforce_max_count().await
    }

    /// Reads records newest-first, optionally filtered by pipeline.
    pub async fn history(
        &self,
        pipeline_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, EtlError> {
        let mut records = self.load_all().await?;
        if let Some(id) = pipeline_id {
            records.retain(|(_, record)| record.pipeline_id == id);
        }
        records.sort_by(|a, b| b.1.started_at.cmp(&a.1.started_at));
        records.truncate(limit);
        Ok(records.into_iter().map(|(_, record)| record).collect())
    }

    /// Deletes records whose start time predates `cutoff`. Returns the
    /// number evicted. Idempotent; safe alongside active executions.
    pub async fn evict_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, EtlError> {
        let mut evicted = 0;
        for (key, record) in self.load_all().await? {
            if record.started_at < cutoff && self.store.delete(&key).await? {
                evicted += 1;
            }
        }
        Ok(evicted)
    }

    async fn enforce_max_count(&self) -> Result<(), EtlError> {
        let keys = self
            .store
            .list_keys(&history_key(&self.prefix, "*"))
            .await?;
        if keys.len() <= self.config.max_count {
            return Ok(());
        }

        let mut records = self.load_all().await?;
        records.sort_by(|a, b| a.1.started_at.cmp(&b.1.started_at));
        let excess = records.len().saturating_sub(self.config.max_count);
        for (key, record) in records.into_iter().take(excess) {
            tracing::debug!(
                execution_id = %record.execution_id,
                "history record evicted by count cap"
            );
            self.store.delete(&key).await?;
        }
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<(String, ExecutionRecord)>, EtlError> {
        let keys = self
            .store
            .list_keys(&history_key(&self.prefix, "*"))
            .await?;

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(value) = self.store.get(&key).await? else {
                continue;
            };
            // Unparseable entries are skipped rather than poisoning reads.
            match serde_json::from_value::<ExecutionRecord>(value) {
                Ok(record) => records.push((key, record)),
                Err(err) => {
                    tracing::warn!(key, error = %err, "skipping malformed history record");
                }
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::record::ExecutionStatus;
    use crate::store::MemoryStore;

    fn recorder(config: HistoryConfig) -> HistoryRecorder {
        HistoryRecorder::new(Arc::new(MemoryStore::new()), "etl", config)
    }

    fn finished_record(pipeline_id: &str, started_at: DateTime<Utc>) -> ExecutionRecord {
        let mut record = ExecutionRecord::begin(pipeline_id);
        record.started_at = started_at;
        record.finish(ExecutionStatus::Completed);
        record
    }

    #[tokio::test]
    async fn test_record_and_read_newest_first() {
        let recorder = recorder(HistoryConfig::default());
        let now = Utc::now();

        for minutes in [30, 10, 20] {
            let record = finished_record("p", now - chrono::Duration::minutes(minutes));
            recorder.record(&record).await.unwrap();
        }

        let history = recorder.history(None, 10).await.unwrap();
        assert_eq!(history.len(), 3);
        assert!(history[0].started_at > history[1].started_at);
        assert!(history[1].started_at > history[2].started_at);
    }

    #[tokio::test]
    async fn test_history_filters_by_pipeline_and_limit() {
        let recorder = recorder(HistoryConfig::default());
        let now = Utc::now();

        for i in 0..4 {
            let id = if i % 2 == 0 { "even" } else { "odd" };
            recorder
                .record(&finished_record(id, now - chrono::Duration::minutes(i)))
                .await
                .unwrap();
        }

        let even = recorder.history(Some("even"), 10).await.unwrap();
        assert_eq!(even.len(), 2);
        assert!(even.iter().all(|r| r.pipeline_id == "even"));

        let limited = recorder.history(None, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_count_cap_evicts_oldest_first() {
        let recorder = recorder(HistoryConfig::new().with_max_count(2));
        let now = Utc::now();

        for minutes in [50, 40, 30] {
            recorder
                .record(&finished_record("p", now - chrono::Duration::minutes(minutes)))
                .await
                .unwrap();
        }

        let history = recorder.history(None, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        // The 50-minute-old record is gone.
        assert!(history
            .iter()
            .all(|r| r.started_at > now - chrono::Duration::minutes(45)));
    }

    #[tokio::test]
    async fn test_age_eviction_only_removes_older_than_cutoff() {
        let recorder = recorder(HistoryConfig::default());
        let now = Utc::now();

        // Five records spaced evenly across 100 minutes.
        for minutes in [100, 80, 60, 40, 20] {
            recorder
                .record(&finished_record("p", now - chrono::Duration::minutes(minutes)))
                .await
                .unwrap();
        }

        let cutoff = now - chrono::Duration::minutes(50);
        let evicted = recorder.evict_older_than(cutoff).await.unwrap();
        assert_eq!(evicted, 3);

        let remaining = recorder.history(None, 10).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|r| r.started_at >= cutoff));

        // Idempotent: a second sweep finds nothing.
        assert_eq!(recorder.evict_older_than(cutoff).await.unwrap(), 0);
    }
}
