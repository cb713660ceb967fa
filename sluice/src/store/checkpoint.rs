//! Checkpoint persistence: resumable progress markers with optional
//! gzip compression and a size cap.
//!
//! Checkpoints are independent of execution history and expire on a
//! shorter retention window. An oversized payload is a soft failure: the
//! save is skipped with a warning and the run continues.

use super::{checkpoint_key, StateStore};
use crate::errors::EtlError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

/// Envelope marker for compressed payloads.
const TYPE_GZIP: &str = "gzip+base64";
/// Envelope marker for uncompressed payloads.
const TYPE_JSON: &str = "json";

/// Checkpoint behavior knobs.
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Maximum serialized payload size in bytes before the save is
    /// skipped.
    pub max_size: usize,
    /// Gzip-compress payloads before storage.
    pub compress: bool,
    /// How long checkpoints live; shorter than history retention by
    /// default.
    pub retention: Duration,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            max_size: 1024 * 1024,
            compress: true,
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl CheckpointConfig {
    /// Creates a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the size cap in bytes.
    #[must_use]
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Enables or disables compression.
    #[must_use]
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Sets the retention window.
    #[must_use]
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

/// What happened to a checkpoint save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// Stored; sizes in bytes, compressed size present when compression
    /// was applied.
    Saved {
        /// Serialized payload size.
        original_size: usize,
        /// Stored size after compression, if compressed.
        compressed_size: Option<usize>,
    },
    /// Skipped because the payload exceeded the size cap.
    SkippedTooLarge {
        /// Serialized payload size.
        size: usize,
    },
}

/// Saves and loads checkpoints through a [`StateStore`].
#[derive(Debug)]
pub struct CheckpointManager {
    store: Arc<dyn StateStore>,
    prefix: String,
    config: CheckpointConfig,
}

impl CheckpointManager {
    /// Creates a manager over the given store and key prefix.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, prefix: impl Into<String>, config: CheckpointConfig) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            config,
        }
    }

    /// The configured retention window.
    #[must_use]
    pub fn retention(&self) -> Duration {
        self.config.retention
    }

    /// Persists a checkpoint payload.
    ///
    /// Oversized payloads are logged and skipped — never fatal to the
    /// running execution.
    pub async fn save(
        &self,
        pipeline_id: &str,
        checkpoint_id: &str,
        payload: &serde_json::Value,
    ) -> Result<CheckpointOutcome, EtlError> {
        let serialized = serde_json::to_vec(payload)?;
        if serialized.len() > self.config.max_size {
            let err = EtlError::CheckpointTooLarge {
                pipeline_id: pipeline_id.to_string(),
                checkpoint_id: checkpoint_id.to_string(),
                size: serialized.len(),
                max_size: self.config.max_size,
            };
            tracing::warn!(error = %err, "checkpoint skipped");
            return Ok(CheckpointOutcome::SkippedTooLarge {
                size: serialized.len(),
            });
        }

        let original_size = serialized.len();
        let (envelope, compressed_size) = if self.config.compress {
            let compressed = gzip(&serialized)?;
            let compressed_size = compressed.len();
            let envelope = serde_json::json!({
                "type": TYPE_GZIP,
                "data": BASE64.encode(&compressed),
                "original_size": original_size,
                "compressed_size": compressed_size,
                "saved_at": Utc::now(),
            });
            (envelope, Some(compressed_size))
        } else {
            let envelope = serde_json::json!({
                "type": TYPE_JSON,
                "data": payload,
                "saved_at": Utc::now(),
            });
            (envelope, None)
        };

        let key = checkpoint_key(&self.prefix, pipeline_id, checkpoint_id);
        self.store
            .set(&key, envelope, Some(self.config.retention))
            .await?;

        tracing::debug!(
            pipeline_id,
            checkpoint_id,
            original_size,
            compressed_size,
            "checkpoint saved"
        );
        Ok(CheckpointOutcome::Saved {
            original_size,
            compressed_size,
        })
    }

    /// Loads a checkpoint payload, decompressing transparently.
    ///
    /// Legacy entries written before the envelope format (no `type`
    /// marker) are returned as-is.
    pub async fn load(
        &self,
        pipeline_id: &str,
        checkpoint_id: &str,
    ) -> Result<Option<serde_json::Value>, EtlError> {
        let key = checkpoint_key(&self.prefix, pipeline_id, checkpoint_id);
        let Some(stored) = self.store.get(&key).await? else {
            return Ok(None);
        };

        match stored.get("type").and_then(|t| t.as_str()) {
            Some(TYPE_GZIP) => {
                let encoded = stored
                    .get("data")
                    .and_then(|d| d.as_str())
                    .ok_or_else(|| EtlError::Store("compressed checkpoint missing data".into()))?;
                let compressed = BASE64
                    .decode(encoded)
                    .map_err(|e| EtlError::Store(format!("checkpoint base64 decode: {e}")))?;
                let raw = gunzip(&compressed)?;
                Ok(Some(serde_json::from_slice(&raw)?))
            }
            Some(TYPE_JSON) => Ok(stored.get("data").cloned()),
            // Legacy uncompressed entry: the stored value is the payload.
            _ => Ok(Some(stored)),
        }
    }

    /// Deletes one checkpoint; returns whether it existed.
    pub async fn delete(
        &self,
        pipeline_id: &str,
        checkpoint_id: &str,
    ) -> Result<bool, EtlError> {
        let key = checkpoint_key(&self.prefix, pipeline_id, checkpoint_id);
        self.store.delete(&key).await
    }

    /// Lists checkpoint keys, optionally narrowed to one pipeline.
    pub async fn list(&self, pipeline_id: Option<&str>) -> Result<Vec<String>, EtlError> {
        let pattern = match pipeline_id {
            Some(id) => checkpoint_key(&self.prefix, id, "*"),
            None => checkpoint_key(&self.prefix, "*", "*"),
        };
        self.store.list_keys(&pattern).await
    }

    /// Deletes checkpoints whose `saved_at` predates `cutoff`. Entries
    /// without a timestamp are left alone. Returns the number evicted.
    pub async fn evict_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, EtlError> {
        let keys = self.list(None).await?;
        let mut evicted = 0;

        for key in keys {
            let Some(stored) = self.store.get(&key).await? else {
                continue;
            };
            let saved_at = stored
                .get("saved_at")
                .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v.clone()).ok());
            if saved_at.is_some_and(|at| at < cutoff) && self.store.delete(&key).await? {
                evicted += 1;
            }
        }

        Ok(evicted)
    }
}

fn gzip(data: &[u8]) -> Result<Vec<u8>, EtlError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>, EtlError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn manager(config: CheckpointConfig) -> CheckpointManager {
        CheckpointManager::new(Arc::new(MemoryStore::new()), "etl", config)
    }

    #[tokio::test]
    async fn test_compressed_round_trip_deep_equals() {
        let manager = manager(CheckpointConfig::default());
        let payload = json!({
            "cursor": "page-42",
            "offset": 4200,
            "nested": {"seen_ids": [1, 2, 3], "done": false},
        });

        let outcome = manager.save("orders", "cursor", &payload).await.unwrap();
        assert!(matches!(
            outcome,
            CheckpointOutcome::Saved {
                compressed_size: Some(_),
                ..
            }
        ));

        let loaded = manager.load("orders", "cursor").await.unwrap();
        assert_eq!(loaded, Some(payload));
    }

    #[tokio::test]
    async fn test_uncompressed_round_trip() {
        let manager = manager(CheckpointConfig::new().with_compression(false));
        let payload = json!({"offset": 7});

        manager.save("orders", "cursor", &payload).await.unwrap();
        assert_eq!(
            manager.load("orders", "cursor").await.unwrap(),
            Some(payload)
        );
    }

    #[tokio::test]
    async fn test_oversized_payload_is_soft_skipped() {
        let manager = manager(CheckpointConfig::new().with_max_size(16));
        let payload = json!({"blob": "x".repeat(1024)});

        let outcome = manager.save("orders", "big", &payload).await.unwrap();
        assert!(matches!(outcome, CheckpointOutcome::SkippedTooLarge { .. }));
        assert_eq!(manager.load("orders", "big").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_legacy_uncompressed_entry_loads_as_is() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let legacy = json!({"cursor": "old-format", "offset": 1});
        store
            .set(&checkpoint_key("etl", "orders", "cursor"), legacy.clone(), None)
            .await
            .unwrap();

        let manager = CheckpointManager::new(store, "etl", CheckpointConfig::default());
        assert_eq!(
            manager.load("orders", "cursor").await.unwrap(),
            Some(legacy)
        );
    }

    #[tokio::test]
    async fn test_list_narrows_to_pipeline() {
        let manager = manager(CheckpointConfig::default());
        manager.save("a", "c1", &json!(1)).await.unwrap();
        manager.save("a", "c2", &json!(2)).await.unwrap();
        manager.save("b", "c1", &json!(3)).await.unwrap();

        assert_eq!(manager.list(Some("a")).await.unwrap().len(), 2);
        assert_eq!(manager.list(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_eviction_honors_cutoff() {
        let manager = manager(CheckpointConfig::default());
        manager.save("a", "old", &json!(1)).await.unwrap();

        // Nothing predates a cutoff in the past.
        let past = Utc::now() - chrono::Duration::minutes(5);
        assert_eq!(manager.evict_older_than(past).await.unwrap(), 0);

        // Everything predates a cutoff in the future.
        let future = Utc::now() + chrono::Duration::minutes(5);
        assert_eq!(manager.evict_older_than(future).await.unwrap(), 1);
        assert_eq!(manager.load("a", "old").await.unwrap(), None);
    }
}
