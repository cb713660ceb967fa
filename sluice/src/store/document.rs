//! Durable document-store backend.
//!
//! All entries live in one JSON document on disk, loaded at open and
//! rewritten after every mutation. TTL is simulated with a stored-at
//! timestamp checked on read, as the medium has no native expiry.

use super::{key_matches, StateStore};
use crate::errors::EtlError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocEntry {
    value: serde_json::Value,
    stored_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ttl_ms: Option<u64>,
}

impl DocEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.ttl_ms.is_some_and(|ms| {
            now.signed_duration_since(self.stored_at)
                >= chrono::Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
        })
    }
}

/// Single-document durable backend.
#[derive(Debug)]
pub struct DocumentStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, DocEntry>>,
}

impl DocumentStore {
    /// Opens (or creates) the document at `path` and loads its entries.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, EtlError> {
        let path = path.as_ref().to_path_buf();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    /// Path of the backing document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self) -> Result<(), EtlError> {
        // Snapshot outside the await so the lock never crosses it.
        let bytes = {
            let entries = self.entries.read();
            serde_json::to_vec_pretty(&*entries)?
        };
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for DocumentStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, EtlError> {
        let now = Utc::now();
        let (value, expired) = {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if entry.is_expired(now) => (None, true),
                Some(entry) => (Some(entry.value.clone()), false),
                None => (None, false),
            }
        };
        if expired {
            self.entries.write().remove(key);
            self.persist().await?;
        }
        Ok(value)
    }

    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), EtlError> {
        let entry = DocEntry {
            value,
            stored_at: Utc::now(),
            ttl_ms: ttl.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        };
        self.entries.write().insert(key.to_string(), entry);
        self.persist().await
    }

    async fn delete(&self, key: &str) -> Result<bool, EtlError> {
        let removed = self.entries.write().remove(key).is_some();
        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }

    async fn list_keys(&self, pattern: &str) -> Result<Vec<String>, EtlError> {
        let now = Utc::now();
        let mut keys: Vec<String> = {
            let entries = self.entries.read();
            entries
                .iter()
                .filter(|(key, entry)| !entry.is_expired(now) && key_matches(pattern, key))
                .map(|(key, _)| key.clone())
                .collect()
        };
        keys.sort();
        Ok(keys)
    }

    async fn exists(&self, key: &str) -> Result<bool, EtlError> {
        Ok(self.get(key).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_document_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path().join("state.json"))
            .await
            .unwrap();
        crate::store::suite::exercise(&store).await;
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        {
            let store = DocumentStore::open(&path).await.unwrap();
            store
                .set("persisted", serde_json::json!({"kept": true}), None)
                .await
                .unwrap();
        }

        let reopened = DocumentStore::open(&path).await.unwrap();
        assert_eq!(
            reopened.get("persisted").await.unwrap(),
            Some(serde_json::json!({"kept": true}))
        );
    }

    #[tokio::test]
    async fn test_ttl_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        {
            let store = DocumentStore::open(&path).await.unwrap();
            store
                .set(
                    "ephemeral",
                    serde_json::json!(1),
                    Some(Duration::from_millis(40)),
                )
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        let reopened = DocumentStore::open(&path).await.unwrap();
        assert_eq!(reopened.get("ephemeral").await.unwrap(), None);
    }
}
