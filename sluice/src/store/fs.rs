//! Filesystem state store backend: one file per key.
//!
//! Keys are sanitized into file names with a hash suffix so distinct keys
//! never collide; the original key is kept inside the file for listing.
//! TTL is simulated via a stored-at timestamp checked on read.

use super::{key_matches, StateStore};
use crate::errors::EtlError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize)]
struct FsEntry {
    key: String,
    value: serde_json::Value,
    stored_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ttl_ms: Option<u64>,
}

impl FsEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.ttl_ms.is_some_and(|ms| {
            now.signed_duration_since(self.stored_at)
                >= chrono::Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
        })
    }
}

/// One-file-per-key durable backend rooted at a directory.
#[derive(Debug)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Opens the store, creating the root directory if needed.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, EtlError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Root directory of the store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_for(&self, key: &str) -> PathBuf {
        let stem: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();

        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        self.root.join(format!("{stem}-{:016x}.json", hasher.finish()))
    }

    async fn read_entry(&self, path: &Path) -> Result<Option<FsEntry>, EtlError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl StateStore for FsStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, EtlError> {
        let path = self.file_for(key);
        match self.read_entry(&path).await? {
            Some(entry) if entry.is_expired(Utc::now()) => {
                let _ = tokio::fs::remove_file(&path).await;
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value)),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), EtlError> {
        let entry = FsEntry {
            key: key.to_string(),
            value,
            stored_at: Utc::now(),
            ttl_ms: ttl.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        };
        let path = self.file_for(key);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(&entry)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, EtlError> {
        match tokio::fs::remove_file(self.file_for(key)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_keys(&self, pattern: &str) -> Result<Vec<String>, EtlError> {
        let now = Utc::now();
        let mut keys = Vec::new();

        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(dirent) = dir.next_entry().await? {
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            // Unreadable or partially written files are skipped, not fatal.
            let Ok(Some(entry)) = self.read_entry(&path).await else {
                continue;
            };
            if !entry.is_expired(now) && key_matches(pattern, &entry.key) {
                keys.push(entry.key);
            }
        }

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
    async fn test_fs_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).await.unwrap();
        crate::store::suite::exercise(&store).await;
    }

    #[tokio::test]
    async fn test_sanitized_keys_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).await.unwrap();

        // Both sanitize to the same stem; the hash suffix keeps them apart.
        store.set("a:b", serde_json::json!(1), None).await.unwrap();
        store.set("a_b", serde_json::json!(2), None).await.unwrap();

        assert_eq!(
            store.get("a:b").await.unwrap(),
            Some(serde_json::json!(1))
        );
        assert_eq!(
            store.get("a_b").await.unwrap(),
            Some(serde_json::json!(2))
        );
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FsStore::open(dir.path()).await.unwrap();
            store
                .set("durable", serde_json::json!("yes"), None)
                .await
                .unwrap();
        }

        let reopened = FsStore::open(dir.path()).await.unwrap();
        assert_eq!(
            reopened.get("durable").await.unwrap(),
            Some(serde_json::json!("yes"))
        );
    }
}
