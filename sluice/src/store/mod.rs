//! Pluggable key-value state persistence.
//!
//! One contract, three adapters: [`MemoryStore`] for tests and embedded
//! use, [`DocumentStore`] for a single durable JSON document, and
//! [`FsStore`] for one file per key. All backends honor the same
//! semantics, including TTL expiry — durable media simulate TTL via a
//! stored-at timestamp checked on read.

pub mod checkpoint;
pub mod document;
pub mod fs;
pub mod memory;

use crate::errors::EtlError;
use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;

pub use checkpoint::{CheckpointConfig, CheckpointManager, CheckpointOutcome};
pub use document::DocumentStore;
pub use fs::FsStore;
pub use memory::MemoryStore;

/// Uniform async contract all backends satisfy.
///
/// Conflicting writes to the same key are last-write-wins; history and
/// checkpoint keys are unique per execution so this never loses data.
#[async_trait]
pub trait StateStore: Send + Sync + Debug {
    /// Reads a value; `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, EtlError>;

    /// Writes a value, optionally expiring after `ttl`.
    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), EtlError>;

    /// Deletes a key; returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, EtlError>;

    /// Lists live keys matching a `*`-wildcard pattern, sorted.
    async fn list_keys(&self, pattern: &str) -> Result<Vec<String>, EtlError>;

    /// True when the key exists and has not expired.
    async fn exists(&self, key: &str) -> Result<bool, EtlError>;
}

/// Key for a persisted execution record.
#[must_use]
pub fn history_key(prefix: &str, execution_id: &str) -> String {
    format!("{prefix}:history:{execution_id}")
}

/// Key for a checkpoint payload.
#[must_use]
pub fn checkpoint_key(prefix: &str, pipeline_id: &str, checkpoint_id: &str) -> String {
    format!("{prefix}:checkpoint:{pipeline_id}:{checkpoint_id}")
}

/// Matches a key against a pattern where `*` spans any run of
/// characters. No other metacharacters are recognized.
#[must_use]
pub fn key_matches(pattern: &str, key: &str) -> bool {
    fn matches(p: &[u8], k: &[u8]) -> bool {
        match (p.first(), k.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                matches(&p[1..], k) || (!k.is_empty() && matches(p, &k[1..]))
            }
            (Some(pc), Some(kc)) if pc == kc => matches(&p[1..], &k[1..]),
            _ => false,
        }
    }
    matches(pattern.as_bytes(), key.as_bytes())
}

#[cfg(test)]
pub(crate) mod suite;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_namespacing() {
        assert_eq!(history_key("etl", "abc"), "etl:history:abc");
        assert_eq!(
            checkpoint_key("etl", "orders", "cursor"),
            "etl:checkpoint:orders:cursor"
        );
    }

    #[test]
    fn test_key_matches_literal() {
        assert!(key_matches("a:b", "a:b"));
        assert!(!key_matches("a:b", "a:c"));
        assert!(!key_matches("a:b", "a:bb"));
    }

    #[test]
    fn test_key_matches_wildcard() {
        assert!(key_matches("etl:history:*", "etl:history:123"));
        assert!(key_matches("*", "anything"));
        assert!(key_matches("etl:*:orders:*", "etl:checkpoint:orders:cursor"));
        assert!(!key_matches("etl:history:*", "etl:checkpoint:123"));
    }

    #[test]
    fn test_key_matches_empty_star() {
        assert!(key_matches("abc*", "abc"));
        assert!(key_matches("*abc", "abc"));
    }
}
