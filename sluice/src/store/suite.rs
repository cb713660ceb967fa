//! Shared semantic test suite run against every backend.

use super::StateStore;
use serde_json::json;
use std::time::Duration;

/// Exercises the full contract against one backend: CRUD, wildcard
/// listing, TTL expiry, and last-write-wins overwrites.
pub(crate) async fn exercise(store: &dyn StateStore) {
    // Absent key.
    assert_eq!(store.get("suite:missing").await.unwrap(), None);
    assert!(!store.exists("suite:missing").await.unwrap());
    assert!(!store.delete("suite:missing").await.unwrap());

    // Basic round-trip.
    store
        .set("suite:a", json!({"n": 1}), None)
        .await
        .unwrap();
    assert_eq!(
        store.get("suite:a").await.unwrap(),
        Some(json!({"n": 1}))
    );
    assert!(store.exists("suite:a").await.unwrap());

    // Last write wins.
    store
        .set("suite:a", json!({"n": 2}), None)
        .await
        .unwrap();
    assert_eq!(
        store.get("suite:a").await.unwrap(),
        Some(json!({"n": 2}))
    );

    // Wildcard listing is filtered and sorted.
    store.set("suite:b", json!(true), None).await.unwrap();
    store.set("other:c", json!(false), None).await.unwrap();
    let keys = store.list_keys("suite:*").await.unwrap();
    assert_eq!(keys, vec!["suite:a".to_string(), "suite:b".to_string()]);

    // Delete.
    assert!(store.delete("suite:b").await.unwrap());
    assert!(!store.exists("suite:b").await.unwrap());

    // TTL: entry is live before the deadline, gone after.
    store
        .set("suite:ttl", json!("soon"), Some(Duration::from_millis(80)))
        .await
        .unwrap();
    assert!(store.exists("suite:ttl").await.unwrap());
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(store.get("suite:ttl").await.unwrap(), None);
    assert!(!store.exists("suite:ttl").await.unwrap());
    assert!(store.list_keys("suite:ttl").await.unwrap().is_empty());
}
