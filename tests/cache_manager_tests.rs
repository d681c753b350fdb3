use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use sprintcore::cache::store::{CacheStore, StoreError, StoreResult};
use sprintcore::cache::{CacheConfig, CacheManager, MemoryStore};
use sprintcore::CoreError;

/// Secondary tier that fails every call
struct BrokenStore;

#[async_trait]
impl CacheStore for BrokenStore {
    fn name(&self) -> &'static str {
        "broken"
    }
    async fn get(&self, _key: &str) -> StoreResult<Option<Value>> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    async fn set(&self, _key: &str, _value: Value, _ttl: Duration) -> StoreResult<()> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    async fn delete(&self, _key: &str) -> StoreResult<bool> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    async fn keys(&self, _pattern: &str) -> StoreResult<Vec<String>> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    async fn ttl(&self, _key: &str) -> StoreResult<Option<Duration>> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    async fn clear(&self) -> StoreResult<()> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    async fn len(&self) -> StoreResult<usize> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}

fn memory_only() -> CacheManager {
    CacheManager::new(CacheConfig::default())
}

#[tokio::test]
async fn entry_expires_after_ttl() {
    let cache = memory_only();
    cache
        .set("sprint:1", json!({"name": "Sprint 1"}), Some(Duration::from_millis(50)))
        .await;
    assert_eq!(cache.get("sprint:1").await, Some(json!({"name": "Sprint 1"})));

    sleep(Duration::from_millis(80)).await;
    assert_eq!(cache.get("sprint:1").await, None);
    assert_eq!(cache.ttl("sprint:1").await, -1);
}

#[tokio::test]
async fn ttl_reports_whole_seconds() {
    let cache = memory_only();
    cache.set("k", json!(1), Some(Duration::from_secs(60))).await;
    let ttl = cache.ttl("k").await;
    assert!((59..=60).contains(&ttl), "ttl was {}", ttl);
}

#[tokio::test]
async fn delete_pattern_removes_matching_family() {
    let cache = memory_only();
    cache.set("user:1", json!("a"), None).await;
    cache.set("user:2", json!("b"), None).await;
    cache.set("session:1", json!("c"), None).await;

    assert_eq!(cache.delete_pattern("user:*").await, 2);
    assert!(!cache.exists("user:1").await);
    assert!(!cache.exists("user:2").await);
    assert!(cache.exists("session:1").await);
}

#[tokio::test]
async fn delete_reports_presence() {
    let cache = memory_only();
    cache.set("k", json!(1), None).await;
    assert!(cache.delete("k").await);
    assert!(!cache.delete("k").await);
}

#[tokio::test]
async fn get_or_fetch_calls_producer_once() {
    let cache = memory_only();
    let calls = Arc::new(AtomicU32::new(0));

    for _ in 0..3 {
        let calls = calls.clone();
        let value = cache
            .get_or_fetch("repo:acme:web", None, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"stars": 42}))
            })
            .await
            .unwrap();
        assert_eq!(value, json!({"stars": 42}));
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let stats = cache.get_stats().await;
    assert_eq!(stats.fallback_loads, 1);
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.misses, 1);
}

#[tokio::test]
async fn get_or_fetch_propagates_producer_error_only() {
    let cache = memory_only();
    let err = cache
        .get_or_fetch("k", None, || async {
            Err(CoreError::service("github", "502 bad gateway"))
        })
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(!cache.exists("k").await);
}

#[tokio::test]
async fn lookups_always_balance() {
    let cache = memory_only();
    for i in 0..20 {
        let key = format!("k{}", i % 7);
        if i % 3 == 0 {
            cache.set(&key, json!(i), None).await;
        }
        cache.get(&key).await;
        if i % 5 == 0 {
            cache.delete(&key).await;
        }
    }
    let stats = cache.get_stats().await;
    assert_eq!(stats.hits + stats.misses, 20);
    assert_eq!(stats.total_lookups(), 20);
}

#[tokio::test]
async fn secondary_hit_repopulates_fast_tier() {
    let secondary = Arc::new(MemoryStore::new(100));
    let cache = CacheManager::with_secondary(CacheConfig::default(), secondary.clone());

    cache.set("issue:ABC-1", json!({"status": "done"}), None).await;
    assert!(secondary.get("issue:ABC-1").await.unwrap().is_some());

    // lose the fast copy
    cache.fast_store().evict("issue:ABC-1");
    assert_eq!(cache.get("issue:ABC-1").await, Some(json!({"status": "done"})));
    assert!(cache.fast_store().entry_info("issue:ABC-1").is_some());

    let stats = cache.get_stats().await;
    assert_eq!(stats.secondary_hits, 1);
    assert_eq!(stats.hits, 1);
}

#[tokio::test]
async fn delete_pattern_counts_union_of_tiers() {
    let secondary = Arc::new(MemoryStore::new(100));
    let cache = CacheManager::with_secondary(CacheConfig::default(), secondary.clone());

    cache.set("sprint:9:issues", json!([]), None).await;
    secondary
        .set("sprint:9:metrics", json!({}), Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(cache.delete_pattern("sprint:9:*").await, 2);
    assert_eq!(secondary.len().await.unwrap(), 0);
}

#[tokio::test]
async fn failing_secondary_never_reaches_caller() {
    let cache = CacheManager::with_secondary(CacheConfig::default(), Arc::new(BrokenStore));

    cache.set("k", json!(1), None).await;
    assert_eq!(cache.get("k").await, Some(json!(1)));
    assert_eq!(cache.get("missing").await, None);
    assert!(cache.delete("k").await);
    assert_eq!(cache.delete_pattern("*").await, 0);
    cache.clear().await;

    let health = cache.health_check().await;
    assert!(health.healthy);
    let secondary = health.secondary.expect("secondary tier reported");
    assert!(!secondary.healthy);
    assert!(secondary.error.is_some());
}

#[tokio::test]
async fn store_errors_are_counted() {
    let cache = CacheManager::with_secondary(CacheConfig::default(), Arc::new(BrokenStore));
    cache.set("k", json!(1), None).await;
    cache.get("missing").await;

    let stats = cache.get_stats().await;
    // failed set + failed get
    assert_eq!(stats.store_errors, 2);
    assert_eq!(stats.misses, 1);
}

#[tokio::test]
async fn build_key_escapes_parts() {
    let cache = memory_only();
    let key = cache.build_key(&["repo", "acme", "feature:*"]);
    assert_eq!(key, "repo:acme:feature%3A%2A");

    cache.set(&key, json!(1), None).await;
    cache.set("repo:acme:main", json!(2), None).await;
    // the escaped part cannot widen a pattern
    assert_eq!(cache.delete_pattern(&key).await, 1);
    assert!(cache.exists("repo:acme:main").await);
}
