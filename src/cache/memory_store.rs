// src/cache/memory_store.rs
// Fast tier: in-process LRU with per-entry TTL

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::keys::GlobPattern;
use super::store::{CacheStore, StoreResult};
use super::CacheEntry;

pub const DEFAULT_CAPACITY: usize = 10_000;

/// Read-only view of one entry, used by the optimizer
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub key: String,
    pub size_bytes: usize,
    pub ttl: Duration,
    pub remaining: Duration,
    pub age: Duration,
}

/// Bounded in-memory store. Expired entries are dropped lazily on access
/// and eagerly by [`MemoryStore::purge_expired`].
pub struct MemoryStore {
    entries: Mutex<LruCache<String, CacheEntry>>,
    capacity: usize,
    evictions: AtomicU64,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            capacity,
            evictions: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries pushed out by the LRU bound (not by TTL)
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Estimated bytes held by live entries
    pub fn memory_bytes(&self) -> usize {
        let entries = self.entries.lock();
        entries
            .iter()
            .filter(|(_, e)| !e.is_expired())
            .map(|(_, e)| e.size_bytes)
            .sum()
    }

    /// Drop every expired entry; returns (count, bytes) released
    pub fn purge_expired(&self) -> (usize, usize) {
        let mut entries = self.entries.lock();
        let expired: Vec<(String, usize)> = entries
            .iter()
            .filter(|(_, e)| e.is_expired())
            .map(|(k, e)| (k.clone(), e.size_bytes))
            .collect();

        let mut bytes = 0;
        for (key, size) in &expired {
            entries.pop(key);
            bytes += size;
        }
        (expired.len(), bytes)
    }

    /// Inspect an entry without refreshing its LRU position
    pub fn entry_info(&self, key: &str) -> Option<EntryInfo> {
        let entries = self.entries.lock();
        entries
            .peek(key)
            .filter(|e| !e.is_expired())
            .map(EntryInfo::from)
    }

    /// Remove an entry without going through the async trait; returns its size
    pub fn evict(&self, key: &str) -> Option<usize> {
        self.entries.lock().pop(key).map(|e| e.size_bytes)
    }

    /// All live entries, least recently used last
    pub fn snapshot(&self) -> Vec<EntryInfo> {
        let entries = self.entries.lock();
        entries
            .iter()
            .filter(|(_, e)| !e.is_expired())
            .map(|(_, e)| EntryInfo::from(e))
            .collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl From<&CacheEntry> for EntryInfo {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            key: entry.key.clone(),
            size_bytes: entry.size_bytes,
            ttl: entry.ttl,
            remaining: entry.remaining(),
            age: entry.inserted_at.elapsed(),
        }
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        let mut entries = self.entries.lock();

        let expired = match entries.peek(key) {
            Some(entry) => entry.is_expired(),
            None => return Ok(None),
        };
        if expired {
            entries.pop(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> StoreResult<()> {
        let entry = CacheEntry::new(key, value, ttl);
        let mut entries = self.entries.lock();
        if let Some((pushed_out, _)) = entries.push(key.to_string(), entry) {
            if pushed_out != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut entries = self.entries.lock();
        Ok(entries.pop(key).map(|e| !e.is_expired()).unwrap_or(false))
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let glob = GlobPattern::new(pattern)?;
        let entries = self.entries.lock();
        Ok(entries
            .iter()
            .filter(|(k, e)| !e.is_expired() && glob.matches(k))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let entries = self.entries.lock();
        Ok(entries
            .peek(key)
            .filter(|e| !e.is_expired())
            .map(|e| e.remaining()))
    }

    async fn clear(&self) -> StoreResult<()> {
        self.entries.lock().clear();
        Ok(())
    }

    async fn len(&self) -> StoreResult<usize> {
        let entries = self.entries.lock();
        Ok(entries.iter().filter(|(_, e)| !e.is_expired()).count())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut entries = self.entries.lock();
        match entries.peek_mut(key) {
            Some(entry) if !entry.is_expired() => {
                entry.reset_ttl(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get() {
        let store = MemoryStore::new(16);
        store.set("sprint:1", json!({"name": "Sprint 1"}), Duration::from_secs(60)).await.unwrap();

        let value = store.get("sprint:1").await.unwrap();
        assert_eq!(value, Some(json!({"name": "Sprint 1"})));
        assert_eq!(store.get("sprint:2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_expiration() {
        let store = MemoryStore::new(16);
        store.set("key", json!("value"), Duration::from_millis(50)).await.unwrap();
        assert!(store.get("key").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.get("key").await.unwrap().is_none());
        assert_eq!(store.ttl("key").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lru_eviction_counted() {
        let store = MemoryStore::new(2);
        let ttl = Duration::from_secs(60);
        store.set("a", json!(1), ttl).await.unwrap();
        store.set("b", json!(2), ttl).await.unwrap();
        // touch "a" so "b" becomes least recently used
        store.get("a").await.unwrap();
        store.set("c", json!(3), ttl).await.unwrap();

        assert_eq!(store.evictions(), 1);
        assert!(store.get("b").await.unwrap().is_none());
        assert!(store.get("a").await.unwrap().is_some());

        // overwriting an existing key is not an eviction
        store.set("a", json!(10), ttl).await.unwrap();
        assert_eq!(store.evictions(), 1);
    }

    #[tokio::test]
    async fn test_keys_by_pattern() {
        let store = MemoryStore::new(16);
        let ttl = Duration::from_secs(60);
        for key in ["user:1", "user:2", "session:1"] {
            store.set(key, json!(key), ttl).await.unwrap();
        }
        let mut keys = store.keys("user:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["user:1".to_string(), "user:2".to_string()]);
    }

    #[tokio::test]
    async fn test_purge_expired_reports_bytes() {
        let store = MemoryStore::new(16);
        store.set("short", json!("x"), Duration::from_millis(10)).await.unwrap();
        store.set("long", json!("y"), Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let (count, bytes) = store.purge_expired();
        assert_eq!(count, 1);
        assert!(bytes > 0);
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expire_shortens_ttl() {
        let store = MemoryStore::new(16);
        store.set("k", json!(1), Duration::from_secs(600)).await.unwrap();
        assert!(store.expire("k", Duration::from_secs(30)).await.unwrap());

        let remaining = store.ttl("k").await.unwrap().unwrap();
        assert!(remaining <= Duration::from_secs(30));
        assert!(!store.expire("missing", Duration::from_secs(30)).await.unwrap());
    }
}
