// src/cache/mod.rs
// Two-tier cache: in-process fast tier plus optional Redis secondary tier

pub mod keys;
pub mod manager;
pub mod memory_store;
pub mod optimizer;
pub mod redis_store;
pub mod store;

pub use keys::{build_key, DataKind};
pub use manager::{CacheHealth, CacheManager};
pub use memory_store::MemoryStore;
pub use optimizer::{CacheOptimizer, OptimizerConfig, WarmTarget};
pub use redis_store::RedisStore;
pub use store::{CacheStore, StoreError, StoreResult};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL applied when a caller does not pass one
    pub default_ttl: Duration,
    /// Upper bound on fast-tier entries
    pub max_entries: usize,
    pub redis_enabled: bool,
    pub redis_url: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            max_entries: memory_store::DEFAULT_CAPACITY,
            redis_enabled: false,
            redis_url: None,
        }
    }
}

/// Cached value with the bookkeeping needed for TTL checks
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub ttl: Duration,
    pub inserted_at: Instant,
    pub size_bytes: usize,
}

impl CacheEntry {
    pub fn new(key: &str, value: Value, ttl: Duration) -> Self {
        let size_bytes = key.len() + estimate_size(&value);
        Self {
            key: key.to_string(),
            value,
            ttl,
            inserted_at: Instant::now(),
            size_bytes,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() >= self.ttl
    }

    pub fn remaining(&self) -> Duration {
        self.ttl.saturating_sub(self.inserted_at.elapsed())
    }

    /// Restart the clock with a new TTL
    pub fn reset_ttl(&mut self, ttl: Duration) {
        self.ttl = ttl;
        self.inserted_at = Instant::now();
    }
}

/// Serialized size of a value, used for memory accounting
pub fn estimate_size(value: &Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}

/// Snapshot of cache counters since the last `clear()`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Hits served by the secondary tier (subset of `hits`)
    pub secondary_hits: u64,
    /// Misses answered by a fetch callback
    pub fallback_loads: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    /// Store failures swallowed and treated as misses / no-ops
    pub store_errors: u64,
    pub keys: usize,
    pub memory_bytes: usize,
    pub hit_rate: f64,
}

impl CacheStats {
    pub fn total_lookups(&self) -> u64 {
        self.hits + self.misses
    }

    pub fn compute_hit_rate(hits: u64, misses: u64) -> f64 {
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hit_rate() {
        assert_eq!(CacheStats::compute_hit_rate(0, 0), 0.0);
        assert_eq!(CacheStats::compute_hit_rate(10, 5), 10.0 / 15.0);
    }

    #[test]
    fn test_entry_size_includes_key() {
        let entry = CacheEntry::new("k", json!("abc"), Duration::from_secs(1));
        // "abc" serializes to 5 bytes with quotes
        assert_eq!(entry.size_bytes, 1 + 5);
    }

    #[test]
    fn test_entry_expiry() {
        let entry = CacheEntry::new("k", json!(1), Duration::ZERO);
        assert!(entry.is_expired());
        assert_eq!(entry.remaining(), Duration::ZERO);
    }
}
