// src/cache/manager.rs
// Cache facade: fast tier first, secondary tier second, stats and usage tracking

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::keys::{self, GlobPattern};
use super::memory_store::MemoryStore;
use super::redis_store::RedisStore;
use super::store::{CacheStore, StoreError};
use super::{estimate_size, CacheConfig, CacheStats};
use crate::error::CoreResult;
use crate::monitoring::metrics::{CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL, CACHE_STORE_ERRORS_TOTAL};

/// Per-key access bookkeeping read by the optimizer
#[derive(Debug, Clone)]
pub struct KeyUsage {
    pub hits: u64,
    pub writes: u64,
    pub last_access: Instant,
    pub size_bytes: usize,
    pub ttl: Duration,
    /// TTL already lowered once by the optimizer
    pub ttl_adjusted: bool,
}

impl KeyUsage {
    fn new(size_bytes: usize, ttl: Duration) -> Self {
        Self {
            hits: 0,
            writes: 0,
            last_access: Instant::now(),
            size_bytes,
            ttl,
            ttl_adjusted: false,
        }
    }

    /// Reads per access (reads + writes)
    pub fn hit_rate(&self) -> f64 {
        CacheStats::compute_hit_rate(self.hits, self.writes)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TierHealth {
    pub tier: String,
    pub healthy: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheHealth {
    /// The fast tier answered the probe. A failing secondary tier degrades
    /// the cache but does not make it unhealthy.
    pub healthy: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub secondary: Option<TierHealth>,
}

#[derive(Default)]
struct StatCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    secondary_hits: AtomicU64,
    fallback_loads: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    store_errors: AtomicU64,
}

impl StatCounters {
    fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.secondary_hits,
            &self.fallback_loads,
            &self.sets,
            &self.deletes,
            &self.store_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

pub struct CacheManager {
    config: CacheConfig,
    fast: Arc<MemoryStore>,
    secondary: Option<Arc<dyn CacheStore>>,
    stats: StatCounters,
    /// Fast-tier evictions already accounted for by the last `clear()`
    evictions_baseline: AtomicU64,
    usage: Mutex<HashMap<String, KeyUsage>>,
    /// Bumped by every caller-visible read or write
    activity: AtomicU64,
}

impl CacheManager {
    /// Memory-only cache
    pub fn new(config: CacheConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_secondary(config: CacheConfig, secondary: Arc<dyn CacheStore>) -> Self {
        Self::build(config, Some(secondary))
    }

    /// Connect the Redis tier when enabled; a failed connection leaves the
    /// cache running memory-only.
    pub async fn connect(config: CacheConfig) -> Self {
        let secondary: Option<Arc<dyn CacheStore>> =
            match (config.redis_enabled, config.redis_url.as_deref()) {
                (true, Some(url)) => match RedisStore::connect(url).await {
                    Ok(store) => Some(Arc::new(store) as Arc<dyn CacheStore>),
                    Err(e) => {
                        warn!(error = %e, "Redis unavailable, continuing with memory cache only");
                        None
                    }
                },
                (true, None) => {
                    warn!("REDIS_ENABLED is set but REDIS_URL is missing, using memory cache only");
                    None
                }
                _ => None,
            };
        Self::build(config, secondary)
    }

    fn build(config: CacheConfig, secondary: Option<Arc<dyn CacheStore>>) -> Self {
        let fast = Arc::new(MemoryStore::new(config.max_entries));
        info!(
            max_entries = config.max_entries,
            default_ttl_secs = config.default_ttl.as_secs(),
            secondary = secondary.as_ref().map(|s| s.name()).unwrap_or("none"),
            "Cache manager initialized"
        );
        Self {
            config,
            fast,
            secondary,
            stats: StatCounters::default(),
            evictions_baseline: AtomicU64::new(0),
            usage: Mutex::new(HashMap::new()),
            activity: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn fast_store(&self) -> &MemoryStore {
        &self.fast
    }

    pub fn secondary(&self) -> Option<&Arc<dyn CacheStore>> {
        self.secondary.as_ref()
    }

    pub fn activity_generation(&self) -> u64 {
        self.activity.load(Ordering::SeqCst)
    }

    fn bump_activity(&self) {
        self.activity.fetch_add(1, Ordering::SeqCst);
    }

    fn store_error(&self, tier: &str, op: &str, key: &str, err: &StoreError) {
        self.stats.store_errors.fetch_add(1, Ordering::Relaxed);
        CACHE_STORE_ERRORS_TOTAL.with_label_values(&[tier, op]).inc();
        warn!(tier, op, key, error = %err, "Cache store error");
    }

    fn record_hit(&self, key: &str, value: &Value, tier: &str) {
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        CACHE_HITS_TOTAL.with_label_values(&[tier]).inc();

        let mut usage = self.usage.lock();
        let entry = usage
            .entry(key.to_string())
            .or_insert_with(|| KeyUsage::new(key.len() + estimate_size(value), self.config.default_ttl));
        entry.hits += 1;
        entry.last_access = Instant::now();
    }

    fn record_write(&self, key: &str, size_bytes: usize, ttl: Duration) {
        self.stats.sets.fetch_add(1, Ordering::Relaxed);
        let mut usage = self.usage.lock();
        let entry = usage
            .entry(key.to_string())
            .or_insert_with(|| KeyUsage::new(size_bytes, ttl));
        entry.writes += 1;
        entry.last_access = Instant::now();
        entry.size_bytes = size_bytes;
        entry.ttl = ttl;
        entry.ttl_adjusted = false;
    }

    /// Look a key up in the fast tier, then the secondary tier.
    /// Store failures count as misses.
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.bump_activity();

        match self.fast.get(key).await {
            Ok(Some(value)) => {
                self.record_hit(key, &value, self.fast.name());
                return Some(value);
            }
            Ok(None) => {}
            Err(e) => self.store_error(self.fast.name(), "get", key, &e),
        }

        if let Some(secondary) = &self.secondary {
            match secondary.get(key).await {
                Ok(Some(value)) => {
                    let ttl = match secondary.ttl(key).await {
                        Ok(Some(ttl)) => ttl,
                        _ => self.config.default_ttl,
                    };
                    if let Err(e) = self.fast.set(key, value.clone(), ttl).await {
                        self.store_error(self.fast.name(), "promote", key, &e);
                    }
                    self.stats.secondary_hits.fetch_add(1, Ordering::Relaxed);
                    self.record_hit(key, &value, secondary.name());
                    return Some(value);
                }
                Ok(None) => {}
                Err(e) => self.store_error(secondary.name(), "get", key, &e),
            }
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        CACHE_MISSES_TOTAL.inc();
        None
    }

    /// Return the cached value, or run `fetch`, cache its result and return it.
    /// Only an error from `fetch` itself is returned.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        fetch: F,
    ) -> CoreResult<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<Value>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        let value = fetch().await?;
        self.stats.fallback_loads.fetch_add(1, Ordering::Relaxed);
        debug!(key, "Cache miss filled by fetch");
        self.set(key, value.clone(), ttl).await;
        Ok(value)
    }

    /// Typed read; a value that no longer deserializes is dropped and
    /// reported as a miss
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key).await?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                warn!(key, error = %e, "Discarding cached value with unexpected shape");
                self.delete(key).await;
                None
            }
        }
    }

    pub async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> CoreResult<()> {
        let value = serde_json::to_value(value).map_err(StoreError::from)?;
        self.set(key, value, ttl).await;
        Ok(())
    }

    /// Write to the fast tier and, best effort, the secondary tier.
    /// `None` or a zero TTL means the configured default.
    pub async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        self.bump_activity();
        let ttl = match ttl {
            Some(ttl) if !ttl.is_zero() => ttl,
            _ => self.config.default_ttl,
        };
        let size_bytes = key.len() + estimate_size(&value);

        if let Some(secondary) = &self.secondary {
            if let Err(e) = secondary.set(key, value.clone(), ttl).await {
                self.store_error(secondary.name(), "set", key, &e);
            }
        }
        if let Err(e) = self.fast.set(key, value, ttl).await {
            self.store_error(self.fast.name(), "set", key, &e);
        }
        self.record_write(key, size_bytes, ttl);
    }

    /// Returns true when either tier held the key
    pub async fn delete(&self, key: &str) -> bool {
        self.bump_activity();
        let removed = self.delete_from_tiers(key).await;
        self.usage.lock().remove(key);
        if removed {
            self.stats.deletes.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    async fn delete_from_tiers(&self, key: &str) -> bool {
        let mut removed = match self.fast.delete(key).await {
            Ok(found) => found,
            Err(e) => {
                self.store_error(self.fast.name(), "delete", key, &e);
                false
            }
        };
        if let Some(secondary) = &self.secondary {
            match secondary.delete(key).await {
                Ok(found) => removed |= found,
                Err(e) => self.store_error(secondary.name(), "delete", key, &e),
            }
        }
        removed
    }

    /// Delete every key matching a `*` / `?` glob across both tiers.
    /// Returns the number of distinct keys removed; an invalid pattern removes nothing.
    pub async fn delete_pattern(&self, pattern: &str) -> usize {
        if let Err(e) = GlobPattern::new(pattern) {
            warn!(pattern, error = %e, "Rejected delete pattern");
            return 0;
        }
        self.bump_activity();

        let mut matched = BTreeSet::new();
        match self.fast.keys(pattern).await {
            Ok(keys) => matched.extend(keys),
            Err(e) => self.store_error(self.fast.name(), "keys", pattern, &e),
        }
        if let Some(secondary) = &self.secondary {
            match secondary.keys(pattern).await {
                Ok(keys) => matched.extend(keys),
                Err(e) => self.store_error(secondary.name(), "keys", pattern, &e),
            }
        }

        let mut removed = 0;
        for key in &matched {
            if self.delete_from_tiers(key).await {
                removed += 1;
            }
        }
        {
            let mut usage = self.usage.lock();
            for key in &matched {
                usage.remove(key);
            }
        }
        self.stats
            .deletes
            .fetch_add(removed as u64, Ordering::Relaxed);
        debug!(pattern, removed, "Deleted keys by pattern");
        removed
    }

    /// Drop everything cached for one sprint
    pub async fn invalidate_sprint(&self, sprint_id: &str) -> usize {
        let mut removed = usize::from(self.delete(&keys::sprint(sprint_id)).await);
        removed += self.delete_pattern(&keys::sprint_family(sprint_id)).await;
        info!(sprint_id, removed, "Invalidated sprint cache");
        removed
    }

    pub async fn exists(&self, key: &str) -> bool {
        if let Ok(Some(_)) = self.fast.ttl(key).await {
            return true;
        }
        match &self.secondary {
            Some(secondary) => matches!(secondary.get(key).await, Ok(Some(_))),
            None => false,
        }
    }

    /// Remaining lifetime in whole seconds (rounded up), -1 when missing
    pub async fn ttl(&self, key: &str) -> i64 {
        let remaining = match self.fast.ttl(key).await {
            Ok(Some(ttl)) => Some(ttl),
            _ => match &self.secondary {
                Some(secondary) => secondary.ttl(key).await.ok().flatten(),
                None => None,
            },
        };
        match remaining {
            Some(ttl) => {
                let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
                i64::try_from(secs).unwrap_or(i64::MAX)
            }
            None => -1,
        }
    }

    /// Flush every tier and reset statistics
    pub async fn clear(&self) {
        self.bump_activity();
        if let Err(e) = self.fast.clear().await {
            self.store_error(self.fast.name(), "clear", "*", &e);
        }
        if let Some(secondary) = &self.secondary {
            if let Err(e) = secondary.clear().await {
                self.store_error(secondary.name(), "clear", "*", &e);
            }
        }
        self.usage.lock().clear();
        self.stats.reset();
        self.evictions_baseline
            .store(self.fast.evictions(), Ordering::Relaxed);
        info!("Cache cleared");
    }

    pub async fn get_stats(&self) -> CacheStats {
        let hits = self.stats.hits.load(Ordering::Relaxed);
        let misses = self.stats.misses.load(Ordering::Relaxed);
        let keys = self.fast.len().await.unwrap_or(0);
        CacheStats {
            hits,
            misses,
            secondary_hits: self.stats.secondary_hits.load(Ordering::Relaxed),
            fallback_loads: self.stats.fallback_loads.load(Ordering::Relaxed),
            sets: self.stats.sets.load(Ordering::Relaxed),
            deletes: self.stats.deletes.load(Ordering::Relaxed),
            evictions: self
                .fast
                .evictions()
                .saturating_sub(self.evictions_baseline.load(Ordering::Relaxed)),
            store_errors: self.stats.store_errors.load(Ordering::Relaxed),
            keys,
            memory_bytes: self.fast.memory_bytes(),
            hit_rate: CacheStats::compute_hit_rate(hits, misses),
        }
    }

    /// Probe write / read / delete against each tier
    pub async fn health_check(&self) -> CacheHealth {
        let fast = probe(self.fast.as_ref()).await;
        let secondary = match &self.secondary {
            Some(store) => Some(probe(store.as_ref()).await),
            None => None,
        };
        if let Some(tier) = secondary.as_ref().filter(|t| !t.healthy) {
            warn!(tier = %tier.tier, error = ?tier.error, "Secondary cache tier unhealthy");
        }
        CacheHealth {
            healthy: fast.healthy,
            latency_ms: fast.latency_ms,
            error: fast.error,
            secondary,
        }
    }

    /// See [`keys::build_key`]
    pub fn build_key<S: AsRef<str>>(&self, parts: &[S]) -> String {
        keys::build_key(parts)
    }

    pub fn usage_snapshot(&self) -> Vec<(String, KeyUsage)> {
        self.usage
            .lock()
            .iter()
            .map(|(k, u)| (k.clone(), u.clone()))
            .collect()
    }

    /// Forget usage for keys the fast tier no longer holds
    pub fn prune_usage(&self) -> usize {
        let mut usage = self.usage.lock();
        let before = usage.len();
        usage.retain(|key, _| self.fast.entry_info(key).is_some());
        before - usage.len()
    }

    /// Remove `key` only if it has not been touched since `cold_before`.
    /// The check and the fast-tier removal happen under the usage lock.
    /// Returns the bytes reclaimed.
    pub async fn evict_if_cold(&self, key: &str, cold_before: Instant) -> Option<usize> {
        let reclaimed = {
            let mut usage = self.usage.lock();
            match usage.get(key) {
                Some(u) if u.last_access < cold_before => {}
                _ => return None,
            }
            usage.remove(key);
            self.fast.evict(key).unwrap_or(0)
        };

        if let Some(secondary) = &self.secondary {
            if let Err(e) = secondary.delete(key).await {
                self.store_error(secondary.name(), "delete", key, &e);
            }
        }
        Some(reclaimed)
    }

    /// Lower the expiry of a key in both tiers and mark it as adjusted.
    /// Returns false when the fast tier no longer holds the key.
    pub async fn adjust_ttl(&self, key: &str, ttl: Duration) -> bool {
        let applied = match self.fast.expire(key, ttl).await {
            Ok(applied) => applied,
            Err(e) => {
                self.store_error(self.fast.name(), "expire", key, &e);
                false
            }
        };
        if !applied {
            return false;
        }
        if let Some(secondary) = &self.secondary {
            if let Err(e) = secondary.expire(key, ttl).await {
                self.store_error(secondary.name(), "expire", key, &e);
            }
        }
        if let Some(usage) = self.usage.lock().get_mut(key) {
            usage.ttl = ttl;
            usage.ttl_adjusted = true;
        }
        true
    }

    /// Log final statistics and close the secondary tier
    pub async fn shutdown(&self) {
        let stats = self.get_stats().await;
        info!(
            hits = stats.hits,
            misses = stats.misses,
            keys = stats.keys,
            hit_rate = stats.hit_rate,
            "Cache shutting down"
        );
        if let Some(secondary) = &self.secondary {
            if let Err(e) = secondary.close().await {
                warn!(tier = secondary.name(), error = %e, "Failed to close cache tier");
            }
        }
    }
}

async fn probe(store: &dyn CacheStore) -> TierHealth {
    let key = format!("health:probe:{}", uuid::Uuid::new_v4());
    let started = Instant::now();
    let marker = Value::String(key.clone());

    let result = async {
        store.set(&key, marker.clone(), Duration::from_secs(10)).await?;
        let read = store.get(&key).await?;
        store.delete(&key).await?;
        if read.as_ref() != Some(&marker) {
            return Err(StoreError::Other("probe value mismatch".to_string()));
        }
        Ok::<_, StoreError>(())
    }
    .await;

    TierHealth {
        tier: store.name().to_string(),
        healthy: result.is_ok(),
        latency_ms: started.elapsed().as_millis() as u64,
        error: result.err().map(|e| e.to_string()),
    }
}
