// src/cache/optimizer.rs
// Single-shot cache maintenance passes and proactive warming.
// Scheduling belongs to the caller (see service::ResilienceCore::spawn_optimizer).

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::keys::{self, DataKind};
use super::manager::{CacheManager, KeyUsage};
use super::CacheStats;
use crate::error::CoreResult;
use crate::monitoring::metrics::{
    observe_optimizer_run_ms, CACHE_WARM_TOTAL, OPTIMIZER_BYTES_RECLAIMED_TOTAL,
};

/// Minimum lookups before a global hit rate is worth acting on
const MIN_LOOKUPS_FOR_HIT_RATE: u64 = 20;

#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Period used by the service timer
    pub interval: Duration,
    /// A key must be idle at least this long to count as cold
    pub idle_threshold: Duration,
    pub max_actions_per_run: usize,
    /// When false passes only produce recommendations
    pub auto_apply: bool,
    pub large_entry_bytes: usize,
    pub low_hit_rate: f64,
    /// TTL reductions never go below this
    pub min_ttl: Duration,
    pub hot_key_hits: u64,
    pub target_hit_rate: f64,
    pub warm_concurrency: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            idle_threshold: Duration::from_secs(300),
            max_actions_per_run: 100,
            auto_apply: true,
            large_entry_bytes: 64 * 1024,
            low_hit_rate: 0.2,
            min_ttl: Duration::from_secs(60),
            hot_key_hits: 100,
            target_hit_rate: 0.6,
            warm_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OptimizationAction {
    PurgeExpired { count: usize, bytes: usize },
    RemoveColdKey { key: String, bytes: usize },
    ReduceTtl { key: String, from_secs: u64, to_secs: u64 },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    ReduceTtl,
    RemoveColdKeys,
    IncreaseCapacity,
    WarmCache,
    ExtendTtl,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub message: String,
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationReport {
    pub started_at: DateTime<Utc>,
    pub keys_processed: usize,
    pub space_saved: usize,
    pub actions_performed: Vec<OptimizationAction>,
    pub recommendations: Vec<Recommendation>,
    /// No cache activity since the previous pass, nothing was changed
    pub skipped: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationSummary {
    pub last_report: Option<OptimizationReport>,
    pub total_runs: u64,
    pub total_space_reclaimed: u64,
    pub total_actions: u64,
    pub total_keys_warmed: u64,
    pub last_run_at: Option<DateTime<Utc>>,
}

pub type FetchFn = Box<dyn FnOnce() -> BoxFuture<'static, CoreResult<Value>> + Send>;

/// A key to pre-populate and the callback that produces its value
pub struct WarmTarget {
    pub key: String,
    pub ttl: Option<Duration>,
    /// Refetch even when the key is already cached
    pub force: bool,
    fetch: FetchFn,
}

impl WarmTarget {
    pub fn new<F, Fut>(key: impl Into<String>, fetch: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CoreResult<Value>> + Send + 'static,
    {
        Self {
            key: key.into(),
            ttl: None,
            force: false,
            fetch: Box::new(move || fetch().boxed()),
        }
    }

    pub fn sprint<F, Fut>(sprint_id: &str, fetch: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CoreResult<Value>> + Send + 'static,
    {
        Self::new(keys::sprint(sprint_id), fetch).with_ttl(DataKind::Sprint.default_ttl())
    }

    pub fn repository<F, Fut>(owner: &str, repo: &str, fetch: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CoreResult<Value>> + Send + 'static,
    {
        Self::new(keys::repository(owner, repo), fetch)
            .with_ttl(DataKind::Repository.default_ttl())
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

impl std::fmt::Debug for WarmTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarmTarget")
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .field("force", &self.force)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WarmFailure {
    pub key: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WarmingReport {
    pub warmed: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<WarmFailure>,
    pub duration_ms: u64,
}

enum WarmOutcome {
    Warmed(String),
    Skipped(String),
    Failed(WarmFailure),
}

#[derive(Default)]
struct OptimizerState {
    /// Activity generation observed at the end of the previous pass
    last_generation: Option<u64>,
    last_pass_at: Option<Instant>,
    last_report: Option<OptimizationReport>,
    total_runs: u64,
    total_space_reclaimed: u64,
    total_actions: u64,
    last_run_at: Option<DateTime<Utc>>,
}

pub struct CacheOptimizer {
    cache: Arc<CacheManager>,
    config: OptimizerConfig,
    /// Held for the whole pass so passes never overlap
    state: Mutex<OptimizerState>,
    keys_warmed: AtomicU64,
}

impl CacheOptimizer {
    pub fn new(cache: Arc<CacheManager>, config: OptimizerConfig) -> Self {
        Self {
            cache,
            config,
            state: Mutex::new(OptimizerState::default()),
            keys_warmed: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// One maintenance pass: purge expired entries, drop cold keys, halve the
    /// TTL of large rarely-read keys, then build recommendations.
    ///
    /// A key is cold when it has not been touched since the previous pass
    /// started and has been idle for at least `idle_threshold`. Running a
    /// second pass with no cache traffic in between changes nothing.
    ///
    /// Passes over a quiet cache are skipped entirely, so entries that expire
    /// meanwhile stay in the fast tier until the next read, write or delete.
    /// Reads already treat them as misses.
    pub async fn optimize_cache(&self) -> OptimizationReport {
        let mut state = self.state.lock().await;
        let started = Instant::now();
        let started_at = Utc::now();

        let generation = self.cache.activity_generation();
        let skipped = state.last_generation == Some(generation);
        let cold_before = self.cold_cutoff(started, state.last_pass_at);

        let mut actions = Vec::new();
        let mut space_saved = 0usize;
        let keys_processed = self.cache.fast_store().snapshot().len();

        if skipped {
            debug!("No cache activity since last pass, skipping actions");
        } else if self.config.auto_apply {
            space_saved = self.apply_actions(cold_before, &mut actions).await;
        }

        let stats = self.cache.get_stats().await;
        let usage = self.cache.usage_snapshot();
        let recommendations = self.recommend(&stats, &usage, cold_before);

        let duration_ms = started.elapsed().as_millis() as u64;
        observe_optimizer_run_ms(duration_ms as f64);
        OPTIMIZER_BYTES_RECLAIMED_TOTAL.inc_by(space_saved as u64);

        let report = OptimizationReport {
            started_at,
            keys_processed,
            space_saved,
            actions_performed: actions,
            recommendations,
            skipped,
            duration_ms,
        };

        // traffic that landed during this pass must make the next one run
        state.last_generation = Some(generation);
        state.last_pass_at = Some(started);
        state.total_runs += 1;
        state.total_space_reclaimed += space_saved as u64;
        state.total_actions += report.actions_performed.len() as u64;
        state.last_run_at = Some(started_at);
        state.last_report = Some(report.clone());

        info!(
            keys_processed,
            actions = report.actions_performed.len(),
            space_saved,
            recommendations = report.recommendations.len(),
            skipped,
            duration_ms,
            "Cache optimization pass finished"
        );
        report
    }

    fn cold_cutoff(&self, now: Instant, last_pass_at: Option<Instant>) -> Option<Instant> {
        let idle_cutoff = now.checked_sub(self.config.idle_threshold)?;
        Some(match last_pass_at {
            Some(last) => last.min(idle_cutoff),
            None => idle_cutoff,
        })
    }

    async fn apply_actions(
        &self,
        cold_before: Option<Instant>,
        actions: &mut Vec<OptimizationAction>,
    ) -> usize {
        let budget = self.config.max_actions_per_run;
        let mut space_saved = 0;

        let (count, bytes) = self.cache.fast_store().purge_expired();
        if count > 0 && actions.len() < budget {
            actions.push(OptimizationAction::PurgeExpired { count, bytes });
            space_saved += bytes;
        }
        self.cache.prune_usage();

        let mut usage = self.cache.usage_snapshot();
        // oldest access first
        usage.sort_by_key(|(_, u)| u.last_access);

        if let Some(cutoff) = cold_before {
            for (key, u) in usage.iter().filter(|(_, u)| u.last_access < cutoff) {
                if actions.len() >= budget {
                    break;
                }
                if let Some(bytes) = self.cache.evict_if_cold(key, cutoff).await {
                    debug!(key = %key, bytes, idle_ms = u.last_access.elapsed().as_millis() as u64, "Removed cold key");
                    actions.push(OptimizationAction::RemoveColdKey {
                        key: key.clone(),
                        bytes,
                    });
                    space_saved += bytes;
                }
            }
        }

        for (key, u) in usage.iter().filter(|(_, u)| self.wants_ttl_reduction(u)) {
            if actions.len() >= budget {
                break;
            }
            let to = (u.ttl / 2).max(self.config.min_ttl);
            if self.cache.adjust_ttl(key, to).await {
                actions.push(OptimizationAction::ReduceTtl {
                    key: key.clone(),
                    from_secs: u.ttl.as_secs(),
                    to_secs: to.as_secs(),
                });
            }
        }

        if actions.len() >= budget {
            warn!(budget, "Optimizer action budget exhausted");
        }
        space_saved
    }

    fn wants_ttl_reduction(&self, usage: &KeyUsage) -> bool {
        !usage.ttl_adjusted
            && usage.size_bytes >= self.config.large_entry_bytes
            && usage.hit_rate() < self.config.low_hit_rate
            && usage.ttl > self.config.min_ttl
    }

    fn recommend(
        &self,
        stats: &CacheStats,
        usage: &[(String, KeyUsage)],
        cold_before: Option<Instant>,
    ) -> Vec<Recommendation> {
        let mut recommendations = Vec::new();

        let ttl_candidates: Vec<String> = usage
            .iter()
            .filter(|(_, u)| self.wants_ttl_reduction(u))
            .map(|(k, _)| k.clone())
            .collect();
        if !ttl_candidates.is_empty() {
            recommendations.push(Recommendation {
                kind: RecommendationKind::ReduceTtl,
                message: format!(
                    "{} large entries are rarely read; consider shorter TTLs",
                    ttl_candidates.len()
                ),
                keys: ttl_candidates,
            });
        }

        if let Some(cutoff) = cold_before {
            let cold: Vec<String> = usage
                .iter()
                .filter(|(_, u)| u.last_access < cutoff)
                .map(|(k, _)| k.clone())
                .collect();
            if !cold.is_empty() {
                recommendations.push(Recommendation {
                    kind: RecommendationKind::RemoveColdKeys,
                    message: format!("{} keys have not been accessed recently", cold.len()),
                    keys: cold,
                });
            }
        }

        if stats.evictions > 0 {
            recommendations.push(Recommendation {
                kind: RecommendationKind::IncreaseCapacity,
                message: format!(
                    "{} entries were evicted by the capacity limit of {}",
                    stats.evictions,
                    self.cache.fast_store().capacity()
                ),
                keys: Vec::new(),
            });
        }

        if stats.total_lookups() >= MIN_LOOKUPS_FOR_HIT_RATE
            && stats.hit_rate < self.config.target_hit_rate
        {
            recommendations.push(Recommendation {
                kind: RecommendationKind::WarmCache,
                message: format!(
                    "Hit rate {:.1}% is below target {:.1}%; warm frequently requested data",
                    stats.hit_rate * 100.0,
                    self.config.target_hit_rate * 100.0
                ),
                keys: Vec::new(),
            });
        }

        let hot: Vec<String> = usage
            .iter()
            .filter(|(_, u)| u.hits >= self.config.hot_key_hits)
            .map(|(k, _)| k.clone())
            .collect();
        if !hot.is_empty() {
            recommendations.push(Recommendation {
                kind: RecommendationKind::ExtendTtl,
                message: format!("{} keys are read very often; consider longer TTLs", hot.len()),
                keys: hot,
            });
        }

        recommendations
    }

    /// Fetch and cache every target with bounded concurrency.
    /// A failing (or panicking) fetch is reported and never stops the batch.
    pub async fn warm_cache(&self, targets: Vec<WarmTarget>) -> WarmingReport {
        let started = Instant::now();
        let total = targets.len();

        let outcomes: Vec<WarmOutcome> = futures_util::stream::iter(targets)
            .map(|target| self.warm_one(target))
            .buffer_unordered(self.config.warm_concurrency.max(1))
            .collect()
            .await;

        let mut report = WarmingReport::default();
        for outcome in outcomes {
            match outcome {
                WarmOutcome::Warmed(key) => report.warmed.push(key),
                WarmOutcome::Skipped(key) => report.skipped.push(key),
                WarmOutcome::Failed(failure) => report.failed.push(failure),
            }
        }
        report.duration_ms = started.elapsed().as_millis() as u64;

        self.keys_warmed
            .fetch_add(report.warmed.len() as u64, Ordering::Relaxed);
        CACHE_WARM_TOTAL
            .with_label_values(&["warmed"])
            .inc_by(report.warmed.len() as u64);
        CACHE_WARM_TOTAL
            .with_label_values(&["skipped"])
            .inc_by(report.skipped.len() as u64);
        CACHE_WARM_TOTAL
            .with_label_values(&["failed"])
            .inc_by(report.failed.len() as u64);

        info!(
            total,
            warmed = report.warmed.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            duration_ms = report.duration_ms,
            "Cache warming finished"
        );
        report
    }

    async fn warm_one(&self, target: WarmTarget) -> WarmOutcome {
        let WarmTarget {
            key,
            ttl,
            force,
            fetch,
        } = target;

        if !force && self.cache.exists(&key).await {
            return WarmOutcome::Skipped(key);
        }

        match AssertUnwindSafe(fetch()).catch_unwind().await {
            Ok(Ok(value)) => {
                self.cache.set(&key, value, ttl).await;
                debug!(key = %key, "Warmed cache key");
                WarmOutcome::Warmed(key)
            }
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "Cache warming fetch failed");
                WarmOutcome::Failed(WarmFailure {
                    key,
                    error: e.to_string(),
                })
            }
            Err(_) => {
                warn!(key = %key, "Cache warming fetch panicked");
                WarmOutcome::Failed(WarmFailure {
                    key,
                    error: "fetch panicked".to_string(),
                })
            }
        }
    }

    pub async fn get_optimization_summary(&self) -> OptimizationSummary {
        let state = self.state.lock().await;
        OptimizationSummary {
            last_report: state.last_report.clone(),
            total_runs: state.total_runs,
            total_space_reclaimed: state.total_space_reclaimed,
            total_actions: state.total_actions,
            total_keys_warmed: self.keys_warmed.load(Ordering::Relaxed),
            last_run_at: state.last_run_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use serde_json::json;

    fn optimizer(config: OptimizerConfig) -> (Arc<CacheManager>, CacheOptimizer) {
        let cache = Arc::new(CacheManager::new(CacheConfig::default()));
        let optimizer = CacheOptimizer::new(cache.clone(), config);
        (cache, optimizer)
    }

    #[tokio::test]
    async fn test_large_unread_key_ttl_halved_once() {
        let (cache, optimizer) = optimizer(OptimizerConfig {
            large_entry_bytes: 100,
            idle_threshold: Duration::from_secs(3600),
            ..OptimizerConfig::default()
        });
        let blob = json!("x".repeat(500));
        cache.set("report:big", blob, Some(Duration::from_secs(600))).await;

        let first = optimizer.optimize_cache().await;
        assert!(first.actions_performed.contains(&OptimizationAction::ReduceTtl {
            key: "report:big".into(),
            from_secs: 600,
            to_secs: 300,
        }));

        // new traffic elsewhere, but the key was already adjusted
        cache.set("other", json!(1), None).await;
        let second = optimizer.optimize_cache().await;
        assert!(second
            .actions_performed
            .iter()
            .all(|a| !matches!(a, OptimizationAction::ReduceTtl { .. })));
    }

    #[tokio::test]
    async fn test_ttl_reduction_floored() {
        let (cache, optimizer) = optimizer(OptimizerConfig {
            large_entry_bytes: 10,
            min_ttl: Duration::from_secs(100),
            idle_threshold: Duration::from_secs(3600),
            ..OptimizerConfig::default()
        });
        cache.set("k", json!("x".repeat(50)), Some(Duration::from_secs(120))).await;
        let report = optimizer.optimize_cache().await;
        assert!(report.actions_performed.contains(&OptimizationAction::ReduceTtl {
            key: "k".into(),
            from_secs: 120,
            to_secs: 100,
        }));
    }

    #[tokio::test]
    async fn test_recommend_only_mode_changes_nothing() {
        let (cache, optimizer) = optimizer(OptimizerConfig {
            auto_apply: false,
            idle_threshold: Duration::ZERO,
            ..OptimizerConfig::default()
        });
        cache.set("a", json!(1), None).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let report = optimizer.optimize_cache().await;
        assert!(report.actions_performed.is_empty());
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.kind == RecommendationKind::RemoveColdKeys));
        assert!(cache.exists("a").await);
    }

    #[tokio::test]
    async fn test_action_budget() {
        let (cache, optimizer) = optimizer(OptimizerConfig {
            max_actions_per_run: 2,
            idle_threshold: Duration::ZERO,
            ..OptimizerConfig::default()
        });
        for i in 0..5 {
            cache.set(&format!("k{}", i), json!(i), None).await;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;

        let report = optimizer.optimize_cache().await;
        assert_eq!(report.actions_performed.len(), 2);
        assert_eq!(cache.get_stats().await.keys, 3);
    }

    #[tokio::test]
    async fn test_summary_accumulates() {
        let (cache, optimizer) = optimizer(OptimizerConfig::default());
        cache.set("a", json!(1), None).await;
        optimizer.optimize_cache().await;
        optimizer.optimize_cache().await;

        let summary = optimizer.get_optimization_summary().await;
        assert_eq!(summary.total_runs, 2);
        assert!(summary.last_run_at.is_some());
        assert!(summary.last_report.map(|r| r.skipped).unwrap_or(false));
    }
}
