// src/service.rs
// Wires the cache, optimizer and recovery manager together and owns the
// optimizer timer

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::cache::{CacheManager, CacheOptimizer};
use crate::config::CoreConfig;
use crate::monitoring::health::{Component, ComponentStatus, HealthStatus, HealthTracker};
use crate::recovery::ErrorRecoveryManager;

struct OptimizerTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// One instance per process; components are shared by `Arc`
pub struct ResilienceCore {
    config: CoreConfig,
    pub cache: Arc<CacheManager>,
    pub optimizer: Arc<CacheOptimizer>,
    pub recovery: Arc<ErrorRecoveryManager>,
    health: Arc<HealthTracker>,
    optimizer_task: parking_lot::Mutex<Option<OptimizerTask>>,
}

impl ResilienceCore {
    /// Memory-only cache; use [`connect`](Self::connect) for the Redis tier
    pub fn new(config: CoreConfig) -> Self {
        let cache = Arc::new(CacheManager::new(config.cache.clone()));
        Self::assemble(config, cache)
    }

    pub async fn connect(config: CoreConfig) -> Self {
        let cache = Arc::new(CacheManager::connect(config.cache.clone()).await);
        Self::assemble(config, cache)
    }

    fn assemble(config: CoreConfig, cache: Arc<CacheManager>) -> Self {
        let optimizer = Arc::new(CacheOptimizer::new(cache.clone(), config.optimizer.clone()));
        let recovery = Arc::new(ErrorRecoveryManager::new(config.recovery.clone()));
        Self {
            config,
            cache,
            optimizer,
            recovery,
            health: Arc::new(HealthTracker::new()),
            optimizer_task: parking_lot::Mutex::new(None),
        }
    }

    /// Report component status into an existing tracker
    pub fn with_health_tracker(mut self, health: Arc<HealthTracker>) -> Self {
        self.health = health;
        self
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Run an optimization pass every `interval`. Returns false when a timer
    /// is already running.
    pub fn spawn_optimizer(&self, interval: Duration) -> bool {
        let mut slot = self.optimizer_task.lock();
        if slot.is_some() {
            return false;
        }

        let (stop, mut stopped) = watch::channel(false);
        let optimizer = self.optimizer.clone();
        let period = interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // a pass in progress always runs to completion
                        optimizer.optimize_cache().await;
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Cache optimizer stopped");
        });

        info!(interval_secs = period.as_secs_f64(), "Cache optimizer scheduled");
        *slot = Some(OptimizerTask { stop, handle });
        true
    }

    pub fn optimizer_running(&self) -> bool {
        self.optimizer_task.lock().is_some()
    }

    /// Probe the cache tiers, fold breaker state in, and return overall health
    pub async fn health_status(&self) -> HealthStatus {
        let cache = self.cache.health_check().await;
        self.health.set_component_status(
            Component::FastCache,
            if cache.healthy {
                ComponentStatus::Healthy
            } else {
                ComponentStatus::Unhealthy
            },
        );
        let secondary = match &cache.secondary {
            Some(tier) if !tier.healthy => ComponentStatus::Unhealthy,
            _ => ComponentStatus::Healthy,
        };
        self.health
            .set_component_status(Component::SecondaryCache, secondary);

        let open = self.recovery.open_circuit_count();
        self.health.set_component_status(
            Component::Recovery,
            if open > 0 {
                ComponentStatus::Degraded
            } else {
                ComponentStatus::Healthy
            },
        );

        self.health.get_status()
    }

    /// Stop the optimizer timer (waiting for an in-flight pass) and close
    /// both cache tiers
    pub async fn shutdown(&self) {
        let task = self.optimizer_task.lock().take();
        if let Some(OptimizerTask { stop, handle }) = task {
            let _ = stop.send(true);
            if let Err(e) = handle.await {
                warn!(error = %e, "Optimizer task ended abnormally");
            }
        }

        let analytics = self.recovery.get_error_analytics();
        info!(
            total_errors = analytics.total_errors,
            open_circuits = self.recovery.open_circuit_count(),
            "Recovery manager shutting down"
        );
        self.cache.shutdown().await;
        self.health.mark_not_ready();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_health_status_memory_only() {
        let core = ResilienceCore::new(CoreConfig::default());
        let status = core.health_status().await;
        assert_eq!(status.status, ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_spawn_optimizer_once() {
        let core = ResilienceCore::new(CoreConfig::default());
        assert!(core.spawn_optimizer(Duration::from_millis(20)));
        assert!(!core.spawn_optimizer(Duration::from_millis(20)));

        core.cache.set("k", json!(1), None).await;
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(core.optimizer.get_optimization_summary().await.total_runs >= 1);

        core.shutdown().await;
        assert!(!core.optimizer_running());
    }
}
