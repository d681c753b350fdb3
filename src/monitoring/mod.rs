//! Monitoring module for sprintcore
//!
//! Provides:
//! - Structured logging with tracing
//! - Prometheus metrics collection
//! - Component health tracking

pub mod config;
pub mod health;
pub mod metrics;
pub mod tracing_config;

pub use config::{LogFormat, MonitoringConfig};
pub use health::{Component, ComponentStatus, HealthStatus, HealthTracker};
pub use metrics::{export_prometheus, REGISTRY};

use std::sync::Arc;
use std::time::Instant;
use tracing_appender::non_blocking::WorkerGuard;

/// Logging guard plus health tracker, created once at startup
pub struct MonitoringContext {
    pub config: MonitoringConfig,
    pub health: Arc<HealthTracker>,
    pub startup_time: Instant,
    _log_guard: Option<WorkerGuard>,
}

impl MonitoringContext {
    /// Initialize tracing and the health tracker.
    /// Metrics are registered lazily on first use.
    pub fn new(config: MonitoringConfig) -> std::io::Result<Self> {
        let log_guard = tracing_config::init_tracing(&config)?;

        tracing::info!(
            log_level = %config.log_level,
            log_format = config.log_format.as_str(),
            file_logging = config.enable_file_logging,
            "Monitoring system initialized"
        );

        Ok(Self {
            config,
            health: Arc::new(HealthTracker::new()),
            startup_time: Instant::now(),
            _log_guard: log_guard,
        })
    }

    /// Marks the system ready and logs how long startup took
    pub fn startup_complete(&self) {
        self.health.mark_ready();
        tracing::info!(
            duration_ms = self.startup_time.elapsed().as_millis() as u64,
            "Application startup complete"
        );
    }

    pub fn health_status(&self) -> HealthStatus {
        self.health.get_status()
    }
}
