// src/main.rs
use std::sync::Arc;

use sprintcore::config::CoreConfig;
use sprintcore::monitoring::MonitoringContext;
use sprintcore::ResilienceCore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = CoreConfig::from_env()?;

    let monitoring = MonitoringContext::new(config.monitoring.clone())?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        git_sha = env!("GIT_SHA"),
        "Starting sprintcore"
    );

    let optimizer_interval = config.optimizer.interval;
    let core = ResilienceCore::connect(config)
        .await
        .with_health_tracker(Arc::clone(&monitoring.health));

    let health = core.health_status().await;
    tracing::info!(status = %health.status, message = ?health.message, "Initial health check");

    core.spawn_optimizer(optimizer_interval);
    monitoring.startup_complete();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    core.shutdown().await;
    tracing::debug!(metrics = %sprintcore::monitoring::export_prometheus(), "Final metrics");
    Ok(())
}
