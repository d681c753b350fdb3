use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

// Global Prometheus registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn service_and_env() -> (String, String) {
    let service = std::env::var("APP_SERVICE")
        .ok()
        .unwrap_or_else(|| env!("APP_SERVICE_DEFAULT").to_string());
    let env_name = std::env::var("APP_ENV")
        .ok()
        .unwrap_or_else(|| env!("APP_ENV_DEFAULT").to_string());
    (service, env_name)
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let (service, env_name) = service_and_env();
    let c = IntCounterVec::new(
        Opts::new(name, help)
            .const_label("service", service)
            .const_label("env", env_name),
        labels,
    )
    .expect("valid counter vec opts");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
}

fn counter(name: &str, help: &str) -> IntCounter {
    let (service, env_name) = service_and_env();
    let c = IntCounter::with_opts(
        Opts::new(name, help)
            .const_label("service", service)
            .const_label("env", env_name),
    )
    .expect("valid counter opts");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
}

// App info gauge (const)
pub static APP_INFO: Lazy<IntGauge> = Lazy::new(|| {
    let (service, env_name) = service_and_env();
    let g = IntGauge::with_opts(
        Opts::new("app_info", "Application info gauge")
            .const_label("service", &service)
            .const_label("env", &env_name)
            .const_label("version", env!("CARGO_PKG_VERSION"))
            .const_label("git_sha", env!("GIT_SHA"))
            .const_label("build_time", env!("BUILD_TIME")),
    )
    .expect("valid app_info opts");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

// Cache metrics, labelled by tier ("memory", "redis")
pub static CACHE_HITS_TOTAL: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("cache_hits_total", "Total cache hits", &["tier"]));

pub static CACHE_MISSES_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| counter("cache_misses_total", "Lookups that missed every tier"));

pub static CACHE_STORE_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "cache_store_errors_total",
        "Store failures absorbed by the cache manager",
        &["tier", "op"],
    )
});

// Recovery metrics
pub static RECOVERY_OUTCOMES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "recovery_outcomes_total",
        "Recovered operation outcomes (success, fallback, degraded, failed)",
        &["tool", "outcome"],
    )
});

pub static RECOVERY_RETRIES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "recovery_retries_total",
        "Retry attempts scheduled after a retryable failure",
        &["tool"],
    )
});

pub static CIRCUIT_TRANSITIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "circuit_transitions_total",
        "Circuit breaker state transitions",
        &["to_state"],
    )
});

pub static CIRCUIT_REJECTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "circuit_rejections_total",
        "Calls short-circuited by an open breaker",
    )
});

// Optimizer metrics
pub static OPTIMIZER_RUN_DURATION_MS: Lazy<Histogram> = Lazy::new(|| {
    let (service, env_name) = service_and_env();
    let mut opts = HistogramOpts::new(
        "optimizer_run_duration_ms",
        "Cache optimization pass duration in milliseconds",
    )
    .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0]);
    opts.common_opts = opts
        .common_opts
        .const_label("service", service)
        .const_label("env", env_name);
    let h = Histogram::with_opts(opts).expect("valid histogram opts");
    REGISTRY.register(Box::new(h.clone())).ok();
    h
});

pub static OPTIMIZER_BYTES_RECLAIMED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "optimizer_bytes_reclaimed_total",
        "Estimated bytes released by optimization passes",
    )
});

pub static CACHE_WARM_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "cache_warm_total",
        "Cache warming results (warmed, skipped, failed)",
        &["result"],
    )
});

pub fn observe_optimizer_run_ms(ms: f64) {
    OPTIMIZER_RUN_DURATION_MS.observe(ms);
}

/// Render every registered metric in the Prometheus text format
pub fn export_prometheus() -> String {
    APP_INFO.set(1);
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode prometheus metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_registered_metrics() {
        CACHE_HITS_TOTAL.with_label_values(&["memory"]).inc();
        RECOVERY_OUTCOMES_TOTAL
            .with_label_values(&["jira", "success"])
            .inc();
        let text = export_prometheus();
        assert!(text.contains("cache_hits_total"));
        assert!(text.contains("recovery_outcomes_total"));
        assert!(text.contains("app_info"));
    }
}
