// src/config.rs
// Process configuration loaded from .env / environment variables

use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::cache::{CacheConfig, OptimizerConfig};
use crate::monitoring::MonitoringConfig;
use crate::recovery::RecoveryConfig;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    InvalidValue {
        var: String,
        value: String,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub cache: CacheConfig,
    pub recovery: RecoveryConfig,
    pub optimizer: OptimizerConfig,
    pub monitoring: MonitoringConfig,
}

impl CoreConfig {
    /// Load `.env` if present, then read the environment
    pub fn from_env() -> ConfigResult<Self> {
        dotenvy::dotenv().ok();
        let mut config = Self::from_lookup(|name| env::var(name).ok())?;
        config.monitoring = MonitoringConfig::from_env();
        Ok(config)
    }

    /// Build from an arbitrary variable source. Monitoring settings keep
    /// their defaults; `from_env` reads them separately.
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };
        let mut config = Self::default();

        let cache = &mut config.cache;
        if let Some(secs) = vars.parse::<u64>("CACHE_DEFAULT_TTL_SECS")? {
            cache.default_ttl = Duration::from_secs(secs);
        }
        if let Some(max) = vars.parse("CACHE_MAX_ENTRIES")? {
            cache.max_entries = max;
        }
        if let Some(enabled) = vars.flag("REDIS_ENABLED")? {
            cache.redis_enabled = enabled;
        }
        cache.redis_url = vars.get("REDIS_URL").filter(|url| !url.trim().is_empty());

        let retry = &mut config.recovery.retry;
        if let Some(attempts) = vars.parse("RETRY_MAX_ATTEMPTS")? {
            retry.max_attempts = attempts;
        }
        if let Some(ms) = vars.parse::<u64>("RETRY_BASE_DELAY_MS")? {
            retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(multiplier) = vars.parse("RETRY_MULTIPLIER")? {
            retry.multiplier = multiplier;
        }
        if let Some(ms) = vars.parse::<u64>("RETRY_MAX_DELAY_MS")? {
            retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = vars.parse::<u64>("RETRY_MAX_RETRY_AFTER_SECS")? {
            retry.max_retry_after = Duration::from_secs(secs);
        }

        let breaker = &mut config.recovery.breaker;
        if let Some(threshold) = vars.parse("CIRCUIT_FAILURE_THRESHOLD")? {
            breaker.failure_threshold = threshold;
        }
        if let Some(secs) = vars.parse::<u64>("CIRCUIT_COOLDOWN_SECS")? {
            breaker.cool_down = Duration::from_secs(secs);
        }
        if let Some(trials) = vars.parse("CIRCUIT_HALF_OPEN_TRIALS")? {
            breaker.half_open_max_trials = trials;
        }

        if let Some(size) = vars.parse("ERROR_HISTORY_SIZE")? {
            config.recovery.max_error_history = size;
        }
        if let Some(list) = vars.get("DEGRADABLE_OPERATIONS") {
            config.recovery.degradable_operations = list
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
        }

        let optimizer = &mut config.optimizer;
        if let Some(secs) = vars.parse::<u64>("OPTIMIZER_INTERVAL_SECS")? {
            optimizer.interval = Duration::from_secs(secs);
        }
        if let Some(secs) = vars.parse::<u64>("OPTIMIZER_IDLE_THRESHOLD_SECS")? {
            optimizer.idle_threshold = Duration::from_secs(secs);
        }
        if let Some(max) = vars.parse("OPTIMIZER_MAX_ACTIONS")? {
            optimizer.max_actions_per_run = max;
        }
        if let Some(auto) = vars.flag("OPTIMIZER_AUTO_APPLY")? {
            optimizer.auto_apply = auto;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let retry = &self.recovery.retry;
        let breaker = &self.recovery.breaker;

        if self.cache.max_entries == 0 {
            return Err(ConfigError::Invalid("CACHE_MAX_ENTRIES must be at least 1".into()));
        }
        if self.cache.default_ttl.is_zero() {
            return Err(ConfigError::Invalid("CACHE_DEFAULT_TTL_SECS must be positive".into()));
        }
        if self.cache.redis_enabled && self.cache.redis_url.is_none() {
            return Err(ConfigError::Invalid("REDIS_ENABLED requires REDIS_URL".into()));
        }
        if retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("RETRY_MAX_ATTEMPTS must be at least 1".into()));
        }
        if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid("RETRY_MULTIPLIER must be >= 1.0".into()));
        }
        if retry.base_delay > retry.max_delay {
            return Err(ConfigError::Invalid(
                "RETRY_BASE_DELAY_MS must not exceed RETRY_MAX_DELAY_MS".into(),
            ));
        }
        if breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid("CIRCUIT_FAILURE_THRESHOLD must be at least 1".into()));
        }
        if breaker.half_open_max_trials == 0 {
            return Err(ConfigError::Invalid("CIRCUIT_HALF_OPEN_TRIALS must be at least 1".into()));
        }
        if self.recovery.max_error_history == 0 {
            return Err(ConfigError::Invalid("ERROR_HISTORY_SIZE must be at least 1".into()));
        }
        if self.optimizer.interval.is_zero() {
            return Err(ConfigError::Invalid("OPTIMIZER_INTERVAL_SECS must be positive".into()));
        }
        Ok(())
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
    }

    fn parse<T>(&self, name: &str) -> ConfigResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(name) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    var: name.to_string(),
                    value: raw.clone(),
                    reason: e.to_string(),
                }),
        }
    }

    fn flag(&self, name: &str) -> ConfigResult<Option<bool>> {
        match self.get(name) {
            None => Ok(None),
            Some(raw) => match raw.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(Some(true)),
                "false" | "0" | "no" | "off" => Ok(Some(false)),
                _ => Err(ConfigError::InvalidValue {
                    var: name.to_string(),
                    value: raw,
                    reason: "expected true or false".to_string(),
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> ConfigResult<CoreConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        CoreConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.cache.default_ttl, Duration::from_secs(300));
        assert_eq!(config.recovery.retry.max_attempts, 3);
        assert_eq!(config.recovery.breaker.failure_threshold, 5);
        assert_eq!(config.recovery.max_error_history, 100);
        assert!(!config.cache.redis_enabled);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("CACHE_DEFAULT_TTL_SECS", "60"),
            ("REDIS_ENABLED", "yes"),
            ("REDIS_URL", "redis://localhost:6379"),
            ("RETRY_MAX_ATTEMPTS", "5"),
            ("CIRCUIT_COOLDOWN_SECS", "30"),
            ("DEGRADABLE_OPERATIONS", " Report, export ,,"),
            ("OPTIMIZER_AUTO_APPLY", "false"),
        ])
        .unwrap();

        assert_eq!(config.cache.default_ttl, Duration::from_secs(60));
        assert!(config.cache.redis_enabled);
        assert_eq!(config.recovery.retry.max_attempts, 5);
        assert_eq!(config.recovery.breaker.cool_down, Duration::from_secs(30));
        assert_eq!(config.recovery.degradable_operations, vec!["report", "export"]);
        assert!(!config.optimizer.auto_apply);
    }

    #[test]
    fn test_unparseable_value() {
        let err = load(&[("RETRY_MAX_ATTEMPTS", "three")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref var, .. } if var == "RETRY_MAX_ATTEMPTS"));

        let err = load(&[("REDIS_ENABLED", "maybe")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_semantic_validation() {
        assert!(matches!(
            load(&[("REDIS_ENABLED", "true")]),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            load(&[("RETRY_BASE_DELAY_MS", "20000"), ("RETRY_MAX_DELAY_MS", "1000")]),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            load(&[("CIRCUIT_FAILURE_THRESHOLD", "0")]),
            Err(ConfigError::Invalid(_))
        ));
    }
}
