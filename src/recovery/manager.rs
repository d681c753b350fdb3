// src/recovery/manager.rs
// Retry, circuit-breaker gating, fallback and graceful degradation around
// fallible operations

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use super::backoff::RetryPolicy;
use super::circuit_breaker::{BreakerConfig, BreakerRegistry, BreakerSnapshot, CircuitState};
use crate::error::{CoreError, ErrorKind, RecoveryError};
use crate::monitoring::metrics::{RECOVERY_OUTCOMES_TOTAL, RECOVERY_RETRIES_TOTAL};

pub const DEFAULT_ERROR_HISTORY: usize = 100;

/// Operation-name fragments whose failures may be answered with a degraded result
pub const DEFAULT_DEGRADABLE_OPERATIONS: &[&str] =
    &["report", "bulk", "batch", "list", "search", "summary"];

pub type FallbackFn<T> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T, CoreError>> + Send>;
pub type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub retry: RetryPolicy,
    pub breaker: BreakerConfig,
    pub max_error_history: usize,
    pub degradable_operations: Vec<String>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
            max_error_history: DEFAULT_ERROR_HISTORY,
            degradable_operations: DEFAULT_DEGRADABLE_OPERATIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Per-call recovery settings, built by the caller for each invocation
pub struct RecoveryContext<T> {
    pub operation_name: String,
    pub tool_name: String,
    pub partial_result_tolerance: bool,
    /// Caller knows failures of this call are never transient
    pub non_retryable: bool,
    fallback: Option<FallbackFn<T>>,
    cleanup: Option<CleanupFn>,
}

impl<T: Send + 'static> RecoveryContext<T> {
    pub fn new(tool_name: impl Into<String>, operation_name: impl Into<String>) -> Self {
        Self {
            operation_name: operation_name.into(),
            tool_name: tool_name.into(),
            partial_result_tolerance: false,
            non_retryable: false,
            fallback: None,
            cleanup: None,
        }
    }

    pub fn with_fallback<F, Fut>(mut self, fallback: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, CoreError>> + Send + 'static,
    {
        self.fallback = Some(Box::new(move || fallback().boxed()));
        self
    }

    pub fn with_cleanup<F, Fut>(mut self, cleanup: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cleanup = Some(Box::new(move || cleanup().boxed()));
        self
    }

    pub fn with_partial_results(mut self) -> Self {
        self.partial_result_tolerance = true;
        self
    }

    pub fn non_retryable(mut self) -> Self {
        self.non_retryable = true;
        self
    }
}

impl<T> RecoveryContext<T> {
    /// Breaker / analytics key, `tool:operation`
    pub fn operation_key(&self) -> String {
        format!("{}:{}", self.tool_name, self.operation_name)
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }
}

/// Stand-in payload returned when a degradable operation cannot complete
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DegradedResult {
    pub error: bool,
    pub degraded: bool,
    pub operation: String,
    pub tool: String,
    pub error_kind: ErrorKind,
    pub message: String,
    pub attempts: u32,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

/// How a recovered call produced its answer
#[derive(Debug)]
pub enum Recovered<T> {
    Success { value: T, attempts: u32 },
    Fallback { value: T, attempts: u32, cause: CoreError },
    Degraded(DegradedResult),
}

impl<T> Recovered<T> {
    pub fn outcome(&self) -> Outcome {
        match self {
            Recovered::Success { .. } => Outcome::Success,
            Recovered::Fallback { .. } => Outcome::Fallback,
            Recovered::Degraded(_) => Outcome::Degraded,
        }
    }

    /// The value for success and fallback outcomes
    pub fn into_value(self) -> Option<T> {
        match self {
            Recovered::Success { value, .. } | Recovered::Fallback { value, .. } => Some(value),
            Recovered::Degraded(_) => None,
        }
    }

    pub fn degraded(&self) -> Option<&DegradedResult> {
        match self {
            Recovered::Degraded(d) => Some(d),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Recovered::Success { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Fallback,
    Degraded,
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Fallback => "fallback",
            Outcome::Degraded => "degraded",
            Outcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub tool: String,
    pub kind: ErrorKind,
    pub message: String,
    pub attempt: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OutcomeCounts {
    pub successes: u64,
    pub fallbacks: u64,
    pub degraded: u64,
    pub failures: u64,
    pub retries: u64,
    pub short_circuits: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorAnalytics {
    /// Every failure recorded since start (not bounded by the history size)
    pub total_errors: u64,
    pub errors_by_tool: BTreeMap<String, u64>,
    pub errors_by_type: BTreeMap<String, u64>,
    pub recent_errors: Vec<ErrorRecord>,
    pub outcomes: OutcomeCounts,
}

#[derive(Default)]
struct OutcomeCounters {
    successes: AtomicU64,
    fallbacks: AtomicU64,
    degraded: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    short_circuits: AtomicU64,
}

/// Owns the breaker registry and error history for the whole process.
/// Construct once and share behind an `Arc`.
pub struct ErrorRecoveryManager {
    config: RecoveryConfig,
    breakers: BreakerRegistry,
    history: Mutex<VecDeque<ErrorRecord>>,
    total_errors: AtomicU64,
    counters: OutcomeCounters,
}

impl ErrorRecoveryManager {
    pub fn new(config: RecoveryConfig) -> Self {
        let capacity = config.max_error_history.max(1);
        Self {
            breakers: BreakerRegistry::new(config.breaker.clone()),
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            total_errors: AtomicU64::new(0),
            counters: OutcomeCounters::default(),
            config,
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Run `operation` under the breaker for `context.operation_key()`,
    /// retrying transient failures with exponential backoff.
    ///
    /// * validation-type failures (or a `non_retryable` context) are raised after one attempt
    /// * an open breaker skips the operation entirely
    /// * on exhaustion: fallback, then degraded result, then the final error
    /// * the cleanup hook runs exactly once on any failure path
    pub async fn execute_with_recovery<T, F, Fut>(
        &self,
        mut operation: F,
        mut context: RecoveryContext<T>,
    ) -> Result<Recovered<T>, RecoveryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let key = context.operation_key();
        let breaker = self.breakers.get_or_create(&key);
        let started = Instant::now();
        let max_attempts = if context.non_retryable {
            1
        } else {
            self.config.retry.max_attempts.max(1)
        };

        let mut attempts: u32 = 0;
        let mut last_error: Option<CoreError> = None;

        loop {
            let permit = match breaker.try_acquire() {
                Ok(permit) => permit,
                Err(open) => {
                    self.counters.short_circuits.fetch_add(1, Ordering::Relaxed);
                    debug!(operation = %key, attempts, "Circuit open, skipping execution");
                    // Prefer the real failure if the breaker tripped mid-retry
                    last_error = Some(last_error.unwrap_or(open));
                    break;
                }
            };

            attempts += 1;
            match operation().await {
                Ok(value) => {
                    if permit.is_trial() {
                        debug!(operation = %key, "Half-open trial succeeded");
                    }
                    permit.succeeded();
                    self.count(Outcome::Success, &context.tool_name);
                    crate::log_recovery!(
                        key.as_str(),
                        Outcome::Success.as_str(),
                        attempts,
                        started.elapsed().as_millis() as u64
                    );
                    return Ok(Recovered::Success { value, attempts });
                }
                Err(err) => {
                    permit.failed(&err);
                    self.record_error(&key, &context.tool_name, &err, attempts);

                    if !err.is_retryable() || context.non_retryable {
                        warn!(operation = %key, kind = %err.kind(), error = %err, "Non-retryable failure");
                        run_cleanup(&mut context).await;
                        self.count(Outcome::Failed, &context.tool_name);
                        return Err(RecoveryError {
                            operation: key,
                            attempts,
                            source: err,
                        });
                    }

                    if attempts >= max_attempts {
                        last_error = Some(err);
                        break;
                    }

                    if breaker.state() == CircuitState::Open {
                        self.counters.short_circuits.fetch_add(1, Ordering::Relaxed);
                        debug!(operation = %key, attempts, "Circuit opened mid-retry, not waiting out backoff");
                        last_error = Some(err);
                        break;
                    }

                    let delay = self.config.retry.delay_after(&err, attempts - 1);
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    RECOVERY_RETRIES_TOTAL
                        .with_label_values(&[context.tool_name.as_str()])
                        .inc();
                    debug!(
                        operation = %key,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying after failure"
                    );
                    last_error = Some(err);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        let error = last_error.unwrap_or_else(|| CoreError::CircuitOpen {
            operation: key.clone(),
            retry_in: Duration::ZERO,
        });
        self.resolve_failure(context, key, error, attempts).await
    }

    /// Same as [`execute_with_recovery`](Self::execute_with_recovery) with the
    /// receiver handed to the operation explicitly
    pub async fn execute_with<'r, R, T, F, Fut>(
        &self,
        receiver: &'r R,
        mut operation: F,
        context: RecoveryContext<T>,
    ) -> Result<Recovered<T>, RecoveryError>
    where
        R: ?Sized,
        F: FnMut(&'r R) -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        self.execute_with_recovery(|| operation(receiver), context)
            .await
    }

    async fn resolve_failure<T>(
        &self,
        mut context: RecoveryContext<T>,
        key: String,
        error: CoreError,
        attempts: u32,
    ) -> Result<Recovered<T>, RecoveryError> {
        run_cleanup(&mut context).await;

        if let Some(fallback) = context.fallback.take() {
            match fallback().await {
                Ok(value) => {
                    warn!(operation = %key, attempts, error = %error, "Fallback used");
                    self.count(Outcome::Fallback, &context.tool_name);
                    return Ok(Recovered::Fallback {
                        value,
                        attempts,
                        cause: error,
                    });
                }
                Err(fallback_err) => {
                    error!(operation = %key, error = %fallback_err, "Fallback failed");
                }
            }
        }

        if context.partial_result_tolerance && self.is_degradable(&context.operation_name) {
            warn!(operation = %key, attempts, error = %error, "Returning degraded result");
            self.count(Outcome::Degraded, &context.tool_name);
            return Ok(Recovered::Degraded(DegradedResult {
                error: true,
                degraded: true,
                operation: context.operation_name.clone(),
                tool: context.tool_name.clone(),
                error_kind: error.kind(),
                message: format!(
                    "{} is temporarily unavailable; returning partial results ({})",
                    context.operation_name, error
                ),
                attempts,
                data: Value::Object(serde_json::Map::new()),
                timestamp: Utc::now(),
            }));
        }

        error!(operation = %key, attempts, error = %error, "Operation failed");
        self.count(Outcome::Failed, &context.tool_name);
        Err(RecoveryError {
            operation: key,
            attempts,
            source: error,
        })
    }

    pub fn is_degradable(&self, operation_name: &str) -> bool {
        let name = operation_name.to_lowercase();
        self.config
            .degradable_operations
            .iter()
            .any(|pattern| name.contains(&pattern.to_lowercase()))
    }

    fn record_error(&self, key: &str, tool: &str, err: &CoreError, attempt: u32) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
        let record = ErrorRecord {
            timestamp: Utc::now(),
            operation: key.to_string(),
            tool: tool.to_string(),
            kind: err.kind(),
            message: err.to_string(),
            attempt,
        };
        let max = self.config.max_error_history.max(1);
        let mut history = self.history.lock();
        while history.len() >= max {
            history.pop_front();
        }
        history.push_back(record);
    }

    fn count(&self, outcome: Outcome, tool: &str) {
        let counter = match outcome {
            Outcome::Success => &self.counters.successes,
            Outcome::Fallback => &self.counters.fallbacks,
            Outcome::Degraded => &self.counters.degraded,
            Outcome::Failed => &self.counters.failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        RECOVERY_OUTCOMES_TOTAL
            .with_label_values(&[tool, outcome.as_str()])
            .inc();
    }

    pub fn get_error_analytics(&self) -> ErrorAnalytics {
        let history = self.history.lock();
        let mut errors_by_tool = BTreeMap::new();
        let mut errors_by_type = BTreeMap::new();
        for record in history.iter() {
            *errors_by_tool.entry(record.tool.clone()).or_insert(0) += 1;
            *errors_by_type
                .entry(record.kind.as_str().to_string())
                .or_insert(0) += 1;
        }

        ErrorAnalytics {
            total_errors: self.total_errors.load(Ordering::Relaxed),
            errors_by_tool,
            errors_by_type,
            recent_errors: history.iter().cloned().collect(),
            outcomes: self.outcome_counts(),
        }
    }

    pub fn outcome_counts(&self) -> OutcomeCounts {
        OutcomeCounts {
            successes: self.counters.successes.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
            degraded: self.counters.degraded.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            short_circuits: self.counters.short_circuits.load(Ordering::Relaxed),
        }
    }

    pub fn get_circuit_breaker_stats(&self) -> BTreeMap<String, BreakerSnapshot> {
        self.breakers.snapshot()
    }

    /// Returns false when no breaker exists for `key`
    pub fn reset_circuit_breaker(&self, key: &str) -> bool {
        match self.breakers.get(key) {
            Some(breaker) => {
                breaker.reset();
                tracing::info!(operation = %key, "Circuit breaker reset");
                true
            }
            None => false,
        }
    }

    pub fn reset_all_circuit_breakers(&self) {
        self.breakers.reset_all();
    }

    pub fn open_circuit_count(&self) -> usize {
        self.breakers.open_count()
    }

    /// Drop recorded errors; lifetime totals are kept
    pub fn clear_error_history(&self) {
        self.history.lock().clear();
    }
}

impl Default for ErrorRecoveryManager {
    fn default() -> Self {
        Self::new(RecoveryConfig::default())
    }
}

async fn run_cleanup<T>(context: &mut RecoveryContext<T>) {
    if let Some(cleanup) = context.cleanup.take() {
        cleanup().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    fn quick_config() -> RecoveryConfig {
        RecoveryConfig {
            retry: RetryPolicy::default()
                .with_base_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(5)),
            ..RecoveryConfig::default()
        }
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let manager = ErrorRecoveryManager::new(quick_config());
        let result = manager
            .execute_with_recovery(
                || async { Ok::<_, CoreError>(42) },
                RecoveryContext::new("jira", "get-sprint"),
            )
            .await
            .unwrap();
        assert!(matches!(result, Recovered::Success { value: 42, attempts: 1 }));
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let manager = ErrorRecoveryManager::new(quick_config());
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = manager
            .execute_with_recovery(
                move || {
                    let c = c.clone();
                    async move {
                        if c.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(CoreError::service("github", "connection reset"))
                        } else {
                            Ok("commits")
                        }
                    }
                },
                RecoveryContext::new("github", "list-commits"),
            )
            .await
            .unwrap();

        assert!(matches!(result, Recovered::Success { attempts: 2, .. }));
        assert_eq!(manager.get_error_analytics().total_errors, 1);
        assert_eq!(manager.outcome_counts().retries, 1);
    }

    #[tokio::test]
    async fn test_non_retryable_context_runs_once() {
        let manager = ErrorRecoveryManager::new(quick_config());
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let err = manager
            .execute_with_recovery(
                move || {
                    c.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(CoreError::service("jira", "timeout")) }
                },
                RecoveryContext::new("jira", "create-issue").non_retryable(),
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.attempts, 1);
    }

    #[tokio::test]
    async fn test_is_degradable() {
        let manager = ErrorRecoveryManager::default();
        assert!(manager.is_degradable("generate-report"));
        assert!(manager.is_degradable("bulk-fetch-issues"));
        assert!(!manager.is_degradable("get-sprint"));
    }

    #[tokio::test]
    async fn test_execute_with_receiver() {
        struct Client {
            base: u32,
        }
        let manager = ErrorRecoveryManager::new(quick_config());
        let client = Client { base: 40 };
        let result = manager
            .execute_with(
                &client,
                |c: &Client| {
                    let v = c.base + 2;
                    async move { Ok::<_, CoreError>(v) }
                },
                RecoveryContext::new("jira", "get-velocity"),
            )
            .await
            .unwrap();
        assert_eq!(result.into_value(), Some(42));
    }
}
