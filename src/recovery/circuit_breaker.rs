//! Per-operation circuit breaker.
//!
//! # States
//! - Closed: calls pass through, consecutive counted failures are tallied
//! - Open: calls are rejected without running the operation
//! - HalfOpen: a bounded number of trial calls probe the dependency
//!
//! # Transitions
//! ```text
//! Closed   -> Open:     consecutive_failures >= failure_threshold
//! Open     -> HalfOpen: cool_down elapsed, on the next admission check
//! HalfOpen -> Closed:   a trial succeeds (counter reset)
//! HalfOpen -> Open:     a trial fails (cool-down restarts)
//! ```
//!
//! Admission is handed out as a [`CallPermit`]. A trial permit dropped
//! without being settled (cancelled future, panic) counts as a failed trial,
//! so HalfOpen always resolves.
//!
//! Only failures for which [`CoreError::counts_against_breaker`] holds move
//! the counter; validation failures are neutral.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::error::CoreError;
use crate::monitoring::metrics::{CIRCUIT_REJECTIONS_TOTAL, CIRCUIT_TRANSITIONS_TOTAL};

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cool_down: Duration,
    pub half_open_max_trials: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(60),
            half_open_max_trials: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of admission granted by [`CircuitBreaker::try_acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    Trial,
}

/// One admitted call. Settle it with [`succeeded`](Self::succeeded) or
/// [`failed`](Self::failed); an unsettled trial re-opens the breaker on drop.
#[must_use = "an admitted call must be settled"]
#[derive(Debug)]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl CallPermit<'_> {
    pub fn admission(&self) -> Admission {
        self.admission
    }

    pub fn is_trial(&self) -> bool {
        self.admission == Admission::Trial
    }

    pub fn succeeded(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn failed(mut self, error: &CoreError) {
        self.settled = true;
        self.breaker.record_failure(error);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.admission == Admission::Trial {
            self.breaker.abandon_trial();
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    last_failure_wall: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
    half_open_trials: u32,
    total_trips: u64,
}

/// Serializable view of one breaker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub is_open: bool,
    pub half_open_trials: u32,
    pub total_trips: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    key: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            key: key.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                last_failure_wall: None,
                opened_at: None,
                half_open_trials: 0,
                total_trips: 0,
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current state without side effects (an elapsed cool-down still reads Open)
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Ask to run one call.
    ///
    /// Returns `CoreError::CircuitOpen` when the call must be short-circuited.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, CoreError> {
        let admission = self.admit()?;
        Ok(CallPermit {
            breaker: self,
            admission,
            settled: false,
        })
    }

    fn admit(&self) -> Result<Admission, CoreError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.cool_down {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.half_open_trials = 1;
                    Ok(Admission::Trial)
                } else {
                    CIRCUIT_REJECTIONS_TOTAL.inc();
                    Err(self.open_error(self.config.cool_down - elapsed))
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_trials < self.config.half_open_max_trials.max(1) {
                    inner.half_open_trials += 1;
                    Ok(Admission::Trial)
                } else {
                    CIRCUIT_REJECTIONS_TOTAL.inc();
                    Err(self.open_error(Duration::ZERO))
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        if inner.state == CircuitState::HalfOpen {
            self.transition(&mut inner, CircuitState::Closed);
            inner.half_open_trials = 0;
            inner.opened_at = None;
            info!(operation = %self.key, "Circuit closed after successful trial");
        }
    }

    /// Record a failed call. Failures that do not count against the
    /// breaker only release a half-open trial slot.
    pub fn record_failure(&self, error: &CoreError) {
        let mut inner = self.inner.lock();
        if !error.counts_against_breaker() {
            if inner.state == CircuitState::HalfOpen {
                inner.half_open_trials = inner.half_open_trials.saturating_sub(1);
            }
            return;
        }

        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure_at = Some(Instant::now());
        inner.last_failure_wall = Some(Utc::now());

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.trip(&mut inner);
                    warn!(
                        operation = %self.key,
                        failures = inner.consecutive_failures,
                        cool_down_ms = self.config.cool_down.as_millis() as u64,
                        "Circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.trip(&mut inner);
                warn!(operation = %self.key, "Trial call failed, circuit re-opened");
            }
            // A call admitted before the trip finished late; keep the original cool-down
            CircuitState::Open => {}
        }
    }

    /// A trial that never reported back is treated as a failed trial
    fn abandon_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            self.trip(&mut inner);
            warn!(operation = %self.key, "Trial call abandoned, circuit re-opened");
        }
    }

    /// Force the breaker back to Closed with a clean counter
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed);
        }
        inner.consecutive_failures = 0;
        inner.half_open_trials = 0;
        inner.opened_at = None;
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.consecutive_failures,
            is_open: inner.state == CircuitState::Open,
            half_open_trials: inner.half_open_trials,
            total_trips: inner.total_trips,
            last_failure_at: inner.last_failure_wall,
        }
    }

    /// Time since the last counted failure
    pub fn since_last_failure(&self) -> Option<Duration> {
        self.inner.lock().last_failure_at.map(|t| t.elapsed())
    }

    fn trip(&self, inner: &mut BreakerInner) {
        self.transition(inner, CircuitState::Open);
        inner.opened_at = Some(Instant::now());
        inner.half_open_trials = 0;
        inner.total_trips += 1;
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        if inner.state != to {
            CIRCUIT_TRANSITIONS_TOTAL
                .with_label_values(&[to.as_str()])
                .inc();
            tracing::debug!(operation = %self.key, from = %inner.state, to = %to, "Circuit transition");
            inner.state = to;
        }
    }

    fn open_error(&self, retry_in: Duration) -> CoreError {
        CoreError::CircuitOpen {
            operation: self.key.clone(),
            retry_in,
        }
    }
}

/// Owns one breaker per operation key, created on first use
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(key) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write();
        Arc::clone(
            breakers
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.config.clone()))),
        )
    }

    pub fn get(&self, key: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(key).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, BreakerSnapshot> {
        self.breakers
            .read()
            .iter()
            .map(|(k, b)| (k.clone(), b.snapshot()))
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.breakers
            .read()
            .values()
            .filter(|b| b.state() == CircuitState::Open)
            .count()
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
    }

    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            cool_down: Duration::from_millis(40),
            half_open_max_trials: 1,
        }
    }

    fn service_error() -> CoreError {
        CoreError::service("jira", "503 service unavailable")
    }

    #[test]
    fn test_opens_at_threshold() {
        let breaker = CircuitBreaker::new("jira:get-sprint", fast_config());
        for _ in 0..2 {
            assert!(breaker.try_acquire().is_ok());
            breaker.record_failure(&service_error());
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure(&service_error());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(
            breaker.try_acquire(),
            Err(CoreError::CircuitOpen { .. })
        ));
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let breaker = CircuitBreaker::new("k", fast_config());
        breaker.record_failure(&service_error());
        breaker.record_failure(&service_error());
        breaker.record_success();
        breaker.record_failure(&service_error());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 1);
    }

    #[test]
    fn test_validation_failures_do_not_trip() {
        let breaker = CircuitBreaker::new("k", fast_config());
        for _ in 0..10 {
            breaker.record_failure(&CoreError::validation("bad sprint id"));
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 0);
    }

    #[test]
    fn test_half_open_admits_single_trial() {
        let breaker = CircuitBreaker::new("k", fast_config());
        for _ in 0..3 {
            breaker.record_failure(&service_error());
        }
        std::thread::sleep(Duration::from_millis(60));

        let trial = breaker.try_acquire().unwrap();
        assert_eq!(trial.admission(), Admission::Trial);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire().is_err());
        trial.succeeded();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_trial_success_closes() {
        let breaker = CircuitBreaker::new("k", fast_config());
        for _ in 0..3 {
            breaker.record_failure(&service_error());
        }
        std::thread::sleep(Duration::from_millis(60));
        breaker.try_acquire().unwrap().succeeded();

        let snap = breaker.snapshot();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.failure_count, 0);
        assert_eq!(snap.total_trips, 1);
    }

    #[test]
    fn test_trial_failure_reopens_with_fresh_cool_down() {
        let breaker = CircuitBreaker::new("k", fast_config());
        for _ in 0..3 {
            breaker.record_failure(&service_error());
        }
        std::thread::sleep(Duration::from_millis(60));
        breaker.try_acquire().unwrap().failed(&service_error());

        assert_eq!(breaker.state(), CircuitState::Open);
        // cool-down restarted: still rejected right away
        assert!(breaker.try_acquire().is_err());
        assert_eq!(breaker.snapshot().total_trips, 2);
    }

    #[test]
    fn test_neutral_failure_releases_trial_slot() {
        let breaker = CircuitBreaker::new("k", fast_config());
        for _ in 0..3 {
            breaker.record_failure(&service_error());
        }
        std::thread::sleep(Duration::from_millis(60));
        breaker
            .try_acquire()
            .unwrap()
            .failed(&CoreError::validation("bad input"));

        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire().unwrap().is_trial());
    }

    #[test]
    fn test_dropped_trial_reopens() {
        let breaker = CircuitBreaker::new("k", fast_config());
        for _ in 0..3 {
            breaker.record_failure(&service_error());
        }
        std::thread::sleep(Duration::from_millis(60));

        drop(breaker.try_acquire().unwrap());
        let snap = breaker.snapshot();
        assert_eq!(snap.state, CircuitState::Open);
        assert_eq!(snap.half_open_trials, 0);
        assert_eq!(snap.total_trips, 2);

        std::thread::sleep(Duration::from_millis(60));
        breaker.try_acquire().unwrap().succeeded();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_dropped_normal_permit_is_neutral() {
        let breaker = CircuitBreaker::new("k", fast_config());
        breaker.record_failure(&service_error());
        drop(breaker.try_acquire().unwrap());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 1);
    }

    #[test]
    fn test_registry_reuses_breakers() {
        let registry = BreakerRegistry::new(fast_config());
        let a = registry.get_or_create("jira:get-sprint");
        let b = registry.get_or_create("jira:get-sprint");
        assert!(Arc::ptr_eq(&a, &b));
        registry.get_or_create("github:list-commits");
        assert_eq!(registry.len(), 2);

        for _ in 0..3 {
            a.record_failure(&service_error());
        }
        assert_eq!(registry.open_count(), 1);
        assert!(registry.snapshot()["jira:get-sprint"].is_open);

        registry.reset_all();
        assert_eq!(registry.open_count(), 0);
    }
}
