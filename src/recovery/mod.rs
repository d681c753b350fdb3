// src/recovery/mod.rs
// Retry, circuit breaking and graceful degradation for external operations

pub mod backoff;
pub mod circuit_breaker;
pub mod manager;

pub use backoff::RetryPolicy;
pub use circuit_breaker::{
    Admission, BreakerConfig, BreakerRegistry, BreakerSnapshot, CallPermit, CircuitBreaker,
    CircuitState,
};
pub use manager::{
    DegradedResult, ErrorAnalytics, ErrorRecord, ErrorRecoveryManager, Outcome, OutcomeCounts,
    Recovered, RecoveryConfig, RecoveryContext,
};
