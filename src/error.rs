// src/error.rs
// Error taxonomy shared by the cache and recovery layers

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Free-form, variant-specific context attached to an error
pub type ErrorDetails = BTreeMap<String, serde_json::Value>;

/// Result type for operations wrapped by the recovery layer
pub type CoreResult<T> = Result<T, CoreError>;

/// Closed set of failure classes understood by the core
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Caller supplied bad input. Never retried, never trips a breaker.
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        details: ErrorDetails,
    },

    /// Timeouts, 5xx responses, connection resets, "service unavailable"
    #[error("Service error from {service}: {message}")]
    Service {
        service: String,
        message: String,
        status: Option<u16>,
        details: ErrorDetails,
    },

    #[error("Rate limited by {service}: {message}")]
    RateLimit {
        service: String,
        message: String,
        retry_after: Option<Duration>,
        details: ErrorDetails,
    },

    /// Synthetic: the breaker for `operation` rejected the call
    #[error("Circuit open for {operation} (retry in {}ms)", retry_in.as_millis())]
    CircuitOpen {
        operation: String,
        retry_in: Duration,
    },

    #[error("Cache error: {message}")]
    Cache {
        message: String,
        details: ErrorDetails,
    },
}

/// Classification tag used in analytics and breaker decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Service,
    RateLimit,
    CircuitOpen,
    Cache,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Service => "service",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Cache => "cache",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        CoreError::Validation {
            message: message.into(),
            details: ErrorDetails::new(),
        }
    }

    pub fn service(service: impl Into<String>, message: impl Into<String>) -> Self {
        CoreError::Service {
            service: service.into(),
            message: message.into(),
            status: None,
            details: ErrorDetails::new(),
        }
    }

    pub fn rate_limited(
        service: impl Into<String>,
        message: impl Into<String>,
        retry_after: Option<Duration>,
    ) -> Self {
        CoreError::RateLimit {
            service: service.into(),
            message: message.into(),
            retry_after,
            details: ErrorDetails::new(),
        }
    }

    pub fn cache(message: impl Into<String>) -> Self {
        CoreError::Cache {
            message: message.into(),
            details: ErrorDetails::new(),
        }
    }

    /// Map an HTTP status from the issue tracker or code host onto the taxonomy.
    ///
    /// 429 becomes a rate limit, 408 and 5xx are service errors, every other
    /// 4xx is treated as a caller error.
    pub fn from_status(
        service: impl Into<String>,
        status: u16,
        message: impl Into<String>,
        retry_after: Option<Duration>,
    ) -> Self {
        let service = service.into();
        let message = message.into();
        let mut details = ErrorDetails::new();
        details.insert("status".to_string(), serde_json::json!(status));

        match status {
            429 => CoreError::RateLimit {
                service,
                message,
                retry_after,
                details,
            },
            408 | 500..=599 => CoreError::Service {
                service,
                message,
                status: Some(status),
                details,
            },
            _ => {
                details.insert("service".to_string(), serde_json::json!(service));
                CoreError::Validation { message, details }
            }
        }
    }

    /// Best-effort classification of an untyped error message.
    ///
    /// Unknown messages are assumed transient so they get the retry treatment.
    pub fn classify_message(service: impl Into<String>, message: impl Into<String>) -> Self {
        let service = service.into();
        let message = message.into();
        let lower = message.to_lowercase();

        if lower.contains("rate limit") || lower.contains("too many requests") || lower.contains("429") {
            return CoreError::rate_limited(service, message, None);
        }

        let caller_fault = [
            "invalid",
            "validation",
            "required",
            "malformed",
            "not found",
            "unauthorized",
            "forbidden",
            "400",
            "401",
            "403",
            "404",
            "422",
        ];
        if caller_fault.iter().any(|needle| lower.contains(needle)) {
            let mut err = CoreError::validation(message);
            err = err.with_detail("service", serde_json::json!(service));
            return err;
        }

        CoreError::service(service, message)
    }

    /// Attach one entry to the details map. No-op for `CircuitOpen`.
    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        if let Some(details) = self.details_mut() {
            details.insert(key.into(), value);
        }
        self
    }

    fn details_mut(&mut self) -> Option<&mut ErrorDetails> {
        match self {
            CoreError::Validation { details, .. }
            | CoreError::Service { details, .. }
            | CoreError::RateLimit { details, .. }
            | CoreError::Cache { details, .. } => Some(details),
            CoreError::CircuitOpen { .. } => None,
        }
    }

    pub fn details(&self) -> Option<&ErrorDetails> {
        match self {
            CoreError::Validation { details, .. }
            | CoreError::Service { details, .. }
            | CoreError::RateLimit { details, .. }
            | CoreError::Cache { details, .. } => Some(details),
            CoreError::CircuitOpen { .. } => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Validation { .. } => ErrorKind::Validation,
            CoreError::Service { .. } => ErrorKind::Service,
            CoreError::RateLimit { .. } => ErrorKind::RateLimit,
            CoreError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            CoreError::Cache { .. } => ErrorKind::Cache,
        }
    }

    /// Whether another attempt could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Service { .. } | CoreError::RateLimit { .. })
    }

    /// Whether this failure says something about the dependency's health
    pub fn counts_against_breaker(&self) -> bool {
        matches!(self, CoreError::Service { .. } | CoreError::RateLimit { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CoreError::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Final failure of a recovered operation, annotated with retry metadata
#[derive(Debug, Clone, Error)]
#[error("{operation} failed after {attempts} attempt(s): {source}")]
pub struct RecoveryError {
    pub operation: String,
    pub attempts: u32,
    #[source]
    pub source: CoreError,
}

impl RecoveryError {
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }

    pub fn into_inner(self) -> CoreError {
        self.source
    }
}
