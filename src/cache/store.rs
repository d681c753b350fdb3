// src/cache/store.rs
// Store driver contract shared by the fast tier and the secondary tier

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::error::CoreError;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid key pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Store error: {0}")]
    Other(String),
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        CoreError::cache(err.to_string())
    }
}

/// A single cache tier.
///
/// `ttl` is remaining lifetime; `None` means missing or no expiry.
/// `keys` takes a glob (`*`, `?`) pattern.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Short tier name used in logs and metrics ("memory", "redis")
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> StoreResult<Option<Value>>;

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> StoreResult<()>;

    /// Returns true when the key was present
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>>;

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    async fn clear(&self) -> StoreResult<()>;

    async fn len(&self) -> StoreResult<usize>;

    /// Change the expiry of an existing key without touching its value.
    /// Returns false when the key is gone.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        match self.get(key).await? {
            Some(value) => {
                self.set(key, value, ttl).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Release connections. Default is a no-op for in-process tiers.
    async fn close(&self) -> StoreResult<()> {
        Ok(())
    }
}
