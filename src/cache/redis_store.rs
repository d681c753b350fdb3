// src/cache/redis_store.rs
// Secondary tier: Redis, values stored as JSON strings

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use std::time::Duration;
use tracing::{error, info};

use super::store::{CacheStore, StoreError, StoreResult};

/// Redis-backed secondary cache tier
#[derive(Clone)]
pub struct RedisStore {
    client: Option<ConnectionManager>,
    enabled: bool,
}

impl RedisStore {
    /// Open a managed connection to `redis_url`
    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url).map_err(|e| {
            error!("Failed to open Redis client: {}", e);
            StoreError::Redis(e)
        })?;
        let manager = ConnectionManager::new(client).await.map_err(|e| {
            error!("Failed to create Redis connection manager: {}", e);
            StoreError::Redis(e)
        })?;
        info!(url = %redact(redis_url), "Redis secondary cache connected");
        Ok(Self {
            client: Some(manager),
            enabled: true,
        })
    }

    /// Store that answers every call as empty
    pub fn disabled() -> Self {
        Self {
            client: None,
            enabled: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled && self.client.is_some()
    }

    fn conn(&self) -> Option<ConnectionManager> {
        if !self.enabled {
            return None;
        }
        self.client.clone()
    }

    pub async fn ping(&self) -> StoreResult<String> {
        match self.conn() {
            Some(mut conn) => Ok(redis::cmd("PING").query_async::<String>(&mut conn).await?),
            None => Ok("Redis disabled".to_string()),
        }
    }
}

const SCAN_BATCH: usize = 500;

/// Whole seconds for SET EX / EXPIRE; Redis rejects 0
fn ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}

/// Drop credentials from a redis:// URL before logging it
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}***{}", &url[..scheme_end + 3], &url[at..])
        }
        _ => url.to_string(),
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        let Some(mut conn) = self.conn() else {
            return Ok(None);
        };
        let raw: Option<String> = conn.get(key).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> StoreResult<()> {
        let Some(mut conn) = self.conn() else {
            return Ok(());
        };
        let json = serde_json::to_string(&value)?;
        conn.set_ex::<_, _, ()>(key, json, ttl_secs(ttl)).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let Some(mut conn) = self.conn() else {
            return Ok(false);
        };
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let Some(mut conn) = self.conn() else {
            return Ok(Vec::new());
        };
        // SCAN instead of KEYS so a large keyspace never blocks the server
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let Some(mut conn) = self.conn() else {
            return Ok(None);
        };
        // -2: missing, -1: no expiry
        let secs: i64 = conn.ttl(key).await?;
        if secs < 0 {
            Ok(None)
        } else {
            Ok(Some(Duration::from_secs(secs as u64)))
        }
    }

    async fn clear(&self) -> StoreResult<()> {
        let Some(mut conn) = self.conn() else {
            return Ok(());
        };
        redis::cmd("FLUSHDB").query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn len(&self) -> StoreResult<usize> {
        let Some(mut conn) = self.conn() else {
            return Ok(0);
        };
        let count: usize = redis::cmd("DBSIZE").query_async::<usize>(&mut conn).await?;
        Ok(count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let Some(mut conn) = self.conn() else {
            return Ok(false);
        };
        let applied: bool = conn.expire(key, ttl_secs(ttl) as i64).await?;
        Ok(applied)
    }
}
