//! Redis counter store for distributed quota counting.
//!
//! Uses connection pooling for high performance. Each window counter is a
//! plain integer key that expires when its window ends.

use std::time::Duration;

use deadpool_redis::{
    Config, Connection, Pool, Runtime,
    redis::{self, AsyncCommands, cmd},
};

use crate::error::{Result, StorageError};
use crate::storage::{counter_key, CounterStore};

/// Redis counter store configuration.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    pub url: String,
    /// Connection pool size
    pub pool_size: usize,
    /// Key prefix for quota counters
    pub key_prefix: String,
    /// Connection timeout
    pub connection_timeout: Duration,
    /// Extra lifetime of a counter after its window ends
    pub expiry_grace: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
            key_prefix: "quota:".to_string(),
            connection_timeout: Duration::from_secs(5),
            expiry_grace: Duration::from_secs(60),
        }
    }
}

impl RedisConfig {
    /// Create a new Redis configuration.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the key prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the pool size.
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Set how long counters outlive their window.
    pub fn with_expiry_grace(mut self, grace: Duration) -> Self {
        self.expiry_grace = grace;
        self
    }
}

/// Redis counter store for distributed quota counting.
///
/// # Example
///
/// ```ignore
/// use quota_bucket::storage::{RedisCounterStore, RedisConfig};
///
/// let config = RedisConfig::new("redis://localhost:6379")
///     .with_prefix("myapp:quota:")
///     .with_pool_size(20);
///
/// let store = RedisCounterStore::new(config).await?;
/// ```
pub struct RedisCounterStore {
    pool: Pool,
    key_prefix: String,
    expiry_grace_secs: i64,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl RedisCounterStore {
    /// Create a new Redis counter store from configuration.
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let mut cfg = Config::from_url(&config.url);
        cfg.pool = Some(deadpool_redis::PoolConfig::new(config.pool_size));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        // Test connection
        let mut conn = pool
            .get()
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;
        let _: () = cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            pool,
            key_prefix: config.key_prefix,
            expiry_grace_secs: i64::try_from(config.expiry_grace.as_secs()).unwrap_or(i64::MAX),
        })
    }

    /// Create a new Redis counter store from a URL.
    pub async fn from_url(url: impl Into<String>) -> Result<Self> {
        Self::new(RedisConfig::new(url)).await
    }

    /// Get the full key with prefix.
    fn full_key(
        &self,
        tenant_id: &str,
        quota_id: &str,
        window_start: i64,
        window_end: i64,
    ) -> String {
        format!(
            "{}{}",
            self.key_prefix,
            counter_key(tenant_id, quota_id, window_start, window_end)
        )
    }

    /// Get a connection from the pool.
    async fn get_conn(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|_| StorageError::PoolExhausted.into())
    }
}

impl CounterStore for RedisCounterStore {
    async fn get_count(
        &self,
        tenant_id: &str,
        quota_id: &str,
        window_start: i64,
        window_end: i64,
    ) -> Result<i64> {
        let mut conn = self.get_conn().await?;
        let full_key = self.full_key(tenant_id, quota_id, window_start, window_end);

        let result: Option<String> = conn
            .get(&full_key)
            .await
            .map_err(|e| StorageError::operation_failed(e.to_string(), true))?;

        match result {
            Some(raw) => raw.parse::<i64>().map_err(|_| {
                StorageError::InvalidCounter {
                    key: full_key,
                    value: raw,
                }
                .into()
            }),
            None => Ok(0),
        }
    }

    async fn increment_and_get_count(
        &self,
        tenant_id: &str,
        quota_id: &str,
        delta: i64,
        window_start: i64,
        window_end: i64,
    ) -> Result<i64> {
        let mut conn = self.get_conn().await?;
        let full_key = self.full_key(tenant_id, quota_id, window_start, window_end);
        let expire_at = window_end.saturating_add(self.expiry_grace_secs);

        // MULTI/EXEC keeps the increment and its expiry together.
        let (new_count,): (i64,) = redis::pipe()
            .atomic()
            .incr(&full_key, delta)
            .expire_at(&full_key, expire_at)
            .ignore()
            .query_async(&mut *conn)
            .await
            .map_err(|e| StorageError::operation_failed(e.to_string(), true))?;

        Ok(new_count)
    }
}
