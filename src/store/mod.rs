//! Ephemeral key-value store shared by every request and both background
//! jobs.
//!
//! Every operation that competes with concurrent writers (counters, hash
//! increments, the stats claim) is a single atomic store call. Nothing here
//! reads a value and writes it back in a second round trip.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Failure talking to either store. Callers decide whether that means
/// fail-open or fail-closed.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("redis: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("undecodable value: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("key '{0}' holds a value of the wrong type")]
    WrongType(String),
}

#[async_trait]
pub trait EphemeralStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Delete keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError>;

    /// Increment a fixed-window counter. The TTL is attached by the increment
    /// that creates the key, in the same atomic step.
    async fn incr_window(&self, key: &str, window: Duration) -> Result<i64, StoreError>;

    async fn hincr(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, i64>, StoreError>;

    /// Atomically add every field of `source` into `dest`, delete `source`,
    /// and return the resulting contents of `dest`.
    async fn claim_hash(
        &self,
        source: &str,
        dest: &str,
    ) -> Result<HashMap<String, i64>, StoreError>;

    /// One page of a cursor scan. A returned cursor of 0 ends the scan.
    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError>;

    /// Remaining lifetime, or `None` for a missing key or one without expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;
}

pub type SharedStore = Arc<dyn EphemeralStore>;

/// Run a store call under a deadline, folding the elapsed case into
/// [`StoreError::Timeout`].
pub async fn bounded<T, E, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<StoreError>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

/// Wraps another store so every call carries the same deadline.
pub struct TimeoutStore {
    inner: SharedStore,
    limit: Duration,
}

impl TimeoutStore {
    pub fn new(inner: SharedStore, limit: Duration) -> Self {
        Self { inner, limit }
    }
}

#[async_trait]
impl EphemeralStore for TimeoutStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        bounded(self.limit, self.inner.get(key)).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        bounded(self.limit, self.inner.set_ex(key, value, ttl)).await
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError> {
        bounded(self.limit, self.inner.delete(keys)).await
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<i64, StoreError> {
        bounded(self.limit, self.inner.incr_window(key, window)).await
    }

    async fn hincr(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError> {
        bounded(self.limit, self.inner.hincr(key, field, by)).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, i64>, StoreError> {
        bounded(self.limit, self.inner.hgetall(key)).await
    }

    async fn claim_hash(
        &self,
        source: &str,
        dest: &str,
    ) -> Result<HashMap<String, i64>, StoreError> {
        bounded(self.limit, self.inner.claim_hash(source, dest)).await
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError> {
        bounded(self.limit, self.inner.scan(cursor, pattern, count)).await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        bounded(self.limit, self.inner.ttl(key)).await
    }
}

/// Key layout of the ephemeral store. Other services read these keys, so the
/// formats are fixed.
pub mod keys {
    pub const STATS_PATTERN: &str = "stats:*";
    pub const INFLIGHT_PATTERN: &str = "stats-inflight:*";

    pub const CLICKS_FIELD: &str = "clicks";
    pub const ABUSE_FIELD: &str = "abuse";

    pub fn url(code: &str) -> String {
        format!("url:{code}")
    }

    pub fn stats(code: &str) -> String {
        format!("stats:{code}")
    }

    pub fn stats_inflight(code: &str) -> String {
        format!("stats-inflight:{code}")
    }

    pub fn abuse_ip(ip: &str) -> String {
        format!("abuse:{ip}")
    }

    pub fn abuse_link_ip(code: &str, ip: &str) -> String {
        format!("abuse:{code}:{ip}")
    }

    pub fn burst(code: &str, ip: &str) -> String {
        format!("burst:{code}:{ip}")
    }

    pub fn spike(code: &str) -> String {
        format!("spike:{code}")
    }

    pub fn limiter(prefix: &str, ip: &str) -> String {
        format!("{prefix}:{ip}")
    }

    /// Short code behind a `stats:` or `stats-inflight:` key.
    pub fn code_from_stats_key(key: &str) -> Option<&str> {
        key.strip_prefix("stats-inflight:")
            .or_else(|| key.strip_prefix("stats:"))
            .filter(|code| !code.is_empty())
    }
}
