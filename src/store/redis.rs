use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Script};
use std::{collections::HashMap, time::Duration};
use tracing::debug;

use super::{EphemeralStore, StoreError};

/// INCR and EXPIRE in one step, so a crash between the two can never leave a
/// counter without a window.
const INCR_WINDOW: &str = r"
local n = redis.call('INCR', KEYS[1])
if n == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return n
";

/// Read-and-clear of a stats hash. Fields are added into the claim key rather
/// than renamed over it, so deltas left by an earlier failed flush survive.
const CLAIM_HASH: &str = r"
local src = redis.call('HGETALL', KEYS[1])
for i = 1, #src, 2 do
    redis.call('HINCRBY', KEYS[2], src[i], src[i + 1])
end
redis.call('DEL', KEYS[1])
return redis.call('HGETALL', KEYS[2])
";

/// Ephemeral store backed by a Redis server.
///
/// Uses a `ConnectionManager`, which reconnects on its own after the server
/// drops the connection; each call clones the cheap multiplexed handle.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    incr_window: Script,
    claim_hash: Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let mut conn = ConnectionManager::new(client).await?;

        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!("Redis connection established ({})", pong);

        Ok(Self {
            conn,
            incr_window: Script::new(INCR_WINDOW),
            claim_hash: Script::new(CLAIM_HASH),
        })
    }
}

#[async_trait]
impl EphemeralStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        Ok(conn.del(keys).await?)
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let count: i64 = self
            .incr_window
            .key(key)
            .arg(window.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn hincr(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.hincr(key, field, by).await?)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, i64>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(key).await?)
    }

    async fn claim_hash(
        &self,
        source: &str,
        dest: &str,
    ) -> Result<HashMap<String, i64>, StoreError> {
        let mut conn = self.conn.clone();
        let claimed: HashMap<String, i64> = self
            .claim_hash
            .key(source)
            .key(dest)
            .invoke_async(&mut conn)
            .await?;
        Ok(claimed)
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError> {
        let mut conn = self.conn.clone();
        let page: (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        Ok(page)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.conn.clone();
        // -2: missing key, -1: no expiry.
        let secs: i64 = conn.ttl(key).await?;
        Ok((secs >= 0).then(|| Duration::from_secs(secs as u64)))
    }
}
