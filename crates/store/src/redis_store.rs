//! Redis-backed store (shared by every engine instance of a cluster).

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::{QueueStore, StoreError, StoreResult};

const DECREMENT_OR_DELETE: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return false
end
local remaining = redis.call('DECR', KEYS[1])
if remaining <= 0 then
  redis.call('DEL', unpack(KEYS))
end
return remaining
";

// ARGV: value, ttl in ms, and the expected value (omitted when the key must be absent).
const COMPARE_AND_SET: &str = r"
local current = redis.call('GET', KEYS[1])
if #ARGV >= 3 then
  if current ~= ARGV[3] then
    return 0
  end
elseif current then
  return 0
end
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
return 1
";

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

fn ttl_ms(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Store backed by a Redis server.
///
/// Blocking leases run on their own connection so a waiting `BRPOPLPUSH` never stalls the
/// multiplexed connection used by every other command.
pub struct RedisStore {
    conn: ConnectionManager,
    blocking: Mutex<ConnectionManager>,
    decrement_script: redis::Script,
    compare_and_set_script: redis::Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to `redis_url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(redis_url: impl AsRef<str>) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone()).await?;
        let blocking = ConnectionManager::new(client).await?;
        debug!(url = redis_url.as_ref(), "connected to redis");
        Ok(Self {
            conn,
            blocking: Mutex::new(blocking),
            decrement_script: redis::Script::new(DECREMENT_OR_DELETE),
            compare_and_set_script: redis::Script::new(COMPARE_AND_SET),
        })
    }
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn push(&self, list: &str, values: &[String]) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        if values.is_empty() {
            let len: u64 = redis::cmd("LLEN").arg(list).query_async(&mut conn).await?;
            return Ok(len);
        }
        let len: u64 = redis::cmd("LPUSH")
            .arg(list)
            .arg(values)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    #[instrument(skip(self), level = "trace", err)]
    async fn lease(&self, src: &str, dst: &str, timeout: Duration) -> StoreResult<Option<String>> {
        if timeout < Duration::from_millis(1) {
            let mut conn = self.conn.clone();
            let item: Option<String> = redis::cmd("RPOPLPUSH")
                .arg(src)
                .arg(dst)
                .query_async(&mut conn)
                .await?;
            return Ok(item);
        }

        let mut conn = self.blocking.lock().await;
        let item: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(src)
            .arg(dst)
            .arg(timeout.as_secs_f64())
            .query_async(&mut *conn)
            .await?;
        Ok(item)
    }

    async fn len(&self, list: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = redis::cmd("LLEN").arg(list).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn contains(&self, list: &str, value: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let pos: Option<i64> = redis::cmd("LPOS")
            .arg(list)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(pos.is_some())
    }

    async fn remove_one(&self, list: &str, value: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("LREM")
            .arg(list)
            .arg(1)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_ms(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let removed: u64 = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
        Ok(removed)
    }

    async fn increment_with_ttl(&self, key: &str, delta: i64, ttl: Duration) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        let (value,): (i64,) = redis::pipe()
            .atomic()
            .cmd("INCRBY")
            .arg(key)
            .arg(delta)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_ms(ttl))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn compare_and_set_with_ttl(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let mut invocation = self.compare_and_set_script.key(key);
        invocation.arg(value).arg(ttl_ms(ttl));
        if let Some(expected) = expected {
            invocation.arg(expected);
        }
        let written: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(written == 1)
    }

    async fn scan_keys(
        &self,
        pattern: &str,
        cursor: u64,
        count: usize,
    ) -> StoreResult<(u64, Vec<String>)> {
        let mut conn = self.conn.clone();
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count.max(1))
            .query_async(&mut conn)
            .await?;
        Ok((next, keys))
    }

    async fn decrement_or_delete(
        &self,
        counter_key: &str,
        linked_keys: &[String],
    ) -> StoreResult<Option<i64>> {
        let mut conn = self.conn.clone();
        let mut invocation = self.decrement_script.key(counter_key);
        for key in linked_keys {
            invocation.key(key);
        }
        let remaining: Option<i64> = invocation.invoke_async(&mut conn).await?;
        Ok(remaining)
    }
}
