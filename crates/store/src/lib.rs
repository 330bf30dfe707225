//! Durable queue store contract for jobmill.
//!
//! Every engine instance in a cluster talks to the same store; correctness of leasing and
//! session accounting rests on the atomicity of the primitives below, never on in-process locks.

use std::time::Duration;

use async_trait::async_trait;

mod memory;
#[cfg(feature = "redis")]
mod redis_store;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

/// Store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),
    #[error("store command error: {0}")]
    Command(String),
    #[error("store value error: {0}")]
    Serialization(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Primitives the engine needs from its shared store.
///
/// Lists are pushed on the left and leased from the right, so the oldest pending item is
/// leased first.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Push values onto the left of `list`; returns the new length.
    async fn push(&self, list: &str, values: &[String]) -> StoreResult<u64>;

    /// Atomically pop the right end of `src` and push it onto the left of `dst`.
    ///
    /// A zero `timeout` never waits; otherwise waits at most `timeout` for an item.
    async fn lease(&self, src: &str, dst: &str, timeout: Duration) -> StoreResult<Option<String>>;

    async fn len(&self, list: &str) -> StoreResult<u64>;

    async fn contains(&self, list: &str, value: &str) -> StoreResult<bool>;

    /// Remove one occurrence of `value`; returns whether anything was removed.
    async fn remove_one(&self, list: &str, value: &str) -> StoreResult<bool>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn delete(&self, keys: &[String]) -> StoreResult<u64>;

    /// Add `delta` to the counter at `key` and (re)arm its TTL in the same step.
    async fn increment_with_ttl(&self, key: &str, delta: i64, ttl: Duration) -> StoreResult<i64>;

    /// Set `key` only if it does not exist. Returns `true` when this call created it.
    async fn set_if_absent_with_ttl(&self, key: &str, value: &str, ttl: Duration)
    -> StoreResult<bool>;

    /// Write `value` only if `key` currently holds `expected` (`None`: the key is absent).
    /// Returns whether the write happened. Runs as one atomic step.
    async fn compare_and_set_with_ttl(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool>;

    /// One batch of a glob (`*`) key scan. Start with cursor `0`; a returned cursor of `0`
    /// ends the scan.
    async fn scan_keys(
        &self,
        pattern: &str,
        cursor: u64,
        count: usize,
    ) -> StoreResult<(u64, Vec<String>)>;

    /// Decrement `counter_key`; when the result is `<= 0`, delete it together with
    /// `linked_keys`. Runs as one atomic step.
    ///
    /// Returns `None` when the counter does not exist (already drained or expired).
    async fn decrement_or_delete(
        &self,
        counter_key: &str,
        linked_keys: &[String],
    ) -> StoreResult<Option<i64>>;
}

/// Glob match supporting `*` only, as used by key scans.
pub(crate) fn glob_match(pattern: &str, candidate: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return candidate.is_empty();
    };
    let Some(mut rest) = candidate.strip_prefix(first) else {
        return false;
    };

    let remaining: Vec<&str> = parts.collect();
    let Some((last, middle)) = remaining.split_last() else {
        // No `*` in the pattern: exact match.
        return rest.is_empty();
    };

    for part in middle {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}
