//! In-process store for tests and single-node runs.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::{QueueStore, StoreError, StoreResult, glob_match};

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Default)]
struct State {
    /// Front is the left end.
    lists: HashMap<String, VecDeque<String>>,
    values: HashMap<String, Entry>,
}

impl State {
    fn live_value(&mut self, key: &str, now: Instant) -> Option<&mut Entry> {
        let expired = self.values.get(key).is_some_and(|e| !e.is_live(now));
        if expired {
            tracing::trace!(key, "memory store: expired key purged");
            self.values.remove(key);
            return None;
        }
        self.values.get_mut(key)
    }

    fn move_one(&mut self, src: &str, dst: &str) -> Option<String> {
        let value = self.lists.get_mut(src)?.pop_back()?;
        if self.lists.get(src).is_some_and(VecDeque::is_empty) {
            self.lists.remove(src);
        }
        self.lists
            .entry(dst.to_string())
            .or_default()
            .push_front(value.clone());
        Some(value)
    }
}

/// Every primitive runs under a single mutex, which makes each one atomic with respect to
/// every other caller sharing the same `MemoryStore`.
///
/// A zero TTL means "no expiry".
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    pushed: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of a list, left to right.
    pub fn list_items(&self, list: &str) -> Vec<String> {
        self.lock()
            .lists
            .get(list)
            .map(|items| items.iter().cloned().collect())
            .unwrap_or_default()
    }
}

fn expiry(ttl: Duration, now: Instant) -> Option<Instant> {
    (!ttl.is_zero()).then(|| now + ttl)
}

fn parse_counter(key: &str, raw: &str) -> StoreResult<i64> {
    raw.parse::<i64>()
        .map_err(|_| StoreError::Serialization(format!("value at {key} is not an integer")))
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn push(&self, list: &str, values: &[String]) -> StoreResult<u64> {
        let len = {
            let mut state = self.lock();
            let items = state.lists.entry(list.to_string()).or_default();
            for value in values {
                items.push_front(value.clone());
            }
            items.len() as u64
        };
        if !values.is_empty() {
            self.pushed.notify_waiters();
        }
        Ok(len)
    }

    async fn lease(&self, src: &str, dst: &str, timeout: Duration) -> StoreResult<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.lock().move_one(src, dst) {
                return Ok(Some(value));
            }
            if timeout.is_zero() {
                return Ok(None);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.lock().move_one(src, dst));
            }
        }
    }

    async fn len(&self, list: &str) -> StoreResult<u64> {
        Ok(self.lock().lists.get(list).map_or(0, |items| items.len() as u64))
    }

    async fn contains(&self, list: &str, value: &str) -> StoreResult<bool> {
        Ok(self
            .lock()
            .lists
            .get(list)
            .is_some_and(|items| items.iter().any(|item| item == value)))
    }

    async fn remove_one(&self, list: &str, value: &str) -> StoreResult<bool> {
        let mut state = self.lock();
        let Some(items) = state.lists.get_mut(list) else {
            return Ok(false);
        };
        let Some(pos) = items.iter().position(|item| item == value) else {
            return Ok(false);
        };
        items.remove(pos);
        if items.is_empty() {
            state.lists.remove(list);
        }
        Ok(true)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let now = Instant::now();
        self.lock().values.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: expiry(ttl, now),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = Instant::now();
        Ok(self.lock().live_value(key, now).map(|e| e.value.clone()))
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        let now = Instant::now();
        let mut state = self.lock();
        let mut removed = 0;
        for key in keys {
            if state.live_value(key, now).is_some() {
                state.values.remove(key);
                removed += 1;
            } else if state.lists.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn increment_with_ttl(&self, key: &str, delta: i64, ttl: Duration) -> StoreResult<i64> {
        let now = Instant::now();
        let mut state = self.lock();
        let current = match state.live_value(key, now) {
            Some(entry) => parse_counter(key, &entry.value)?,
            None => 0,
        };
        let next = current + delta;
        state.values.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at: expiry(ttl, now),
            },
        );
        Ok(next)
    }

    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let now = Instant::now();
        let mut state = self.lock();
        if state.live_value(key, now).is_some() {
            return Ok(false);
        }
        state.values.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: expiry(ttl, now),
            },
        );
        Ok(true)
    }

    async fn compare_and_set_with_ttl(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let now = Instant::now();
        let mut state = self.lock();
        let current = state.live_value(key, now).map(|entry| entry.value.as_str());
        if current != expected {
            return Ok(false);
        }
        state.values.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: expiry(ttl, now),
            },
        );
        Ok(true)
    }

    async fn scan_keys(
        &self,
        pattern: &str,
        cursor: u64,
        count: usize,
    ) -> StoreResult<(u64, Vec<String>)> {
        let now = Instant::now();
        let state = self.lock();
        let mut keys: Vec<&String> = state
            .values
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, _)| key)
            .chain(state.lists.keys())
            .filter(|key| glob_match(pattern, key))
            .collect();
        keys.sort();

        let start = (cursor as usize).min(keys.len());
        let end = start.saturating_add(count.max(1)).min(keys.len());
        let batch = keys[start..end].iter().map(|k| (*k).clone()).collect();
        let next = if end >= keys.len() { 0 } else { end as u64 };
        Ok((next, batch))
    }

    async fn decrement_or_delete(
        &self,
        counter_key: &str,
        linked_keys: &[String],
    ) -> StoreResult<Option<i64>> {
        let now = Instant::now();
        let mut state = self.lock();
        let Some(entry) = state.live_value(counter_key, now) else {
            return Ok(None);
        };
        let remaining = parse_counter(counter_key, &entry.value)? - 1;
        if remaining <= 0 {
            state.values.remove(counter_key);
            for key in linked_keys {
                state.values.remove(key);
            }
        } else {
            entry.value = remaining.to_string();
        }
        Ok(Some(remaining))
    }
}
