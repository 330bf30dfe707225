//! Test helpers shared by the engine's unit tests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jobmill_core::{Job, JobStatus};
use jobmill_store::{MemoryStore, QueueStore, StoreError, StoreResult};

use crate::api::EngineConfig;
use crate::runner::{JobRunner, ProgressReporter};
use crate::tracker::JobTracker;

/// Runner whose behavior is picked by the job payload:
///
/// `ok`, `fail`, `panic`, `progress`, `slow:<ms>`, `fail-once`, `panic-once`.
#[derive(Default)]
pub(crate) struct ScriptedRunner {
    seen: Mutex<HashSet<String>>,
}

impl ScriptedRunner {
    fn first_attempt(&self, job_id: &str) -> bool {
        self.seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(job_id.to_string())
    }
}

#[async_trait]
impl JobRunner for ScriptedRunner {
    async fn run(&self, job: &Job, progress: &ProgressReporter) -> anyhow::Result<serde_json::Value> {
        let script = String::from_utf8_lossy(job.payload.as_bytes()).to_string();
        match script.as_str() {
            "fail" => anyhow::bail!("scripted failure"),
            "panic" => panic!("scripted panic"),
            "progress" => {
                progress.report(50, Some("halfway".to_string()));
            }
            "fail-once" if self.first_attempt(&job.job_id) => anyhow::bail!("scripted failure"),
            "panic-once" if self.first_attempt(&job.job_id) => panic!("scripted panic"),
            other => {
                if let Some(ms) = other.strip_prefix("slow:").and_then(|ms| ms.parse().ok()) {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
            }
        }
        Ok(serde_json::json!({ "job": job.job_id, "script": script }))
    }
}

/// Config with short timers for tests.
pub(crate) fn test_config(queue_type: &str) -> EngineConfig {
    EngineConfig {
        min_workers: 1,
        max_concurrent_jobs: 2,
        batch_size: 4,
        idle_worker_ttl: Duration::from_millis(200),
        crash_backoff: Duration::from_millis(20),
        poll_interval: Duration::from_millis(10),
        lease_timeout: Duration::from_millis(20),
        session_grace: Duration::from_millis(200),
        recovery_lock_ttl: Duration::from_secs(5),
        ..EngineConfig::for_queue(queue_type)
    }
}

enum Injection {
    /// Fail the next `op` call whose key or value contains `needle`.
    Fail { op: &'static str, needle: String },
    /// Write `key = value` straight into the backing store right before the next `op` call,
    /// as a peer instance would.
    WriteFirst {
        op: &'static str,
        key: String,
        value: String,
    },
}

impl Injection {
    fn matches(&self, called: &str, subject: &str) -> bool {
        match self {
            Injection::Fail { op, needle } => *op == called && subject.contains(needle.as_str()),
            Injection::WriteFirst { op, .. } => *op == called,
        }
    }
}

/// [`MemoryStore`] wrapper with one-shot faults and interleavings, keyed by trait method name.
pub(crate) struct FlakyStore {
    inner: Arc<MemoryStore>,
    injections: Mutex<Vec<Injection>>,
}

impl FlakyStore {
    pub(crate) fn new(inner: Arc<MemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            injections: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn fail_once(&self, op: &'static str, needle: impl Into<String>) {
        self.arm(Injection::Fail {
            op,
            needle: needle.into(),
        });
    }

    pub(crate) fn write_before_once(
        &self,
        op: &'static str,
        key: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.arm(Injection::WriteFirst {
            op,
            key: key.into(),
            value: value.into(),
        });
    }

    /// Injections that have not fired yet.
    pub(crate) fn armed(&self) -> usize {
        self.lock().len()
    }

    fn arm(&self, injection: Injection) {
        self.lock().push(injection);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Injection>> {
        self.injections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn intercept(&self, op: &str, subject: &str) -> StoreResult<()> {
        let fired = {
            let mut injections = self.lock();
            injections
                .iter()
                .position(|injection| injection.matches(op, subject))
                .map(|pos| injections.remove(pos))
        };
        match fired {
            None => Ok(()),
            Some(Injection::Fail { .. }) => Err(StoreError::Connection(format!("injected {op} failure"))),
            Some(Injection::WriteFirst { key, value, .. }) => {
                self.inner.set_with_ttl(&key, &value, Duration::ZERO).await
            }
        }
    }
}

#[async_trait]
impl QueueStore for FlakyStore {
    async fn push(&self, list: &str, values: &[String]) -> StoreResult<u64> {
        self.intercept("push", list).await?;
        self.inner.push(list, values).await
    }

    async fn lease(&self, src: &str, dst: &str, timeout: Duration) -> StoreResult<Option<String>> {
        self.intercept("lease", src).await?;
        self.inner.lease(src, dst, timeout).await
    }

    async fn len(&self, list: &str) -> StoreResult<u64> {
        self.intercept("len", list).await?;
        self.inner.len(list).await
    }

    async fn contains(&self, list: &str, value: &str) -> StoreResult<bool> {
        self.intercept("contains", list).await?;
        self.inner.contains(list, value).await
    }

    async fn remove_one(&self, list: &str, value: &str) -> StoreResult<bool> {
        self.intercept("remove_one", list).await?;
        self.inner.remove_one(list, value).await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.intercept("set_with_ttl", value).await?;
        self.inner.set_with_ttl(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.intercept("get", key).await?;
        self.inner.get(key).await
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        self.intercept("delete", &keys.join(" ")).await?;
        self.inner.delete(keys).await
    }

    async fn increment_with_ttl(&self, key: &str, delta: i64, ttl: Duration) -> StoreResult<i64> {
        self.intercept("increment_with_ttl", key).await?;
        self.inner.increment_with_ttl(key, delta, ttl).await
    }

    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.intercept("set_if_absent_with_ttl", key).await?;
        self.inner.set_if_absent_with_ttl(key, value, ttl).await
    }

    async fn compare_and_set_with_ttl(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.intercept("compare_and_set_with_ttl", value).await?;
        self.inner
            .compare_and_set_with_ttl(key, expected, value, ttl)
            .await
    }

    async fn scan_keys(
        &self,
        pattern: &str,
        cursor: u64,
        count: usize,
    ) -> StoreResult<(u64, Vec<String>)> {
        self.intercept("scan_keys", pattern).await?;
        self.inner.scan_keys(pattern, cursor, count).await
    }

    async fn decrement_or_delete(
        &self,
        counter_key: &str,
        linked_keys: &[String],
    ) -> StoreResult<Option<i64>> {
        self.intercept("decrement_or_delete", counter_key).await?;
        self.inner.decrement_or_delete(counter_key, linked_keys).await
    }
}

/// Tracker whose every call fails.
pub(crate) struct FailingTracker;

#[async_trait]
impl JobTracker for FailingTracker {
    async fn track_increment(&self, job: &Job) -> anyhow::Result<()> {
        anyhow::bail!("tracker unavailable for {}", job.job_id)
    }

    async fn track_completion(&self, job: &Job, _status: JobStatus) -> anyhow::Result<()> {
        anyhow::bail!("tracker unavailable for {}", job.job_id)
    }
}
