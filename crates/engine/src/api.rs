//! Public API types for the jobmill engine.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobmill_core::{Job, JobStatus, JobStatusRecord};
use jobmill_store::{QueueStore, StoreError};
use serde::{Deserialize, Serialize};

use crate::client::{JobClient, SubmittedBatch};
use crate::recovery::RecoveryReport;
use crate::runner::JobRunner;
use crate::session::SessionHook;
use crate::tracker::{JobTracker, NoopTracker};

/// What happens when a job fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The first failure is final. The per-job retry counter is still written for auditing.
    SingleAttempt,
    /// `Job::max_retries` is the total attempt budget; earlier failures re-enqueue the job.
    PerJob,
}

/// Configuration for one engine instance (one queue class).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Logical queue class served by this engine.
    pub queue_type: String,

    /// Pool floor: idle scale-down never goes below this many workers.
    pub min_workers: usize,

    /// Pool ceiling, and so the maximum number of jobs running at once.
    pub max_concurrent_jobs: usize,

    /// Maximum number of jobs leased in one dispatch round.
    pub batch_size: usize,

    /// How long a worker may sit idle before it is scaled down.
    pub idle_worker_ttl: Duration,

    /// Abnormal exits tolerated within `crash_window` before respawns are delayed.
    pub max_consecutive_crashes: u32,

    /// Window after which the consecutive crash counter resets.
    pub crash_window: Duration,

    /// Base respawn delay once in crash-loop state (scaled by `min(crashes, 5)`).
    pub crash_backoff: Duration,

    /// How long the dispatch loop sleeps when there is nothing to do.
    pub poll_interval: Duration,

    /// Maximum wait of the first lease attempt in a dispatch round.
    pub lease_timeout: Duration,

    /// TTL of per-job status records and terminal markers.
    pub status_ttl: Duration,

    /// TTL of per-job retry counters.
    pub retry_ttl: Duration,

    /// Age after which a terminal claim whose status write never landed is considered
    /// abandoned, and the job is run again.
    pub finalize_claim_timeout: Duration,

    /// Safety-net TTL of session records and remaining counters.
    pub session_ttl: Duration,

    /// How long a finalized session id stays in the local duplicate guard.
    pub session_grace: Duration,

    /// TTL of the cluster-wide startup recovery lock.
    pub recovery_lock_ttl: Duration,

    /// Number of status keys fetched per scan batch during recovery.
    pub recovery_scan_batch: usize,

    /// Whether `start_engine` runs startup recovery before dispatching.
    pub recover_on_start: bool,

    /// Failure handling.
    pub retry_policy: RetryPolicy,

    /// Display labels for this queue class (used by `mapped_status`).
    pub status_labels: BTreeMap<JobStatus, String>,
}

impl EngineConfig {
    /// Default queue class name.
    pub const DEFAULT_QUEUE_TYPE: &'static str = "default";
    /// Default pool floor.
    pub const DEFAULT_MIN_WORKERS: usize = 1;
    /// Default pool ceiling.
    pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 4;
    /// Default lease batch size.
    pub const DEFAULT_BATCH_SIZE: usize = 10;
    /// Default idle scale-down delay.
    pub const DEFAULT_IDLE_WORKER_TTL: Duration = Duration::from_secs(60);
    /// Default crash-loop threshold.
    pub const DEFAULT_MAX_CONSECUTIVE_CRASHES: u32 = 3;
    /// Default crash counter window.
    pub const DEFAULT_CRASH_WINDOW: Duration = Duration::from_secs(60);
    /// Default crash-loop respawn delay unit.
    pub const DEFAULT_CRASH_BACKOFF: Duration = Duration::from_secs(5);
    /// Default idle poll interval.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
    /// Default blocking lease wait.
    pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_millis(200);
    /// Default status record TTL.
    pub const DEFAULT_STATUS_TTL: Duration = Duration::from_secs(24 * 60 * 60);
    /// Default retry counter TTL.
    pub const DEFAULT_RETRY_TTL: Duration = Duration::from_secs(24 * 60 * 60);
    /// Default abandoned-claim age.
    pub const DEFAULT_FINALIZE_CLAIM_TIMEOUT: Duration = Duration::from_secs(30);
    /// Default session TTL.
    pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);
    /// Default session duplicate-guard window.
    pub const DEFAULT_SESSION_GRACE: Duration = Duration::from_secs(10);
    /// Default recovery lock TTL.
    pub const DEFAULT_RECOVERY_LOCK_TTL: Duration = Duration::from_secs(60);
    /// Default recovery scan batch.
    pub const DEFAULT_RECOVERY_SCAN_BATCH: usize = 100;

    /// Default configuration for `queue_type`.
    pub fn for_queue(queue_type: impl Into<String>) -> Self {
        Self {
            queue_type: queue_type.into(),
            ..Self::default()
        }
    }

    /// Replace zero values with defaults and clamp the pool bounds.
    pub fn normalized(mut self) -> Self {
        if self.queue_type.trim().is_empty() {
            self.queue_type = Self::DEFAULT_QUEUE_TYPE.to_string();
        }
        if self.max_concurrent_jobs == 0 {
            self.max_concurrent_jobs = Self::DEFAULT_MAX_CONCURRENT_JOBS;
        }
        self.min_workers = self.min_workers.min(self.max_concurrent_jobs);
        if self.batch_size == 0 {
            self.batch_size = Self::DEFAULT_BATCH_SIZE;
        }
        if self.idle_worker_ttl == Duration::ZERO {
            self.idle_worker_ttl = Self::DEFAULT_IDLE_WORKER_TTL;
        }
        if self.max_consecutive_crashes == 0 {
            self.max_consecutive_crashes = Self::DEFAULT_MAX_CONSECUTIVE_CRASHES;
        }
        if self.crash_window == Duration::ZERO {
            self.crash_window = Self::DEFAULT_CRASH_WINDOW;
        }
        if self.poll_interval == Duration::ZERO {
            self.poll_interval = Self::DEFAULT_POLL_INTERVAL;
        }
        if self.status_ttl == Duration::ZERO {
            self.status_ttl = Self::DEFAULT_STATUS_TTL;
        }
        if self.retry_ttl == Duration::ZERO {
            self.retry_ttl = Self::DEFAULT_RETRY_TTL;
        }
        if self.finalize_claim_timeout == Duration::ZERO {
            self.finalize_claim_timeout = Self::DEFAULT_FINALIZE_CLAIM_TIMEOUT;
        }
        if self.session_ttl == Duration::ZERO {
            self.session_ttl = Self::DEFAULT_SESSION_TTL;
        }
        if self.recovery_lock_ttl == Duration::ZERO {
            self.recovery_lock_ttl = Self::DEFAULT_RECOVERY_LOCK_TTL;
        }
        if self.recovery_scan_batch == 0 {
            self.recovery_scan_batch = Self::DEFAULT_RECOVERY_SCAN_BATCH;
        }
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_type: Self::DEFAULT_QUEUE_TYPE.to_string(),
            min_workers: Self::DEFAULT_MIN_WORKERS,
            max_concurrent_jobs: Self::DEFAULT_MAX_CONCURRENT_JOBS,
            batch_size: Self::DEFAULT_BATCH_SIZE,
            idle_worker_ttl: Self::DEFAULT_IDLE_WORKER_TTL,
            max_consecutive_crashes: Self::DEFAULT_MAX_CONSECUTIVE_CRASHES,
            crash_window: Self::DEFAULT_CRASH_WINDOW,
            crash_backoff: Self::DEFAULT_CRASH_BACKOFF,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            lease_timeout: Self::DEFAULT_LEASE_TIMEOUT,
            status_ttl: Self::DEFAULT_STATUS_TTL,
            retry_ttl: Self::DEFAULT_RETRY_TTL,
            finalize_claim_timeout: Self::DEFAULT_FINALIZE_CLAIM_TIMEOUT,
            session_ttl: Self::DEFAULT_SESSION_TTL,
            session_grace: Self::DEFAULT_SESSION_GRACE,
            recovery_lock_ttl: Self::DEFAULT_RECOVERY_LOCK_TTL,
            recovery_scan_batch: Self::DEFAULT_RECOVERY_SCAN_BATCH,
            recover_on_start: true,
            retry_policy: RetryPolicy::PerJob,
            status_labels: BTreeMap::new(),
        }
    }
}

/// Collaborators an engine instance runs with.
pub struct EngineDeps {
    /// Shared durable store.
    pub store: Arc<dyn QueueStore>,
    /// Business logic executed inside each worker.
    pub runner: Arc<dyn JobRunner>,
    /// Per-tenant job accounting hook.
    pub tracker: Arc<dyn JobTracker>,
    /// Side effects to run once a session drains.
    pub session_hook: Option<Arc<dyn SessionHook>>,
}

impl EngineDeps {
    /// Store and runner, with no accounting and no session hook.
    pub fn new(store: Arc<dyn QueueStore>, runner: Arc<dyn JobRunner>) -> Self {
        Self {
            store,
            runner,
            tracker: Arc::new(NoopTracker),
            session_hook: None,
        }
    }

    /// Use `tracker` for job accounting.
    pub fn with_tracker(mut self, tracker: Arc<dyn JobTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    /// Run `hook` whenever a session drains.
    pub fn with_session_hook(mut self, hook: Arc<dyn SessionHook>) -> Self {
        self.session_hook = Some(hook);
        self
    }
}

/// Engine error.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// `add_jobs` was called with no jobs.
    #[error("job batch is empty")]
    EmptyBatch,
    /// A submitted job is missing required fields or targets another queue class.
    #[error("invalid job: {0}")]
    InvalidJob(String),
    /// The durable store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A job or record could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Snapshot of a single worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerSnapshot {
    /// Worker id (unique within the engine instance).
    pub worker_id: u64,
    /// Whether the worker is waiting for a job.
    pub idle: bool,
    /// Job currently executing, if any.
    pub current_job_id: Option<String>,
    /// Jobs processed by this worker over its lifetime.
    pub job_count: u64,
}

/// Current engine state snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusSnapshot {
    /// Whether the engine has been asked to stop.
    pub stop_requested: bool,
    /// Number of live workers.
    pub pool_size: usize,
    /// Number of idle workers.
    pub idle_workers: usize,
    /// Pending list length at the last dispatch round.
    pub backlog: u64,
    /// Whether respawns are currently delayed by crash-loop backoff.
    pub crash_loop: bool,
    /// Current consecutive abnormal exit count.
    pub consecutive_crashes: u32,
    /// Per-worker snapshots.
    pub workers: Vec<WorkerSnapshot>,
}

/// Engine event stream payload.
///
/// Delivery is at-least-once from the consumer's point of view (a restart may replay a job),
/// so consumers must treat repeated terminal events for a job as no-ops.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// Engine started dispatching.
    Started,
    /// Graceful shutdown requested.
    StopRequested,
    /// Startup recovery ran on this instance.
    RecoveryFinished {
        /// Recovery counters.
        report: RecoveryReport,
    },
    /// Startup recovery was skipped because another instance holds the lock.
    RecoverySkipped,
    /// Job persisted in the pending list.
    JobQueued {
        /// Job id.
        job_id: String,
        /// Session the job belongs to.
        session_id: String,
    },
    /// Job handed to a worker.
    JobStarted {
        /// Worker id.
        worker_id: u64,
        /// Job id.
        job_id: String,
    },
    /// Job progress report.
    JobProgress {
        /// Job id.
        job_id: String,
        /// Percent complete (0..=100).
        percent: u8,
        /// Human-readable progress text.
        message: Option<String>,
    },
    /// Job finished successfully.
    JobCompleted {
        /// Job id.
        job_id: String,
        /// Worker result.
        result: serde_json::Value,
    },
    /// Job failed permanently.
    JobFailed {
        /// Job id.
        job_id: String,
        /// Failure reason.
        error: String,
    },
    /// Job failed and was re-enqueued for another attempt.
    JobRetrying {
        /// Job id.
        job_id: String,
        /// Attempts used so far.
        attempt: u32,
        /// Attempt budget.
        max_attempts: u32,
        /// Failure reason of the last attempt.
        error: String,
    },
    /// Job was running when the engine was stopped immediately; the next startup recovery
    /// re-enqueues it.
    JobInterrupted {
        /// Job id.
        job_id: String,
    },
    /// Status record written.
    StatusChanged {
        /// Job id.
        job_id: String,
        /// New status.
        status: JobStatus,
    },
    /// Every job of a session reached a terminal outcome.
    SessionCompleted {
        /// Session id.
        session_id: String,
        /// Jobs submitted in the session.
        total_jobs: u64,
        /// Submission time.
        started_at: DateTime<Utc>,
        /// Time the last job finished.
        completed_at: DateTime<Utc>,
    },
    /// Worker added to the pool.
    WorkerSpawned {
        /// Worker id.
        worker_id: u64,
        /// Pool size after the change.
        pool_size: usize,
    },
    /// Worker removed from the pool.
    WorkerRemoved {
        /// Worker id.
        worker_id: u64,
        /// Pool size after the change.
        pool_size: usize,
        /// Why it was removed.
        reason: String,
    },
    /// Respawns are delayed because workers keep crashing.
    CrashLoop {
        /// Consecutive abnormal exits.
        consecutive_crashes: u32,
        /// Delay before the next respawn.
        backoff_ms: u64,
    },
    /// A warning from the engine.
    Warning {
        /// Warning message.
        message: String,
    },
    /// A non-fatal error from the engine.
    Error {
        /// Error message.
        message: String,
    },
    /// Engine stopped.
    Stopped,
}

/// Handle to a running engine instance.
pub struct EngineHandle {
    pub(crate) inner: Arc<crate::engine::EngineInner>,
    pub(crate) client: JobClient,
    pub(crate) join: tokio::task::JoinHandle<anyhow::Result<()>>,
}

/// Start an engine: startup recovery (when enabled) followed by the dispatch loop.
///
/// Must be called from within a tokio runtime.
pub fn start_engine(config: EngineConfig, deps: EngineDeps) -> EngineHandle {
    crate::engine::start_engine(config, deps)
}

impl EngineHandle {
    /// Subscribe to the engine event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Get the latest engine snapshot.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.snapshot_rx.borrow().clone()
    }

    /// Submission/query client sharing this engine's store and event stream.
    pub fn client(&self) -> &JobClient {
        &self.client
    }

    /// Submit a batch as one session and wake the dispatch loop.
    pub async fn add_jobs(&self, jobs: Vec<Job>) -> Result<SubmittedBatch, EngineError> {
        let batch = self.client.add_jobs(jobs).await?;
        self.inner.wake();
        Ok(batch)
    }

    /// Latest status record of `job_id`.
    pub async fn get_job_status(&self, job_id: &str) -> Result<Option<JobStatusRecord>, EngineError> {
        self.client.get_job_status(job_id).await
    }

    /// Number of idle workers at the last snapshot.
    pub fn available_worker_count(&self) -> usize {
        self.inner.snapshot_rx.borrow().idle_workers
    }

    /// Display label for a raw status string of this queue class.
    pub fn mapped_status(&self, raw_status: &str) -> String {
        self.client.mapped_status(raw_status)
    }

    /// Request a graceful shutdown (finish in-flight work, stop leasing new jobs).
    pub fn request_stop(&self) {
        self.inner.request_stop();
    }

    /// Stop immediately: every worker is terminated and in-flight jobs are left for the next
    /// startup recovery.
    pub fn stop(&self) {
        self.inner.request_abort();
    }

    /// Wait for the engine to stop, returning the engine task result.
    pub async fn wait(self) -> anyhow::Result<()> {
        match self.join.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("engine task join error: {err}")),
        }
    }
}
