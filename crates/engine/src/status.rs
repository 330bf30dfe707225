use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobmill_core::{Job, JobStatus, JobStatusRecord, QueueKeys};
use jobmill_store::{QueueStore, StoreError};
use tokio::sync::broadcast;

use crate::api::{EngineConfig, EngineError, EngineEvent, RetryPolicy};
use crate::tracker::JobTracker;

/// Fields to overwrite on top of the existing record. `None` keeps the previous value.
#[derive(Debug, Default, Clone)]
pub(crate) struct StatusUpdate {
    pub(crate) progress: Option<u8>,
    pub(crate) message: Option<String>,
    pub(crate) error: Option<String>,
    pub(crate) result: Option<serde_json::Value>,
    pub(crate) worker_id: Option<u64>,
    pub(crate) raw_job: Option<String>,
    pub(crate) start_time: Option<DateTime<Utc>>,
    pub(crate) completed_at: Option<DateTime<Utc>>,
    pub(crate) requeued_at: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    fn apply(self, record: &mut JobStatusRecord) {
        if let Some(progress) = self.progress {
            record.progress = progress.min(100);
        }
        if self.message.is_some() {
            record.message = self.message;
        }
        if self.error.is_some() {
            record.error = self.error;
        }
        if self.result.is_some() {
            record.result = self.result;
        }
        if self.worker_id.is_some() {
            record.worker_id = self.worker_id;
        }
        if self.raw_job.is_some() {
            record.raw_job = self.raw_job;
        }
        if self.start_time.is_some() {
            record.start_time = self.start_time;
        }
        if self.completed_at.is_some() {
            record.completed_at = self.completed_at;
        }
        if self.requeued_at.is_some() {
            record.requeued_at = self.requeued_at;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetryDecision {
    Retry { attempt: u32, max_attempts: u32 },
    GiveUp { attempts: u32 },
}

/// Where a job stands with respect to its terminal marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Finalization {
    /// No marker: the job may run.
    Open,
    /// Marker set and the terminal status written.
    Done,
    /// Marker set recently but the status is not terminal yet: the claimant is mid-way.
    InProgress,
    /// Marker set long ago without a terminal status: the claimant gave up or died.
    Stale,
}

const STATUS_WRITE_ATTEMPTS: usize = 16;

/// Per-job status records, retry counters and terminal markers.
pub(crate) struct JobHandler {
    store: Arc<dyn QueueStore>,
    keys: QueueKeys,
    status_ttl: Duration,
    retry_ttl: Duration,
    claim_timeout: Duration,
    retry_policy: RetryPolicy,
    tracker: Arc<dyn JobTracker>,
    event_tx: broadcast::Sender<EngineEvent>,
}

impl JobHandler {
    pub(crate) fn new(
        cfg: &EngineConfig,
        keys: QueueKeys,
        store: Arc<dyn QueueStore>,
        tracker: Arc<dyn JobTracker>,
        event_tx: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self {
            store,
            keys,
            status_ttl: cfg.status_ttl,
            retry_ttl: cfg.retry_ttl,
            claim_timeout: cfg.finalize_claim_timeout,
            retry_policy: cfg.retry_policy,
            tracker,
            event_tx,
        }
    }

    pub(crate) async fn get_job_status(
        &self,
        job_id: &str,
    ) -> Result<Option<JobStatusRecord>, EngineError> {
        let Some(raw) = self.store.get(&self.keys.status_key(job_id)).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Merge `update` over the stored record and persist it with `status`.
    ///
    /// Returns `false` (and writes nothing) when the stored status is terminal and `status`
    /// is not.
    pub(crate) async fn set_job_status(
        &self,
        job: &Job,
        status: JobStatus,
        update: StatusUpdate,
    ) -> Result<bool, EngineError> {
        self.write_status(&job.job_id, Some(job), status, &update).await
    }

    /// Like [`Self::set_job_status`] for a job known only by id; writes nothing when no
    /// record exists.
    pub(crate) async fn update_existing_status(
        &self,
        job_id: &str,
        status: JobStatus,
        update: StatusUpdate,
    ) -> Result<bool, EngineError> {
        self.write_status(job_id, None, status, &update).await
    }

    /// Read-merge-write loop. The write only lands if the record is still the one the guard
    /// was checked against, so a peer's terminal write can never be overwritten.
    async fn write_status(
        &self,
        job_id: &str,
        seed: Option<&Job>,
        status: JobStatus,
        update: &StatusUpdate,
    ) -> Result<bool, EngineError> {
        let key = self.keys.status_key(job_id);
        for _ in 0..STATUS_WRITE_ATTEMPTS {
            let current = self.store.get(&key).await?;
            let existing: Option<JobStatusRecord> =
                current.as_deref().map(serde_json::from_str).transpose()?;

            let mut record = match existing {
                Some(prev) if prev.status.is_terminal() && !status.is_terminal() => {
                    tracing::debug!(
                        job_id,
                        current = %prev.status,
                        requested = %status,
                        "status write refused: job already terminal"
                    );
                    return Ok(false);
                }
                Some(prev) => prev,
                None => match seed {
                    Some(job) => JobStatusRecord::for_job(job, status),
                    None => return Ok(false),
                },
            };
            record.status = status;
            record.timestamp = Utc::now();
            record.queue_type = self.keys.queue_type.clone();
            update.clone().apply(&mut record);

            let raw = serde_json::to_string(&record)?;
            if self
                .store
                .compare_and_set_with_ttl(&key, current.as_deref(), &raw, self.status_ttl)
                .await?
            {
                let _ = self.event_tx.send(EngineEvent::StatusChanged {
                    job_id: job_id.to_string(),
                    status,
                });
                return Ok(true);
            }
            tracing::trace!(job_id, "status record changed underneath; retrying write");
        }
        Err(EngineError::Store(StoreError::Command(format!(
            "status of job {job_id} kept changing; gave up after {STATUS_WRITE_ATTEMPTS} attempts"
        ))))
    }

    pub(crate) async fn mark_running(
        &self,
        job: &Job,
        raw: &str,
        worker_id: u64,
    ) -> Result<bool, EngineError> {
        self.set_job_status(
            job,
            JobStatus::Running,
            StatusUpdate {
                worker_id: Some(worker_id),
                raw_job: Some(raw.to_string()),
                start_time: Some(Utc::now()),
                ..StatusUpdate::default()
            },
        )
        .await
    }

    pub(crate) async fn update_progress(
        &self,
        job: &Job,
        percent: u8,
        message: Option<String>,
    ) -> Result<(), EngineError> {
        self.set_job_status(
            job,
            JobStatus::Running,
            StatusUpdate {
                progress: Some(percent),
                message,
                ..StatusUpdate::default()
            },
        )
        .await?;
        Ok(())
    }

    fn max_attempts(&self, job: &Job) -> u32 {
        match self.retry_policy {
            RetryPolicy::SingleAttempt => 1,
            RetryPolicy::PerJob => job.max_retries.max(1),
        }
    }

    /// Count a failed attempt and either re-enqueue `raw` or give up.
    pub(crate) async fn handle_job_failure(
        &self,
        job: &Job,
        error: &str,
        raw: &str,
    ) -> Result<RetryDecision, EngineError> {
        let attempts = self
            .store
            .increment_with_ttl(&self.keys.retry_key(&job.job_id), 1, self.retry_ttl)
            .await?;
        let attempts = u32::try_from(attempts.max(0)).unwrap_or(u32::MAX);
        let max_attempts = self.max_attempts(job);

        if attempts >= max_attempts {
            return Ok(RetryDecision::GiveUp { attempts });
        }

        let written = self
            .set_job_status(
                job,
                JobStatus::Queued,
                StatusUpdate {
                    message: Some(format!("retry {attempts}/{max_attempts}")),
                    error: Some(error.to_string()),
                    raw_job: Some(raw.to_string()),
                    ..StatusUpdate::default()
                },
            )
            .await?;
        if !written {
            // Another instance already finished this job.
            return Ok(RetryDecision::GiveUp { attempts });
        }
        self.store
            .push(&self.keys.queue_key, &[raw.to_string()])
            .await?;
        Ok(RetryDecision::Retry {
            attempt: attempts,
            max_attempts,
        })
    }

    pub(crate) async fn clear_retries(&self, job_id: &str) -> Result<(), EngineError> {
        self.store.delete(&[self.keys.retry_key(job_id)]).await?;
        Ok(())
    }

    /// Claim the right to finalize `job_id`. Only the first caller cluster-wide gets `true`.
    ///
    /// The marker holds the claim time in epoch millis.
    pub(crate) async fn claim_terminal(&self, job_id: &str) -> Result<bool, EngineError> {
        let claimed_at = Utc::now().timestamp_millis().to_string();
        Ok(self
            .store
            .set_if_absent_with_ttl(&self.keys.terminal_key(job_id), &claimed_at, self.status_ttl)
            .await?)
    }

    /// Give a claim back so the job can be finalized again.
    pub(crate) async fn release_terminal(&self, job_id: &str) -> Result<(), EngineError> {
        self.store.delete(&[self.keys.terminal_key(job_id)]).await?;
        Ok(())
    }

    pub(crate) async fn finalization(&self, job_id: &str) -> Result<Finalization, EngineError> {
        let Some(claimed) = self.store.get(&self.keys.terminal_key(job_id)).await? else {
            return Ok(Finalization::Open);
        };
        match self.get_job_status(job_id).await? {
            Some(record) if !record.status.is_terminal() => {
                let age_ms = claimed
                    .parse::<i64>()
                    .ok()
                    .map(|at| Utc::now().timestamp_millis().saturating_sub(at));
                let timeout_ms = i64::try_from(self.claim_timeout.as_millis()).unwrap_or(i64::MAX);
                match age_ms {
                    Some(age) if age < timeout_ms => Ok(Finalization::InProgress),
                    _ => Ok(Finalization::Stale),
                }
            }
            _ => Ok(Finalization::Done),
        }
    }

    pub(crate) async fn track_job_increment(&self, job: &Job) {
        if let Err(err) = self.tracker.track_increment(job).await {
            tracing::warn!(job_id = %job.job_id, team_id = %job.team_id, "job tracking (increment) failed: {err:#}");
        }
    }

    pub(crate) async fn track_job_completion(&self, job: &Job, status: JobStatus) {
        if let Err(err) = self.tracker.track_completion(job, status).await {
            tracing::warn!(job_id = %job.job_id, team_id = %job.team_id, "job tracking (completion) failed: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FlakyStore;
    use crate::tracker::NoopTracker;
    use jobmill_core::Payload;
    use jobmill_store::MemoryStore;

    fn handler(store: Arc<MemoryStore>, policy: RetryPolicy) -> JobHandler {
        let cfg = EngineConfig {
            retry_policy: policy,
            ..EngineConfig::for_queue("status-test")
        };
        let (event_tx, _) = broadcast::channel(64);
        JobHandler::new(
            &cfg,
            QueueKeys::new(&cfg.queue_type),
            store,
            Arc::new(NoopTracker),
            event_tx,
        )
    }

    #[tokio::test]
    async fn terminal_status_is_never_overwritten_by_non_terminal() {
        let store = MemoryStore::arc();
        let jobs = handler(store, RetryPolicy::PerJob);
        let job = Job::new("status-test", "t", Payload::default()).with_label("region", "eu");

        assert!(jobs.mark_running(&job, "raw", 2).await.unwrap());
        assert!(
            jobs.set_job_status(&job, JobStatus::Completed, StatusUpdate::default())
                .await
                .unwrap()
        );
        assert!(!jobs.mark_running(&job, "raw", 3).await.unwrap());

        let record = jobs.get_job_status(&job.job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.worker_id, Some(2));
        assert_eq!(record.raw_job.as_deref(), Some("raw"));
        assert_eq!(record.labels.get("region").map(String::as_str), Some("eu"));
    }

    #[tokio::test]
    async fn per_job_policy_retries_until_budget_is_spent() {
        let store = MemoryStore::arc();
        let jobs = handler(store.clone(), RetryPolicy::PerJob);
        let job = Job::new("status-test", "t", Payload::default()).with_max_retries(3);
        let keys = QueueKeys::new("status-test");

        let first = jobs.handle_job_failure(&job, "boom", "raw").await.unwrap();
        assert_eq!(first, RetryDecision::Retry { attempt: 1, max_attempts: 3 });
        assert_eq!(store.list_items(&keys.queue_key), vec!["raw".to_string()]);
        let record = jobs.get_job_status(&job.job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!(record.error.as_deref(), Some("boom"));

        let second = jobs.handle_job_failure(&job, "boom", "raw").await.unwrap();
        assert_eq!(second, RetryDecision::Retry { attempt: 2, max_attempts: 3 });
        let third = jobs.handle_job_failure(&job, "boom", "raw").await.unwrap();
        assert_eq!(third, RetryDecision::GiveUp { attempts: 3 });
        assert_eq!(store.len(&keys.queue_key).await.unwrap(), 2);

        jobs.clear_retries(&job.job_id).await.unwrap();
        assert!(store.get(&keys.retry_key(&job.job_id)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn single_attempt_policy_still_counts_the_failure() {
        let store = MemoryStore::arc();
        let jobs = handler(store.clone(), RetryPolicy::SingleAttempt);
        let job = Job::new("status-test", "t", Payload::default()).with_max_retries(5);
        let keys = QueueKeys::new("status-test");

        let decision = jobs.handle_job_failure(&job, "boom", "raw").await.unwrap();
        assert_eq!(decision, RetryDecision::GiveUp { attempts: 1 });
        assert_eq!(store.len(&keys.queue_key).await.unwrap(), 0);
        assert_eq!(
            store.get(&keys.retry_key(&job.job_id)).await.unwrap().as_deref(),
            Some("1")
        );
    }

    #[tokio::test]
    async fn terminal_claim_is_granted_once_and_can_be_released() {
        let jobs = handler(MemoryStore::arc(), RetryPolicy::PerJob);
        let job = Job::new("status-test", "t", Payload::default());
        let id = job.job_id.as_str();

        assert_eq!(jobs.finalization(id).await.unwrap(), Finalization::Open);
        jobs.mark_running(&job, "raw", 1).await.unwrap();
        assert!(jobs.claim_terminal(id).await.unwrap());
        assert!(!jobs.claim_terminal(id).await.unwrap());
        assert_eq!(jobs.finalization(id).await.unwrap(), Finalization::InProgress);

        jobs.release_terminal(id).await.unwrap();
        assert_eq!(jobs.finalization(id).await.unwrap(), Finalization::Open);

        assert!(jobs.claim_terminal(id).await.unwrap());
        jobs.set_job_status(&job, JobStatus::Completed, StatusUpdate::default())
            .await
            .unwrap();
        assert_eq!(jobs.finalization(id).await.unwrap(), Finalization::Done);
    }

    #[tokio::test]
    async fn abandoned_claims_turn_stale() {
        let store = MemoryStore::arc();
        let jobs = handler(store.clone(), RetryPolicy::PerJob);
        let keys = QueueKeys::new("status-test");
        let job = Job::new("status-test", "t", Payload::default());
        jobs.mark_running(&job, "raw", 1).await.unwrap();

        let long_ago = (Utc::now().timestamp_millis() - 10 * 60 * 1000).to_string();
        store
            .set_with_ttl(&keys.terminal_key(&job.job_id), &long_ago, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(jobs.finalization(&job.job_id).await.unwrap(), Finalization::Stale);
    }

    #[tokio::test]
    async fn terminal_write_from_a_peer_wins_over_a_racing_running_write() {
        let memory = MemoryStore::arc();
        let store = FlakyStore::new(memory.clone());
        let (event_tx, _) = broadcast::channel(64);
        let cfg = EngineConfig::for_queue("status-test");
        let keys = QueueKeys::new(&cfg.queue_type);
        let jobs = JobHandler::new(&cfg, keys.clone(), store.clone(), Arc::new(NoopTracker), event_tx);
        let job = Job::new("status-test", "t", Payload::default());
        jobs.mark_running(&job, "raw", 1).await.unwrap();

        // A peer lands a terminal record between this instance's read and its write.
        let mut completed = JobStatusRecord::for_job(&job, JobStatus::Completed);
        completed.worker_id = Some(9);
        store.write_before_once(
            "compare_and_set_with_ttl",
            keys.status_key(&job.job_id),
            serde_json::to_string(&completed).unwrap(),
        );

        jobs.update_progress(&job, 50, Some("half".to_string()))
            .await
            .unwrap();
        assert_eq!(store.armed(), 0);
        let record = jobs.get_job_status(&job.job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.worker_id, Some(9));
        assert_eq!(record.message, None);
    }

    #[tokio::test]
    async fn status_update_without_a_record_writes_nothing() {
        let jobs = handler(MemoryStore::arc(), RetryPolicy::PerJob);
        let written = jobs
            .update_existing_status("ghost", JobStatus::Requeued, StatusUpdate::default())
            .await
            .unwrap();
        assert!(!written);
        assert!(jobs.get_job_status("ghost").await.unwrap().is_none());
    }
}
