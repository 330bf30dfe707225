use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use jobmill_core::{Job, JobStatus, JobStatusRecord, QueueKeys};
use jobmill_store::QueueStore;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::api::{EngineConfig, EngineDeps, EngineError, EngineEvent};
use crate::session::{SessionHook, SessionManager, generate_session_id};
use crate::status::{JobHandler, StatusUpdate};
use crate::tracker::JobTracker;

/// Result of a successful `add_jobs` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedBatch {
    /// Session the batch was stamped with.
    pub session_id: String,
    /// Job ids in submission order.
    pub job_ids: Vec<String>,
}

/// Store-facing state shared by the dispatch loop, recovery and the submission client.
pub(crate) struct EngineContext {
    pub(crate) cfg: EngineConfig,
    pub(crate) keys: QueueKeys,
    pub(crate) store: Arc<dyn QueueStore>,
    pub(crate) jobs: JobHandler,
    pub(crate) sessions: SessionManager,
    pub(crate) event_tx: broadcast::Sender<EngineEvent>,
}

impl EngineContext {
    pub(crate) fn new(
        cfg: EngineConfig,
        store: Arc<dyn QueueStore>,
        tracker: Arc<dyn JobTracker>,
        session_hook: Option<Arc<dyn SessionHook>>,
        event_tx: broadcast::Sender<EngineEvent>,
    ) -> Self {
        let keys = QueueKeys::new(&cfg.queue_type);
        let jobs = JobHandler::new(
            &cfg,
            keys.clone(),
            store.clone(),
            tracker,
            event_tx.clone(),
        );
        let sessions = SessionManager::new(
            store.clone(),
            keys.clone(),
            cfg.session_ttl,
            cfg.session_grace,
            session_hook,
            event_tx.clone(),
        );
        Self {
            cfg,
            keys,
            store,
            jobs,
            sessions,
            event_tx,
        }
    }

    pub(crate) fn from_deps(
        cfg: EngineConfig,
        deps: &EngineDeps,
        event_tx: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self::new(
            cfg,
            deps.store.clone(),
            deps.tracker.clone(),
            deps.session_hook.clone(),
            event_tx,
        )
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Submits jobs and queries their status without running a dispatch loop.
///
/// Obtained from a running engine with [`crate::EngineHandle::client`], or built standalone
/// with [`JobClient::new`] by processes that only produce work.
#[derive(Clone)]
pub struct JobClient {
    pub(crate) ctx: Arc<EngineContext>,
}

impl std::fmt::Debug for JobClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobClient")
            .field("queue_type", &self.ctx.keys.queue_type)
            .finish_non_exhaustive()
    }
}

impl JobClient {
    /// Standalone client for `config.queue_type`.
    ///
    /// Sessions submitted here are completed by whichever engine instance finishes their last
    /// job, so no session hook is attached.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn QueueStore>,
        tracker: Arc<dyn JobTracker>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            ctx: Arc::new(EngineContext::new(
                config.normalized(),
                store,
                tracker,
                None,
                event_tx,
            )),
        }
    }

    pub(crate) fn from_context(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Queue class this client submits to.
    pub fn queue_type(&self) -> &str {
        &self.ctx.keys.queue_type
    }

    /// Persist `jobs` as one session and push them onto the pending list.
    ///
    /// Returns once the enqueue is durable, not once the jobs complete.
    pub async fn add_jobs(&self, mut jobs: Vec<Job>) -> Result<SubmittedBatch, EngineError> {
        if jobs.is_empty() {
            return Err(EngineError::EmptyBatch);
        }

        let ctx = &self.ctx;
        let mut seen = HashSet::new();
        for job in &mut jobs {
            job.ensure_id();
            job.validate().map_err(EngineError::InvalidJob)?;
            if job.queue_type != ctx.keys.queue_type {
                return Err(EngineError::InvalidJob(format!(
                    "job {} targets queue {:?}, this engine serves {:?}",
                    job.job_id, job.queue_type, ctx.keys.queue_type
                )));
            }
            if !seen.insert(job.job_id.clone()) {
                return Err(EngineError::InvalidJob(format!(
                    "duplicate job id {} in batch",
                    job.job_id
                )));
            }
        }

        let session_id = generate_session_id();
        let now = Utc::now();
        for job in &mut jobs {
            job.session_id = Some(session_id.clone());
            job.status = JobStatus::Queued;
            job.updated_at = now;
        }

        let raws = jobs
            .iter()
            .map(Job::to_raw)
            .collect::<Result<Vec<_>, _>>()?;

        ctx.sessions
            .initialize_session(&session_id, now, jobs.len() as u64, &jobs[0])
            .await?;

        for job in &jobs {
            ctx.jobs.track_job_increment(job).await;
        }

        // Queued is recorded before the push so a fast worker's Running write always lands
        // after it.
        for (job, raw) in jobs.iter().zip(&raws) {
            ctx.jobs
                .set_job_status(
                    job,
                    JobStatus::Queued,
                    StatusUpdate {
                        raw_job: Some(raw.clone()),
                        ..StatusUpdate::default()
                    },
                )
                .await?;
        }

        ctx.store.push(&ctx.keys.queue_key, &raws).await?;

        tracing::info!(
            queue_type = %ctx.keys.queue_type,
            session_id = %session_id,
            jobs = jobs.len(),
            "jobs queued"
        );
        for job in &jobs {
            ctx.emit(EngineEvent::JobQueued {
                job_id: job.job_id.clone(),
                session_id: session_id.clone(),
            });
        }

        Ok(SubmittedBatch {
            session_id,
            job_ids: jobs.into_iter().map(|j| j.job_id).collect(),
        })
    }

    /// Latest status record of `job_id`, if it has not expired.
    pub async fn get_job_status(&self, job_id: &str) -> Result<Option<JobStatusRecord>, EngineError> {
        self.ctx.jobs.get_job_status(job_id).await
    }

    /// Number of jobs waiting in the pending list.
    pub async fn backlog(&self) -> Result<u64, EngineError> {
        Ok(self.ctx.store.len(&self.ctx.keys.queue_key).await?)
    }

    /// Display label for `raw_status`: the configured label for this queue class, else the
    /// canonical name. Unknown input is returned unchanged.
    pub fn mapped_status(&self, raw_status: &str) -> String {
        let Some(status) = JobStatus::parse(raw_status) else {
            return raw_status.to_string();
        };
        self.ctx
            .cfg
            .status_labels
            .get(&status)
            .cloned()
            .unwrap_or_else(|| status.as_str().to_string())
    }
}
