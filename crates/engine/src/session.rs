use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobmill_core::{Job, QueueKeys, SessionRecord};
use jobmill_store::QueueStore;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::api::{EngineError, EngineEvent};

/// A drained session, as passed to [`SessionHook`] and reported by `SessionCompleted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session id.
    pub session_id: String,
    /// Jobs submitted in the session.
    pub total_jobs: u64,
    /// Submission time.
    pub started_at: DateTime<Utc>,
    /// Time the last job finished.
    pub completed_at: DateTime<Utc>,
    /// Tenant that submitted the session.
    pub team_id: String,
    /// Queue class of the session.
    pub queue_type: String,
}

/// Side effects to run once every job of a session has finished (e.g. temp-resource cleanup).
///
/// Errors are logged; they never affect the session completion event.
#[async_trait]
pub trait SessionHook: Send + Sync {
    /// Called once per drained session, cluster-wide.
    async fn on_session_completed(&self, summary: &SessionSummary) -> anyhow::Result<()>;
}

pub(crate) fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Timestamp plus random suffix; unique without coordination.
pub(crate) fn generate_session_id() -> String {
    format!("{}-{}", Utc::now().timestamp_millis(), random_suffix(8))
}

pub(crate) struct SessionManager {
    store: Arc<dyn QueueStore>,
    keys: QueueKeys,
    ttl: Duration,
    grace: Duration,
    finalizing: Arc<Mutex<HashSet<String>>>,
    hook: Option<Arc<dyn SessionHook>>,
    event_tx: broadcast::Sender<EngineEvent>,
}

impl SessionManager {
    pub(crate) fn new(
        store: Arc<dyn QueueStore>,
        keys: QueueKeys,
        ttl: Duration,
        grace: Duration,
        hook: Option<Arc<dyn SessionHook>>,
        event_tx: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self {
            store,
            keys,
            ttl,
            grace,
            finalizing: Arc::new(Mutex::new(HashSet::new())),
            hook,
            event_tx,
        }
    }

    /// Write the session record and its remaining counter.
    pub(crate) async fn initialize_session(
        &self,
        session_id: &str,
        start_time: DateTime<Utc>,
        job_count: u64,
        representative: &Job,
    ) -> Result<(), EngineError> {
        let record = SessionRecord {
            session_id: session_id.to_string(),
            start_time,
            total_jobs: job_count,
            team_id: representative.team_id.clone(),
            owner_id: representative.owner_id.clone(),
            queue_type: representative.queue_type.clone(),
        };
        let raw = serde_json::to_string(&record)?;
        self.store
            .set_with_ttl(&self.keys.session_key(session_id), &raw, self.ttl)
            .await?;
        self.store
            .set_with_ttl(
                &self.keys.session_remaining_key(session_id),
                &job_count.to_string(),
                self.ttl,
            )
            .await?;
        tracing::debug!(session_id, job_count, "session initialized");
        Ok(())
    }

    fn begin_finalizing(&self, session_id: &str) -> bool {
        let mut set = self
            .finalizing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        set.insert(session_id.to_string())
    }

    fn release_after_grace(&self, session_id: String) {
        let finalizing = self.finalizing.clone();
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            finalizing
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&session_id);
        });
    }

    /// Count one terminal outcome against the job's session. Returns `true` for the single
    /// call that drained the session.
    pub(crate) async fn check_and_cleanup_session(&self, job: &Job) -> Result<bool, EngineError> {
        let Some(session_id) = job.session_id.as_deref() else {
            return Ok(false);
        };

        let session_key = self.keys.session_key(session_id);
        // Read before decrementing: the last decrement deletes the record.
        let record: Option<SessionRecord> = match self.store.get(&session_key).await? {
            Some(raw) => serde_json::from_str(&raw).ok(),
            None => None,
        };

        let remaining = self
            .store
            .decrement_or_delete(
                &self.keys.session_remaining_key(session_id),
                std::slice::from_ref(&session_key),
            )
            .await?;
        match remaining {
            None => {
                tracing::debug!(session_id, job_id = %job.job_id, "session counter already gone");
                return Ok(false);
            }
            Some(n) if n > 0 => return Ok(false),
            Some(_) => {}
        }

        if !self.begin_finalizing(session_id) {
            tracing::debug!(session_id, "session already finalizing");
            return Ok(false);
        }

        let summary = SessionSummary {
            session_id: session_id.to_string(),
            total_jobs: record.as_ref().map_or(0, |r| r.total_jobs),
            started_at: record.as_ref().map_or_else(Utc::now, |r| r.start_time),
            completed_at: Utc::now(),
            team_id: job.team_id.clone(),
            queue_type: job.queue_type.clone(),
        };

        if let Some(hook) = &self.hook {
            if let Err(err) = hook.on_session_completed(&summary).await {
                tracing::warn!(session_id, "session cleanup hook failed: {err:#}");
            }
        }

        tracing::info!(
            session_id,
            total_jobs = summary.total_jobs,
            "session completed"
        );
        let _ = self.event_tx.send(EngineEvent::SessionCompleted {
            session_id: summary.session_id.clone(),
            total_jobs: summary.total_jobs,
            started_at: summary.started_at,
            completed_at: summary.completed_at,
        });

        self.release_after_grace(session_id.to_string());
        Ok(true)
    }
}
