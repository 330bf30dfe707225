use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jobmill_core::{JobStatus, JobStatusRecord};
use serde::{Deserialize, Serialize};

use crate::api::EngineError;
use crate::client::EngineContext;
use crate::session::random_suffix;
use crate::status::{Finalization, StatusUpdate};

/// Counters from one startup recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Items moved from the processing list back to pending.
    pub drained: u64,
    /// Orphaned `Running` jobs re-pushed onto pending.
    pub requeued: u64,
    /// Status records inspected.
    pub scanned: u64,
}

pub(crate) const REQUEUED_MESSAGE: &str = "requeued after restart";

/// Returns abandoned work to the pending list when an engine instance starts.
pub(crate) struct RecoveryManager {
    ctx: Arc<EngineContext>,
    instance_id: String,
}

impl RecoveryManager {
    pub(crate) fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            instance_id: format!("{}-{}", std::process::id(), random_suffix(12)),
        }
    }

    /// Run `f` while holding the cluster-wide recovery lock.
    ///
    /// Returns `Ok(None)` without running `f` when another instance holds the lock.
    pub(crate) async fn with_startup_lock<F, Fut, T>(&self, f: F) -> Result<Option<T>, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let store = &self.ctx.store;
        let lock_key = &self.ctx.keys.recovery_lock_key;
        let acquired = store
            .set_if_absent_with_ttl(lock_key, &self.instance_id, self.ctx.cfg.recovery_lock_ttl)
            .await?;
        if !acquired {
            tracing::info!(lock = %lock_key, "recovery lock held elsewhere; skipping");
            return Ok(None);
        }

        let result = f().await;

        // Only release a lock that is still ours; it may have expired and been re-taken.
        match store.get(lock_key).await {
            Ok(Some(holder)) if holder == self.instance_id => {
                if let Err(err) = store.delete(std::slice::from_ref(lock_key)).await {
                    tracing::warn!("release recovery lock: {err}");
                }
            }
            Ok(_) => {}
            Err(err) => tracing::warn!("read recovery lock: {err}"),
        }

        result.map(Some)
    }

    /// Move everything in the processing list back onto pending.
    pub(crate) async fn drain_processing_into_queue(&self) -> Result<u64, EngineError> {
        let keys = &self.ctx.keys;
        let mut drained = 0;
        while self
            .ctx
            .store
            .lease(&keys.processing_key, &keys.queue_key, Duration::ZERO)
            .await?
            .is_some()
        {
            drained += 1;
        }
        if drained > 0 {
            tracing::info!(drained, queue_type = %keys.queue_type, "processing list drained");
        }
        Ok(drained)
    }

    async fn requeue_if_orphaned(&self, record: JobStatusRecord) -> Result<bool, EngineError> {
        let keys = &self.ctx.keys;
        let Some(raw) = record.raw_job else {
            tracing::warn!(job_id = %record.job_id, "running job has no stored payload; cannot requeue");
            return Ok(false);
        };
        if self.ctx.store.contains(&keys.queue_key, &raw).await?
            || self.ctx.store.contains(&keys.processing_key, &raw).await?
        {
            return Ok(false);
        }
        match self.ctx.jobs.finalization(&record.job_id).await? {
            Finalization::Open | Finalization::Stale => {}
            Finalization::Done | Finalization::InProgress => return Ok(false),
        }

        self.ctx.store.push(&keys.queue_key, &[raw]).await?;
        self.ctx
            .jobs
            .update_existing_status(
                &record.job_id,
                JobStatus::Requeued,
                StatusUpdate {
                    message: Some(REQUEUED_MESSAGE.to_string()),
                    requeued_at: Some(Utc::now()),
                    ..StatusUpdate::default()
                },
            )
            .await?;
        tracing::info!(job_id = %record.job_id, "orphaned running job requeued");
        Ok(true)
    }

    /// Re-push every `Running` job whose payload is in neither list.
    ///
    /// Returns `(requeued, scanned)`.
    pub(crate) async fn requeue_stale_running_jobs(&self) -> Result<(u64, u64), EngineError> {
        let pattern = self.ctx.keys.status_pattern();
        let batch = self.ctx.cfg.recovery_scan_batch;
        let mut cursor = 0;
        let mut requeued = 0;
        let mut scanned = 0;

        loop {
            let (next, keys) = self.ctx.store.scan_keys(&pattern, cursor, batch).await?;
            for key in keys {
                scanned += 1;
                let Some(raw) = self.ctx.store.get(&key).await? else {
                    continue;
                };
                let record: JobStatusRecord = match serde_json::from_str(&raw) {
                    Ok(record) => record,
                    Err(err) => {
                        tracing::warn!(key = %key, "unreadable status record: {err}");
                        continue;
                    }
                };
                if record.status == JobStatus::Running && self.requeue_if_orphaned(record).await? {
                    requeued += 1;
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok((requeued, scanned))
    }

    /// Drain, then requeue orphans, under the startup lock.
    pub(crate) async fn recover_on_startup(&self) -> Result<Option<RecoveryReport>, EngineError> {
        self.with_startup_lock(|| async {
            let drained = self.drain_processing_into_queue().await?;
            let (requeued, scanned) = self.requeue_stale_running_jobs().await?;
            Ok(RecoveryReport {
                drained,
                requeued,
                scanned,
            })
        })
        .await
    }
}
