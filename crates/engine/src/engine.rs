use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use jobmill_core::{Job, JobStatus, JobStatusRecord};
use tokio::sync::{Notify, broadcast, mpsc, watch};
use tokio::time::Instant;

use crate::api::{EngineConfig, EngineDeps, EngineError, EngineEvent, EngineHandle, StatusSnapshot};
use crate::client::{EngineContext, JobClient};
use crate::pool::{PoolConfig, WorkerId, WorkerPool};
use crate::recovery::RecoveryManager;
use crate::runner::JobRunner;
use crate::status::{Finalization, RetryDecision, StatusUpdate};
use crate::worker::{WorkerEvent, WorkerMessage};

pub(crate) struct EngineInner {
    pub(crate) event_tx: broadcast::Sender<EngineEvent>,
    pub(crate) snapshot_rx: watch::Receiver<StatusSnapshot>,
    stop_requested: AtomicBool,
    abort_requested: AtomicBool,
    notify: Notify,
}

impl EngineInner {
    fn new(
        event_tx: broadcast::Sender<EngineEvent>,
        snapshot_rx: watch::Receiver<StatusSnapshot>,
    ) -> Self {
        Self {
            event_tx,
            snapshot_rx,
            stop_requested: AtomicBool::new(false),
            abort_requested: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub(crate) fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            let _ = self.event_tx.send(EngineEvent::StopRequested);
        }
        self.notify.notify_one();
    }

    pub(crate) fn request_abort(&self) {
        self.abort_requested.store(true, Ordering::SeqCst);
        self.request_stop();
    }

    pub(crate) fn wake(&self) {
        self.notify.notify_one();
    }

    fn should_stop(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    fn should_abort(&self) -> bool {
        self.abort_requested.load(Ordering::SeqCst)
    }
}

/// Terminal outcome of one job attempt.
#[derive(Debug, Clone)]
pub(crate) enum Outcome {
    Completed(serde_json::Value),
    Failed(String),
}

impl Outcome {
    /// The outcome already written to a terminal status record.
    fn from_record(record: JobStatusRecord) -> Option<Self> {
        match record.status {
            JobStatus::Completed => Some(Outcome::Completed(
                record.result.unwrap_or(serde_json::Value::Null),
            )),
            JobStatus::Failed => Some(Outcome::Failed(record.error.unwrap_or_default())),
            _ => None,
        }
    }
}

impl EngineContext {
    /// Record a terminal outcome exactly once per job, cluster-wide.
    ///
    /// Returns `false` when the job had already been finalized; nothing is written or
    /// emitted in that case. On error the claim is given back, so a later delivery of the
    /// same item can redo every step.
    pub(crate) async fn finalize(&self, job: &Job, outcome: Outcome) -> Result<bool, EngineError> {
        if !self.jobs.claim_terminal(&job.job_id).await? {
            tracing::debug!(job_id = %job.job_id, "duplicate terminal outcome ignored");
            return Ok(false);
        }

        let status = match self.record_outcome(job, &outcome).await {
            Ok(status) => status,
            Err(err) => {
                if let Err(release_err) = self.jobs.release_terminal(&job.job_id).await {
                    // Left in place, the claim turns stale and startup recovery requeues the job.
                    tracing::warn!(job_id = %job.job_id, "release terminal claim: {release_err}");
                }
                return Err(err);
            }
        };
        self.jobs.track_job_completion(job, status).await;

        match outcome {
            Outcome::Completed(result) => {
                tracing::info!(job_id = %job.job_id, "job completed");
                self.emit(EngineEvent::JobCompleted {
                    job_id: job.job_id.clone(),
                    result,
                });
            }
            Outcome::Failed(error) => {
                tracing::warn!(job_id = %job.job_id, "job failed: {error}");
                self.emit(EngineEvent::JobFailed {
                    job_id: job.job_id.clone(),
                    error,
                });
            }
        }
        Ok(true)
    }

    /// Store writes of a finalization. Every step is safe to repeat.
    async fn record_outcome(&self, job: &Job, outcome: &Outcome) -> Result<JobStatus, EngineError> {
        let now = Utc::now();
        let (status, update) = match outcome {
            Outcome::Completed(result) => (
                JobStatus::Completed,
                StatusUpdate {
                    progress: Some(100),
                    result: Some(result.clone()),
                    completed_at: Some(now),
                    ..StatusUpdate::default()
                },
            ),
            Outcome::Failed(error) => (
                JobStatus::Failed,
                StatusUpdate {
                    error: Some(error.clone()),
                    completed_at: Some(now),
                    ..StatusUpdate::default()
                },
            ),
        };
        self.jobs.set_job_status(job, status, update).await?;
        if status == JobStatus::Completed {
            self.jobs.clear_retries(&job.job_id).await?;
        }
        self.sessions.check_and_cleanup_session(job).await?;
        Ok(status)
    }
}

struct Lease {
    job: Job,
    raw: String,
}

struct EngineRuntime {
    inner: Arc<EngineInner>,
    ctx: Arc<EngineContext>,
    pool: WorkerPool,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    leases: HashMap<WorkerId, Lease>,
    backlog: u64,
    snapshot_tx: watch::Sender<StatusSnapshot>,
}

impl EngineRuntime {
    fn new(
        inner: Arc<EngineInner>,
        ctx: Arc<EngineContext>,
        runner: Arc<dyn JobRunner>,
        snapshot_tx: watch::Sender<StatusSnapshot>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::new(
            PoolConfig::from(&ctx.cfg),
            runner,
            events_tx,
            ctx.event_tx.clone(),
        );
        Self {
            inner,
            ctx,
            pool,
            events_rx,
            leases: HashMap::new(),
            backlog: 0,
            snapshot_tx,
        }
    }

    fn cfg(&self) -> &EngineConfig {
        &self.ctx.cfg
    }

    fn build_snapshot(&self) -> StatusSnapshot {
        let crashes = self.pool.crash_tracker();
        StatusSnapshot {
            stop_requested: self.inner.should_stop(),
            pool_size: self.pool.len(),
            idle_workers: self.pool.idle_count(),
            backlog: self.backlog,
            crash_loop: crashes.in_crash_loop(),
            consecutive_crashes: crashes.consecutive(),
            workers: self.pool.snapshot(),
        }
    }

    fn push_snapshot(&self) {
        let _ = self.snapshot_tx.send(self.build_snapshot());
    }

    fn emit(&self, event: EngineEvent) {
        self.ctx.emit(event);
    }

    async fn refresh_backlog(&mut self) -> Result<u64, EngineError> {
        self.backlog = self.ctx.store.len(&self.ctx.keys.queue_key).await?;
        Ok(self.backlog)
    }

    /// One pass of scale-up, lease and assign. Returns the number of jobs leased.
    async fn dispatch_round(&mut self) -> Result<usize, EngineError> {
        let backlog = self.refresh_backlog().await?;
        let desired = self.cfg().max_concurrent_jobs.min(backlog as usize);
        if desired > self.pool.len() {
            self.pool.scale_up(desired - self.pool.len());
        }
        self.pool.ensure_min();

        let idle = self.pool.idle_ids();
        if idle.is_empty() {
            return Ok(0);
        }

        let want = idle.len().min(self.cfg().batch_size);
        let mut leased = 0;
        for (i, worker_id) in idle.into_iter().take(want).enumerate() {
            let timeout = if i == 0 {
                self.cfg().lease_timeout
            } else {
                Duration::ZERO
            };
            let keys = &self.ctx.keys;
            let Some(raw) = self
                .ctx
                .store
                .lease(&keys.queue_key, &keys.processing_key, timeout)
                .await?
            else {
                break;
            };
            leased += 1;
            if let Err(err) = self.assign(worker_id, &raw).await {
                tracing::warn!(worker_id, "assignment failed: {err}");
                self.return_to_pending(&raw).await;
            }
        }
        Ok(leased)
    }

    async fn assign(&mut self, worker_id: WorkerId, raw: &str) -> Result<(), EngineError> {
        let job = match Job::from_raw(raw) {
            Ok(job) => job,
            Err(err) => {
                let message = format!("dropping unreadable queue item: {err}");
                tracing::error!("{message}");
                self.emit(EngineEvent::Error { message });
                self.ack(raw).await;
                return Ok(());
            }
        };

        match self.ctx.jobs.finalization(&job.job_id).await? {
            Finalization::Open => {}
            Finalization::Done => {
                tracing::debug!(job_id = %job.job_id, "job already finalized; dropping replay");
                self.ack(raw).await;
                return Ok(());
            }
            Finalization::InProgress => {
                tracing::debug!(job_id = %job.job_id, "job is being finalized elsewhere; dropping replay");
                self.ack(raw).await;
                return Ok(());
            }
            Finalization::Stale => {
                tracing::warn!(job_id = %job.job_id, "abandoned terminal claim; running job again");
                self.ctx.jobs.release_terminal(&job.job_id).await?;
            }
        }

        if !self.ctx.jobs.mark_running(&job, raw, worker_id).await? {
            // The outcome was stored but a later finalization step failed.
            return self.finish_recorded_outcome(&job, raw).await;
        }
        match self.pool.assign(worker_id, Box::new(job.clone())) {
            Ok(()) => {
                tracing::debug!(worker_id, job_id = %job.job_id, "job assigned");
                self.emit(EngineEvent::JobStarted {
                    worker_id,
                    job_id: job.job_id.clone(),
                });
                self.leases.insert(
                    worker_id,
                    Lease {
                        job,
                        raw: raw.to_string(),
                    },
                );
            }
            Err(job) => {
                tracing::warn!(worker_id, job_id = %job.job_id, "worker handoff failed; returning job");
                self.return_to_pending(raw).await;
                if let Err(err) = self
                    .ctx
                    .jobs
                    .set_job_status(
                        &job,
                        JobStatus::Queued,
                        StatusUpdate {
                            message: Some("worker handoff failed".to_string()),
                            ..StatusUpdate::default()
                        },
                    )
                    .await
                {
                    tracing::warn!(job_id = %job.job_id, "reset status after failed handoff: {err}");
                }
            }
        }
        Ok(())
    }

    async fn finish_recorded_outcome(&self, job: &Job, raw: &str) -> Result<(), EngineError> {
        let outcome = self
            .ctx
            .jobs
            .get_job_status(&job.job_id)
            .await?
            .and_then(Outcome::from_record);
        match outcome {
            Some(outcome) => {
                tracing::info!(job_id = %job.job_id, "finishing an interrupted finalization");
                self.ctx.finalize(job, outcome).await?;
            }
            None => tracing::debug!(job_id = %job.job_id, "status record gone; dropping replay"),
        }
        self.ack(raw).await;
        Ok(())
    }

    /// Remove a finished item from the processing list.
    async fn ack(&self, raw: &str) {
        if let Err(err) = self
            .ctx
            .store
            .remove_one(&self.ctx.keys.processing_key, raw)
            .await
        {
            tracing::warn!("remove from processing list: {err}");
        }
    }

    /// Push back onto pending before removing from processing, so the item is never absent
    /// from both.
    async fn return_to_pending(&self, raw: &str) {
        let keys = &self.ctx.keys;
        if let Err(err) = self.ctx.store.push(&keys.queue_key, &[raw.to_string()]).await {
            // Still in processing; the next startup recovery returns it.
            tracing::error!("return job to pending list: {err}");
            return;
        }
        self.ack(raw).await;
    }

    fn take_lease(&mut self, worker_id: WorkerId, job_id: &str) -> Option<Lease> {
        match self.leases.get(&worker_id) {
            Some(lease) if lease.job.job_id == job_id => self.leases.remove(&worker_id),
            _ => {
                tracing::warn!(worker_id, job_id, "outcome for a job this worker does not hold");
                None
            }
        }
    }

    async fn complete_job(&mut self, lease: Lease, result: serde_json::Value) {
        match self.ctx.finalize(&lease.job, Outcome::Completed(result)).await {
            Ok(_) => self.ack(&lease.raw).await,
            Err(err) => {
                tracing::error!(job_id = %lease.job.job_id, "finalize completed job: {err}");
                self.return_to_pending(&lease.raw).await;
            }
        }
    }

    async fn fail_job(&mut self, lease: Lease, error: String) {
        let decision = self
            .ctx
            .jobs
            .handle_job_failure(&lease.job, &error, &lease.raw)
            .await;
        let finalized = match decision {
            Ok(RetryDecision::Retry {
                attempt,
                max_attempts,
            }) => {
                tracing::info!(job_id = %lease.job.job_id, attempt, max_attempts, "job failed; retrying: {error}");
                self.emit(EngineEvent::JobRetrying {
                    job_id: lease.job.job_id.clone(),
                    attempt,
                    max_attempts,
                    error,
                });
                Ok(true)
            }
            Ok(RetryDecision::GiveUp { .. }) => {
                self.ctx.finalize(&lease.job, Outcome::Failed(error)).await
            }
            Err(err) => Err(err),
        };
        match finalized {
            Ok(_) => self.ack(&lease.raw).await,
            Err(err) => {
                tracing::error!(job_id = %lease.job.job_id, "record job failure: {err}");
                self.return_to_pending(&lease.raw).await;
            }
        }
    }

    async fn handle_worker_fault(&mut self, worker_id: WorkerId, reason: String) {
        let Some(fault) = self.pool.take_fault(worker_id, &reason) else {
            return;
        };
        if let Some(lease) = self.leases.remove(&worker_id) {
            self.fail_job(lease, format!("worker {worker_id} crashed: {reason}"))
                .await;
        }
        if let Some(backoff) = fault.backoff {
            tracing::warn!(
                consecutive_crashes = fault.consecutive_crashes,
                backoff_ms = backoff.as_millis() as u64,
                "workers are crash-looping; delaying respawn"
            );
            self.emit(EngineEvent::CrashLoop {
                consecutive_crashes: fault.consecutive_crashes,
                backoff_ms: backoff.as_millis() as u64,
            });
        }
        let backlog = match self.refresh_backlog().await {
            Ok(backlog) => backlog,
            Err(err) => {
                tracing::warn!("read backlog: {err}");
                self.backlog
            }
        };
        self.pool.replace_after_fault(fault.backoff, backlog);
    }

    async fn handle_worker_event(&mut self, ev: WorkerEvent) {
        match ev {
            WorkerEvent::Message { worker_id, message } => match message {
                WorkerMessage::Progress {
                    job_id,
                    percent,
                    message,
                } => {
                    let Some(lease) = self.leases.get(&worker_id) else {
                        return;
                    };
                    if lease.job.job_id != job_id {
                        return;
                    }
                    if let Err(err) = self
                        .ctx
                        .jobs
                        .update_progress(&lease.job, percent, message.clone())
                        .await
                    {
                        tracing::warn!(job_id = %job_id, "record progress: {err}");
                    }
                    self.emit(EngineEvent::JobProgress {
                        job_id,
                        percent,
                        message,
                    });
                }
                WorkerMessage::Completed { job_id, result } => {
                    if let Some(lease) = self.take_lease(worker_id, &job_id) {
                        self.complete_job(lease, result).await;
                        self.pool.release(worker_id);
                    }
                }
                WorkerMessage::Failed { job_id, error } => {
                    if let Some(lease) = self.take_lease(worker_id, &job_id) {
                        self.fail_job(lease, error).await;
                        self.pool.release(worker_id);
                    }
                }
            },
            WorkerEvent::Error { worker_id, error } => {
                self.handle_worker_fault(worker_id, error).await;
            }
            WorkerEvent::Exit {
                worker_id, code: 0, ..
            } if !self.leases.contains_key(&worker_id) => {
                self.pool.record_clean_exit(worker_id);
            }
            WorkerEvent::Exit {
                worker_id,
                code,
                reason,
            } => {
                let reason = match reason {
                    Some(reason) => format!("exited with code {code}: {reason}"),
                    None => format!("exited with code {code}"),
                };
                self.handle_worker_fault(worker_id, reason).await;
            }
        }
        self.push_snapshot();
    }

    fn abort_in_flight(&mut self) {
        for (worker_id, lease) in self.leases.drain() {
            tracing::warn!(worker_id, job_id = %lease.job.job_id, "job interrupted by immediate stop");
            let _ = self.ctx.event_tx.send(EngineEvent::JobInterrupted {
                job_id: lease.job.job_id,
            });
        }
        self.pool.terminate_all();
    }

    async fn run(mut self) -> anyhow::Result<()> {
        tracing::info!(
            queue_type = %self.ctx.keys.queue_type,
            min_workers = self.cfg().min_workers,
            max_concurrent_jobs = self.cfg().max_concurrent_jobs,
            "engine started"
        );
        self.emit(EngineEvent::Started);
        self.pool.ensure_min();
        self.push_snapshot();

        loop {
            if self.inner.should_abort() {
                self.abort_in_flight();
                break;
            }
            if self.inner.should_stop() && self.leases.is_empty() {
                break;
            }

            let mut leased = 0;
            if !self.inner.should_stop() {
                match self.dispatch_round().await {
                    Ok(n) => leased = n,
                    Err(err) => {
                        let message = format!("dispatch round failed: {err}");
                        tracing::warn!("{message}");
                        self.emit(EngineEvent::Warning { message });
                    }
                }
            }
            self.push_snapshot();

            // Loop again right away while there may be more work for idle workers.
            let idle_wait = if leased > 0 && self.pool.idle_count() > 0 {
                Duration::ZERO
            } else {
                self.cfg().poll_interval
            };
            let deadline = self.pool.next_deadline();

            tokio::select! {
                _ = self.inner.notify.notified() => {}
                ev = self.events_rx.recv() => {
                    if let Some(ev) = ev {
                        self.handle_worker_event(ev).await;
                    }
                }
                _ = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {}
                _ = tokio::time::sleep(idle_wait) => {}
            }

            self.pool.fire_due_timers(Instant::now(), self.backlog);
        }

        self.pool.stop_all();
        tracing::info!(queue_type = %self.ctx.keys.queue_type, "engine stopped");
        self.emit(EngineEvent::Stopped);
        self.push_snapshot();
        Ok(())
    }
}

pub(crate) fn start_engine(config: EngineConfig, deps: EngineDeps) -> EngineHandle {
    let cfg = config.normalized();
    let (event_tx, _) = broadcast::channel::<EngineEvent>(1024);
    let (snapshot_tx, snapshot_rx) = watch::channel(StatusSnapshot::default());

    let inner = Arc::new(EngineInner::new(event_tx.clone(), snapshot_rx));

    let ctx = Arc::new(EngineContext::from_deps(cfg, &deps, event_tx));
    let client = JobClient::from_context(ctx.clone());
    let join = tokio::spawn(run_engine(
        inner.clone(),
        ctx,
        deps.runner.clone(),
        snapshot_tx,
    ));
    EngineHandle {
        inner,
        client,
        join,
    }
}

async fn run_engine(
    inner: Arc<EngineInner>,
    ctx: Arc<EngineContext>,
    runner: Arc<dyn JobRunner>,
    snapshot_tx: watch::Sender<StatusSnapshot>,
) -> anyhow::Result<()> {
    if ctx.cfg.recover_on_start {
        let recovery = RecoveryManager::new(ctx.clone());
        match recovery.recover_on_startup().await {
            Ok(Some(report)) => {
                tracing::info!(
                    drained = report.drained,
                    requeued = report.requeued,
                    scanned = report.scanned,
                    "startup recovery finished"
                );
                ctx.emit(EngineEvent::RecoveryFinished { report });
            }
            Ok(None) => ctx.emit(EngineEvent::RecoverySkipped),
            Err(err) => {
                // Never blocks startup; the next restart retries.
                let message = format!("startup recovery failed: {err}");
                tracing::warn!("{message}");
                ctx.emit(EngineEvent::Warning { message });
            }
        }
    }

    EngineRuntime::new(inner, ctx, runner, snapshot_tx).run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingTracker, FlakyStore, ScriptedRunner, test_config};
    use jobmill_core::{Payload, QueueKeys};
    use jobmill_store::{MemoryStore, QueueStore};

    const WAIT: Duration = Duration::from_secs(10);

    async fn wait_for(
        rx: &mut broadcast::Receiver<EngineEvent>,
        mut pred: impl FnMut(&EngineEvent) -> bool,
    ) -> EngineEvent {
        tokio::time::timeout(WAIT, async {
            loop {
                match rx.recv().await {
                    Ok(ev) if pred(&ev) => return ev,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for engine event")
    }

    fn jobs(queue: &str, scripts: &[&str]) -> Vec<Job> {
        scripts
            .iter()
            .map(|s| Job::new(queue, "team", Payload::from(*s)))
            .collect()
    }

    fn start(store: &Arc<MemoryStore>, cfg: EngineConfig) -> EngineHandle {
        start_engine(
            cfg,
            EngineDeps::new(store.clone(), Arc::new(ScriptedRunner::default())),
        )
    }

    #[tokio::test]
    async fn batch_runs_to_session_completion() {
        let store = MemoryStore::arc();
        let engine = start(&store, test_config("e2e"));
        let mut events = engine.subscribe();
        wait_for(&mut events, |ev| matches!(ev, EngineEvent::Started)).await;

        let batch = engine
            .add_jobs(jobs("e2e", &["ok", "progress", "ok"]))
            .await
            .unwrap();

        let ev = wait_for(&mut events, |ev| matches!(ev, EngineEvent::SessionCompleted { .. })).await;
        match ev {
            EngineEvent::SessionCompleted {
                session_id,
                total_jobs,
                started_at,
                completed_at,
            } => {
                assert_eq!(session_id, batch.session_id);
                assert_eq!(total_jobs, 3);
                assert!(completed_at >= started_at);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        for job_id in &batch.job_ids {
            let record = engine.get_job_status(job_id).await.unwrap().unwrap();
            assert_eq!(record.status, JobStatus::Completed);
            assert_eq!(record.progress, 100);
            assert!(record.completed_at.is_some());
            assert!(record.result.is_some());
        }
        let keys = QueueKeys::new("e2e");
        assert_eq!(store.len(&keys.processing_key).await.unwrap(), 0);
        assert_eq!(store.len(&keys.queue_key).await.unwrap(), 0);

        engine.request_stop();
        engine.wait().await.unwrap();
    }

    #[tokio::test]
    async fn failures_follow_the_retry_budget() {
        let store = MemoryStore::arc();
        let engine = start(&store, test_config("retry"));
        let mut events = engine.subscribe();

        let flaky = Job::new("retry", "team", Payload::from("fail-once")).with_max_retries(2);
        let broken = Job::new("retry", "team", Payload::from("fail"));
        let (flaky_id, broken_id) = (flaky.job_id.clone(), broken.job_id.clone());
        engine.add_jobs(vec![flaky, broken]).await.unwrap();

        let retried = wait_for(&mut events, |ev| matches!(ev, EngineEvent::JobRetrying { .. })).await;
        assert!(matches!(
            retried,
            EngineEvent::JobRetrying { ref job_id, attempt: 1, max_attempts: 2, .. } if *job_id == flaky_id
        ));
        wait_for(&mut events, |ev| matches!(ev, EngineEvent::SessionCompleted { .. })).await;

        let flaky = engine.get_job_status(&flaky_id).await.unwrap().unwrap();
        assert_eq!(flaky.status, JobStatus::Completed);
        let broken = engine.get_job_status(&broken_id).await.unwrap().unwrap();
        assert_eq!(broken.status, JobStatus::Failed);
        assert_eq!(broken.error.as_deref(), Some("scripted failure"));

        engine.request_stop();
        engine.wait().await.unwrap();
    }

    #[tokio::test]
    async fn crashed_worker_fails_its_job_and_is_replaced() {
        let store = MemoryStore::arc();
        let engine = start(&store, test_config("crash"));
        let mut events = engine.subscribe();

        let crasher = Job::new("crash", "team", Payload::from("panic"));
        let crasher_id = crasher.job_id.clone();
        engine.add_jobs(vec![crasher]).await.unwrap();

        let failed = wait_for(&mut events, |ev| matches!(ev, EngineEvent::JobFailed { .. })).await;
        match failed {
            EngineEvent::JobFailed { job_id, error } => {
                assert_eq!(job_id, crasher_id);
                assert!(error.contains("crashed"), "{error}");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let batch = engine.add_jobs(jobs("crash", &["ok"])).await.unwrap();
        wait_for(&mut events, |ev| {
            matches!(ev, EngineEvent::JobCompleted { job_id, .. } if *job_id == batch.job_ids[0])
        })
        .await;
        assert!(engine.snapshot().pool_size >= 1);

        engine.request_stop();
        engine.wait().await.unwrap();
    }

    #[tokio::test]
    async fn two_engines_complete_a_shared_session_once() {
        let store = MemoryStore::arc();
        let a = start(&store, test_config("shared"));
        let b = start(&store, test_config("shared"));
        let mut a_events = a.subscribe();
        let mut b_events = b.subscribe();
        wait_for(&mut a_events, |ev| matches!(ev, EngineEvent::Started)).await;
        wait_for(&mut b_events, |ev| matches!(ev, EngineEvent::Started)).await;

        let scripts = vec!["slow:20"; 12];
        a.add_jobs(jobs("shared", &scripts)).await.unwrap();

        let mut completions = Vec::new();
        let mut sessions = 0;
        tokio::time::timeout(WAIT, async {
            while completions.len() < 12 {
                tokio::select! {
                    Ok(ev) = a_events.recv() => {
                        if let EngineEvent::JobCompleted { job_id, .. } = &ev { completions.push(job_id.clone()); }
                        if matches!(ev, EngineEvent::SessionCompleted { .. }) { sessions += 1; }
                    }
                    Ok(ev) = b_events.recv() => {
                        if let EngineEvent::JobCompleted { job_id, .. } = &ev { completions.push(job_id.clone()); }
                        if matches!(ev, EngineEvent::SessionCompleted { .. }) { sessions += 1; }
                    }
                }
            }
        })
        .await
        .expect("jobs did not complete");

        // Let any late session event arrive.
        tokio::time::sleep(Duration::from_millis(100)).await;
        while let Ok(ev) = a_events.try_recv() {
            if matches!(ev, EngineEvent::SessionCompleted { .. }) {
                sessions += 1;
            }
        }
        while let Ok(ev) = b_events.try_recv() {
            if matches!(ev, EngineEvent::SessionCompleted { .. }) {
                sessions += 1;
            }
        }

        completions.sort();
        completions.dedup();
        assert_eq!(completions.len(), 12);
        assert_eq!(sessions, 1);

        a.request_stop();
        b.request_stop();
        a.wait().await.unwrap();
        b.wait().await.unwrap();
    }

    #[tokio::test]
    async fn immediate_stop_leaves_jobs_for_the_next_startup() {
        let store = MemoryStore::arc();
        let keys = QueueKeys::new("restart");

        let first = start(&store, test_config("restart"));
        let mut events = first.subscribe();
        let batch = first
            .add_jobs(jobs("restart", &["slow:5000", "slow:5000", "ok"]))
            .await
            .unwrap();
        wait_for(&mut events, |ev| matches!(ev, EngineEvent::JobStarted { .. })).await;
        first.stop();
        wait_for(&mut events, |ev| matches!(ev, EngineEvent::JobInterrupted { .. })).await;
        first.wait().await.unwrap();

        assert!(store.len(&keys.processing_key).await.unwrap() >= 1);

        let mut cfg = test_config("restart");
        cfg.max_concurrent_jobs = 3;
        let second = start_engine(
            cfg,
            EngineDeps::new(store.clone(), Arc::new(FastRunner)),
        );
        let mut events = second.subscribe();
        let recovered = wait_for(&mut events, |ev| matches!(ev, EngineEvent::RecoveryFinished { .. })).await;
        match recovered {
            EngineEvent::RecoveryFinished { report } => assert!(report.drained >= 1),
            other => panic!("unexpected event: {other:?}"),
        }
        wait_for(&mut events, |ev| matches!(ev, EngineEvent::SessionCompleted { .. })).await;

        for job_id in &batch.job_ids {
            let record = second.get_job_status(job_id).await.unwrap().unwrap();
            assert_eq!(record.status, JobStatus::Completed, "{job_id}");
        }
        assert_eq!(store.len(&keys.processing_key).await.unwrap(), 0);

        second.request_stop();
        second.wait().await.unwrap();
    }

    /// Completes every job at once, whatever the payload says.
    struct FastRunner;

    #[async_trait::async_trait]
    impl JobRunner for FastRunner {
        async fn run(
            &self,
            job: &Job,
            _progress: &crate::runner::ProgressReporter,
        ) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::json!({ "job": job.job_id }))
        }
    }

    #[tokio::test]
    async fn finalize_is_idempotent() {
        let store = MemoryStore::arc();
        let engine = start(
            &store,
            EngineConfig {
                min_workers: 0,
                ..test_config("idem")
            },
        );
        engine.request_stop();
        let ctx = engine.client().ctx.clone();
        engine.wait().await.unwrap();

        let mut events = ctx.event_tx.subscribe();
        let batch = JobClient::from_context(ctx.clone())
            .add_jobs(jobs("idem", &["ok", "ok"]))
            .await
            .unwrap();
        let record = ctx.jobs.get_job_status(&batch.job_ids[0]).await.unwrap().unwrap();
        let job = Job::from_raw(record.raw_job.as_deref().unwrap()).unwrap();

        let outcome = Outcome::Completed(serde_json::json!(1));
        assert!(ctx.finalize(&job, outcome.clone()).await.unwrap());
        assert!(!ctx.finalize(&job, outcome).await.unwrap());
        assert!(!ctx.finalize(&job, Outcome::Failed("late".into())).await.unwrap());

        let remaining = store
            .get(&ctx.keys.session_remaining_key(&batch.session_id))
            .await
            .unwrap();
        assert_eq!(remaining.as_deref(), Some("1"));

        let mut completed = 0;
        while let Ok(ev) = events.try_recv() {
            if matches!(ev, EngineEvent::JobCompleted { .. } | EngineEvent::JobFailed { .. }) {
                completed += 1;
            }
        }
        assert_eq!(completed, 1);
        let record = ctx.jobs.get_job_status(&job.job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
    }

    fn start_flaky(store: &Arc<FlakyStore>, cfg: EngineConfig) -> EngineHandle {
        start_engine(
            cfg,
            EngineDeps::new(store.clone(), Arc::new(ScriptedRunner::default())),
        )
    }

    /// Events up to the first `SessionCompleted`, plus anything that follows shortly after.
    async fn until_settled(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut seen = Vec::new();
        tokio::time::timeout(WAIT, async {
            loop {
                match rx.recv().await {
                    Ok(ev) => {
                        let done = matches!(ev, EngineEvent::SessionCompleted { .. });
                        seen.push(ev);
                        if done {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
                }
            }
        })
        .await
        .expect("session did not complete");

        tokio::time::sleep(Duration::from_millis(100)).await;
        while let Ok(ev) = rx.try_recv() {
            seen.push(ev);
        }
        seen
    }

    fn count(events: &[EngineEvent], pred: impl Fn(&EngineEvent) -> bool) -> usize {
        events.iter().filter(|&ev| pred(ev)).count()
    }

    #[tokio::test]
    async fn lost_terminal_status_write_is_redone_on_redelivery() {
        let memory = MemoryStore::arc();
        let store = FlakyStore::new(memory.clone());
        store.fail_once("compare_and_set_with_ttl", r#""status":"completed""#);
        let engine = start_flaky(&store, test_config("redo"));
        let mut events = engine.subscribe();

        let batch = engine.add_jobs(jobs("redo", &["ok"])).await.unwrap();
        let seen = until_settled(&mut events).await;
        assert_eq!(store.armed(), 0);

        assert_eq!(count(&seen, |ev| matches!(ev, EngineEvent::JobStarted { .. })), 2);
        assert_eq!(count(&seen, |ev| matches!(ev, EngineEvent::JobCompleted { .. })), 1);
        assert_eq!(count(&seen, |ev| matches!(ev, EngineEvent::SessionCompleted { .. })), 1);

        let record = engine.get_job_status(&batch.job_ids[0]).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        let keys = QueueKeys::new("redo");
        assert!(memory.list_items(&keys.queue_key).is_empty());
        assert!(memory.list_items(&keys.processing_key).is_empty());

        engine.request_stop();
        engine.wait().await.unwrap();
    }

    #[tokio::test]
    async fn failed_session_bookkeeping_finishes_without_rerunning_the_job() {
        let memory = MemoryStore::arc();
        let store = FlakyStore::new(memory.clone());
        store.fail_once("decrement_or_delete", "");
        let engine = start_flaky(&store, test_config("bookkeeping"));
        let mut events = engine.subscribe();

        let batch = engine
            .add_jobs(jobs("bookkeeping", &["ok"]))
            .await
            .unwrap();
        let seen = until_settled(&mut events).await;
        assert_eq!(store.armed(), 0);

        assert_eq!(count(&seen, |ev| matches!(ev, EngineEvent::JobStarted { .. })), 1);
        assert_eq!(count(&seen, |ev| matches!(ev, EngineEvent::JobCompleted { .. })), 1);
        assert_eq!(count(&seen, |ev| matches!(ev, EngineEvent::SessionCompleted { .. })), 1);

        let record = engine.get_job_status(&batch.job_ids[0]).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert!(record.result.is_some());
        let keys = QueueKeys::new("bookkeeping");
        assert!(memory.list_items(&keys.processing_key).is_empty());
        assert!(
            memory
                .get(&keys.session_remaining_key(&batch.session_id))
                .await
                .unwrap()
                .is_none()
        );

        engine.request_stop();
        engine.wait().await.unwrap();
    }

    #[tokio::test]
    async fn failed_retry_accounting_returns_the_attempt_to_pending() {
        let memory = MemoryStore::arc();
        let store = FlakyStore::new(memory.clone());
        store.fail_once("increment_with_ttl", ":retries:");
        let engine = start_flaky(&store, test_config("accounting"));
        let mut events = engine.subscribe();

        let broken = Job::new("accounting", "team", Payload::from("fail")).with_max_retries(1);
        let broken_id = broken.job_id.clone();
        engine.add_jobs(vec![broken]).await.unwrap();
        let seen = until_settled(&mut events).await;
        assert_eq!(store.armed(), 0);

        assert_eq!(count(&seen, |ev| matches!(ev, EngineEvent::JobStarted { .. })), 2);
        assert_eq!(count(&seen, |ev| matches!(ev, EngineEvent::JobRetrying { .. })), 0);
        assert_eq!(count(&seen, |ev| matches!(ev, EngineEvent::JobFailed { .. })), 1);

        let record = engine.get_job_status(&broken_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("scripted failure"));
        let keys = QueueKeys::new("accounting");
        assert!(memory.list_items(&keys.processing_key).is_empty());

        engine.request_stop();
        engine.wait().await.unwrap();
    }

    #[tokio::test]
    async fn tracker_errors_never_fail_jobs() {
        let store = MemoryStore::arc();
        let engine = start_engine(
            test_config("tracked"),
            EngineDeps::new(store.clone(), Arc::new(ScriptedRunner::default()))
                .with_tracker(Arc::new(FailingTracker)),
        );
        let mut events = engine.subscribe();

        let batch = engine
            .add_jobs(jobs("tracked", &["ok", "ok"]))
            .await
            .unwrap();
        let seen = until_settled(&mut events).await;

        assert_eq!(count(&seen, |ev| matches!(ev, EngineEvent::JobCompleted { .. })), 2);
        assert_eq!(count(&seen, |ev| matches!(ev, EngineEvent::JobFailed { .. })), 0);
        for job_id in &batch.job_ids {
            let record = engine.get_job_status(job_id).await.unwrap().unwrap();
            assert_eq!(record.status, JobStatus::Completed);
        }

        engine.request_stop();
        engine.wait().await.unwrap();
    }

    /// A runtime that is driven by hand instead of by its dispatch loop.
    fn runtime(store: Arc<MemoryStore>, cfg: EngineConfig) -> EngineRuntime {
        let (event_tx, _) = broadcast::channel(1024);
        let (snapshot_tx, snapshot_rx) = watch::channel(StatusSnapshot::default());
        let inner = Arc::new(EngineInner::new(event_tx.clone(), snapshot_rx));
        let deps = EngineDeps::new(store, Arc::new(ScriptedRunner::default()));
        let ctx = Arc::new(EngineContext::from_deps(cfg.normalized(), &deps, event_tx));
        EngineRuntime::new(inner, ctx, deps.runner.clone(), snapshot_tx)
    }

    #[tokio::test]
    async fn failed_worker_handoff_returns_the_job_to_pending() {
        let store = MemoryStore::arc();
        let mut rt = runtime(store.clone(), test_config("handoff"));
        let keys = rt.ctx.keys.clone();
        let batch = JobClient::from_context(rt.ctx.clone())
            .add_jobs(jobs("handoff", &["ok"]))
            .await
            .unwrap();
        let raw = store
            .lease(&keys.queue_key, &keys.processing_key, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        // No worker with this id exists.
        rt.assign(404, &raw).await.unwrap();

        assert_eq!(store.list_items(&keys.queue_key), vec![raw]);
        assert!(store.list_items(&keys.processing_key).is_empty());
        assert!(rt.leases.is_empty());
        let record = rt.ctx.jobs.get_job_status(&batch.job_ids[0]).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!(record.message.as_deref(), Some("worker handoff failed"));
    }

    #[tokio::test]
    async fn worker_exit_with_error_code_fails_its_job_and_is_replaced() {
        let store = MemoryStore::arc();
        let mut rt = runtime(store.clone(), test_config("exit"));
        let keys = rt.ctx.keys.clone();
        let mut events = rt.ctx.event_tx.subscribe();
        let batch = JobClient::from_context(rt.ctx.clone())
            .add_jobs(jobs("exit", &["slow:5000"]))
            .await
            .unwrap();

        rt.pool.ensure_min();
        let worker_id = rt.pool.idle_ids()[0];
        let raw = store
            .lease(&keys.queue_key, &keys.processing_key, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        rt.assign(worker_id, &raw).await.unwrap();
        assert!(rt.leases.contains_key(&worker_id));

        rt.handle_worker_event(WorkerEvent::Exit {
            worker_id,
            code: 1,
            reason: Some("engine event channel closed".to_string()),
        })
        .await;

        let failed = wait_for(&mut events, |ev| matches!(ev, EngineEvent::JobFailed { .. })).await;
        match failed {
            EngineEvent::JobFailed { job_id, error } => {
                assert_eq!(job_id, batch.job_ids[0]);
                assert!(error.contains("crashed"), "{error}");
                assert!(error.contains("exited with code 1: engine event channel closed"), "{error}");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        let record = rt.ctx.jobs.get_job_status(&batch.job_ids[0]).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert!(store.list_items(&keys.processing_key).is_empty());
        assert!(rt.leases.is_empty());

        assert_eq!(rt.pool.crash_tracker().consecutive(), 1);
        assert_eq!(rt.pool.len(), 1);
        assert!(!rt.pool.idle_ids().contains(&worker_id));
        rt.pool.terminate_all();
    }
}
