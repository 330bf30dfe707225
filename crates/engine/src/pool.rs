use std::sync::Arc;
use std::time::Duration;

use jobmill_core::Job;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{AbortHandle, JoinError};
use tokio::time::Instant;

use crate::api::{EngineConfig, EngineEvent, WorkerSnapshot};
use crate::runner::JobRunner;
use crate::worker::{WorkerCommand, WorkerEvent, run_worker_task};

pub(crate) type WorkerId = u64;

#[derive(Debug, Clone)]
pub(crate) struct PoolConfig {
    pub(crate) min_workers: usize,
    pub(crate) max_workers: usize,
    pub(crate) idle_ttl: Duration,
    pub(crate) max_consecutive_crashes: u32,
    pub(crate) crash_window: Duration,
    pub(crate) crash_backoff: Duration,
}

impl From<&EngineConfig> for PoolConfig {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            min_workers: cfg.min_workers,
            max_workers: cfg.max_concurrent_jobs,
            idle_ttl: cfg.idle_worker_ttl,
            max_consecutive_crashes: cfg.max_consecutive_crashes,
            crash_window: cfg.crash_window,
            crash_backoff: cfg.crash_backoff,
        }
    }
}

struct WorkerPoolItem {
    id: WorkerId,
    cmd_tx: mpsc::Sender<WorkerCommand>,
    abort: AbortHandle,
    is_idle: bool,
    job_count: u64,
    last_used: Instant,
    current_job_id: Option<String>,
    scale_down_at: Option<Instant>,
}

/// Rolling count of abnormal worker exits.
#[derive(Debug)]
pub(crate) struct CrashTracker {
    consecutive: u32,
    last_crash_at: Option<Instant>,
    in_crash_loop: bool,
    max_consecutive: u32,
    window: Duration,
    backoff: Duration,
}

impl CrashTracker {
    pub(crate) fn new(max_consecutive: u32, window: Duration, backoff: Duration) -> Self {
        Self {
            consecutive: 0,
            last_crash_at: None,
            in_crash_loop: false,
            max_consecutive,
            window,
            backoff,
        }
    }

    /// Record an abnormal exit. Returns the respawn delay when the pool is in crash-loop state.
    pub(crate) fn record_crash(&mut self, now: Instant) -> Option<Duration> {
        self.expire(now);
        self.consecutive = self.consecutive.saturating_add(1);
        self.last_crash_at = Some(now);
        if self.consecutive > self.max_consecutive {
            self.in_crash_loop = true;
            Some(self.backoff * self.consecutive.min(5))
        } else {
            None
        }
    }

    pub(crate) fn record_clean_exit(&mut self) {
        self.consecutive = 0;
        self.last_crash_at = None;
        self.in_crash_loop = false;
    }

    /// Reset once the window has passed without a new crash.
    pub(crate) fn expire(&mut self, now: Instant) {
        if let Some(last) = self.last_crash_at {
            if now.duration_since(last) > self.window {
                self.record_clean_exit();
            }
        }
    }

    pub(crate) fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub(crate) fn in_crash_loop(&self) -> bool {
        self.in_crash_loop
    }
}

/// Outcome of removing a faulted worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Fault {
    pub(crate) job_id: Option<String>,
    pub(crate) backoff: Option<Duration>,
    pub(crate) consecutive_crashes: u32,
}

/// Elastic set of worker tasks owned by one engine instance.
pub(crate) struct WorkerPool {
    cfg: PoolConfig,
    runner: Arc<dyn JobRunner>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    event_tx: broadcast::Sender<EngineEvent>,
    items: Vec<WorkerPoolItem>,
    next_id: WorkerId,
    crashes: CrashTracker,
    respawn_at: Vec<Instant>,
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".to_string()
    }
}

impl WorkerPool {
    pub(crate) fn new(
        cfg: PoolConfig,
        runner: Arc<dyn JobRunner>,
        events_tx: mpsc::UnboundedSender<WorkerEvent>,
        event_tx: broadcast::Sender<EngineEvent>,
    ) -> Self {
        let crashes = CrashTracker::new(
            cfg.max_consecutive_crashes,
            cfg.crash_window,
            cfg.crash_backoff,
        );
        Self {
            cfg,
            runner,
            events_tx,
            event_tx,
            items: Vec::new(),
            next_id: 1,
            crashes,
            respawn_at: Vec::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.items.iter().filter(|w| w.is_idle).count()
    }

    pub(crate) fn idle_ids(&self) -> Vec<WorkerId> {
        self.items
            .iter()
            .filter(|w| w.is_idle)
            .map(|w| w.id)
            .collect()
    }

    pub(crate) fn crash_tracker(&self) -> &CrashTracker {
        &self.crashes
    }

    fn spawn_worker(&mut self) -> WorkerId {
        let id = self.next_id;
        self.next_id += 1;

        let (cmd_tx, cmd_rx) = mpsc::channel::<WorkerCommand>(1);
        let task = tokio::spawn(run_worker_task(
            id,
            cmd_rx,
            self.events_tx.clone(),
            self.runner.clone(),
        ));
        let abort = task.abort_handle();

        // Translate the task's end into a lifecycle event.
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let event = match task.await {
                Ok(Ok(())) => Some(WorkerEvent::Exit {
                    worker_id: id,
                    code: 0,
                    reason: None,
                }),
                Ok(Err(err)) => Some(WorkerEvent::Exit {
                    worker_id: id,
                    code: 1,
                    reason: Some(format!("{err:#}")),
                }),
                Err(err) if err.is_cancelled() => None,
                Err(err) => Some(WorkerEvent::Error {
                    worker_id: id,
                    error: panic_message(err),
                }),
            };
            if let Some(event) = event {
                let _ = events_tx.send(event);
            }
        });

        let now = Instant::now();
        self.items.push(WorkerPoolItem {
            id,
            cmd_tx,
            abort,
            is_idle: true,
            job_count: 0,
            last_used: now,
            current_job_id: None,
            scale_down_at: Some(now + self.cfg.idle_ttl),
        });
        tracing::debug!(worker_id = id, pool_size = self.items.len(), "worker spawned");
        let _ = self.event_tx.send(EngineEvent::WorkerSpawned {
            worker_id: id,
            pool_size: self.items.len(),
        });
        id
    }

    /// Spawn up to `n` workers without exceeding the ceiling. Returns how many were spawned.
    ///
    /// Does nothing while a crash-loop respawn is pending.
    pub(crate) fn scale_up(&mut self, n: usize) -> usize {
        if self.crashes.in_crash_loop() && !self.respawn_at.is_empty() {
            return 0;
        }
        let room = self.cfg.max_workers.saturating_sub(self.items.len());
        let n = n.min(room);
        for _ in 0..n {
            self.spawn_worker();
        }
        n
    }

    pub(crate) fn ensure_min(&mut self) {
        let missing = self.cfg.min_workers.saturating_sub(self.items.len());
        self.scale_up(missing);
    }

    /// Hand `job` to an idle worker. Gives the job back when the handoff fails.
    pub(crate) fn assign(&mut self, worker_id: WorkerId, job: Box<Job>) -> Result<(), Box<Job>> {
        let Some(item) = self
            .items
            .iter_mut()
            .find(|w| w.id == worker_id && w.is_idle)
        else {
            return Err(job);
        };
        let Ok(permit) = item.cmd_tx.try_reserve() else {
            return Err(job);
        };
        item.is_idle = false;
        item.current_job_id = Some(job.job_id.clone());
        item.last_used = Instant::now();
        item.scale_down_at = None;
        permit.send(WorkerCommand::Run { job });
        Ok(())
    }

    /// Mark a worker idle after it reported an outcome and arm its scale-down timer.
    pub(crate) fn release(&mut self, worker_id: WorkerId) {
        let idle_ttl = self.cfg.idle_ttl;
        if let Some(item) = self.items.iter_mut().find(|w| w.id == worker_id) {
            let now = Instant::now();
            item.is_idle = true;
            item.current_job_id = None;
            item.job_count += 1;
            item.last_used = now;
            item.scale_down_at = Some(now + idle_ttl);
        }
    }

    /// Earliest pending scale-down or respawn.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.items
            .iter()
            .filter(|w| w.is_idle)
            .filter_map(|w| w.scale_down_at)
            .chain(self.respawn_at.iter().copied())
            .min()
    }

    /// Run every scale-down and delayed respawn that is due at `now`.
    pub(crate) fn fire_due_timers(&mut self, now: Instant, backlog: u64) {
        self.crashes.expire(now);

        let due_respawns = self.respawn_at.iter().filter(|at| **at <= now).count();
        self.respawn_at.retain(|at| *at > now);
        for _ in 0..due_respawns {
            if self.needs_replacement(backlog) && self.items.len() < self.cfg.max_workers {
                self.spawn_worker();
            }
        }

        let mut idx = 0;
        while idx < self.items.len() {
            let item = &self.items[idx];
            let due = item.is_idle && item.scale_down_at.is_some_and(|at| at <= now);
            if !due {
                idx += 1;
                continue;
            }
            if self.items.len() <= self.cfg.min_workers {
                // At the floor: keep it, but stop re-checking until it is used again.
                self.items[idx].scale_down_at = None;
                idx += 1;
                continue;
            }
            let item = self.items.remove(idx);
            let _ = item.cmd_tx.try_send(WorkerCommand::Stop);
            tracing::debug!(
                worker_id = item.id,
                job_count = item.job_count,
                idle_for_ms = now.duration_since(item.last_used).as_millis() as u64,
                "idle worker scaled down"
            );
            let _ = self.event_tx.send(EngineEvent::WorkerRemoved {
                worker_id: item.id,
                pool_size: self.items.len(),
                reason: "idle".to_string(),
            });
        }
    }

    fn needs_replacement(&self, backlog: u64) -> bool {
        self.items.len() < self.cfg.min_workers || backlog > 0
    }

    /// Remove a worker that died abnormally and count the crash.
    ///
    /// Returns `None` for workers no longer in the pool (already scaled down or terminated).
    pub(crate) fn take_fault(&mut self, worker_id: WorkerId, reason: &str) -> Option<Fault> {
        let pos = self.items.iter().position(|w| w.id == worker_id)?;
        let item = self.items.remove(pos);
        item.abort.abort();

        let backoff = self.crashes.record_crash(Instant::now());
        tracing::warn!(
            worker_id,
            consecutive_crashes = self.crashes.consecutive(),
            "worker died: {reason}"
        );
        let _ = self.event_tx.send(EngineEvent::WorkerRemoved {
            worker_id,
            pool_size: self.items.len(),
            reason: reason.to_string(),
        });
        Some(Fault {
            job_id: item.current_job_id,
            backoff,
            consecutive_crashes: self.crashes.consecutive(),
        })
    }

    /// Respawn after a fault, only when below the floor or work is waiting.
    pub(crate) fn replace_after_fault(&mut self, backoff: Option<Duration>, backlog: u64) {
        if !self.needs_replacement(backlog) {
            return;
        }
        match backoff {
            Some(delay) => self.respawn_at.push(Instant::now() + delay),
            None => {
                if self.items.len() < self.cfg.max_workers {
                    self.spawn_worker();
                }
            }
        }
    }

    pub(crate) fn record_clean_exit(&mut self, worker_id: WorkerId) {
        self.crashes.record_clean_exit();
        // A worker that returned on its own is gone even if it was still listed.
        if let Some(pos) = self.items.iter().position(|w| w.id == worker_id) {
            let item = self.items.remove(pos);
            let _ = self.event_tx.send(EngineEvent::WorkerRemoved {
                worker_id: item.id,
                pool_size: self.items.len(),
                reason: "exited".to_string(),
            });
        }
    }

    /// Ask every worker to finish and drop them from the pool.
    pub(crate) fn stop_all(&mut self) {
        for item in self.items.drain(..) {
            let _ = item.cmd_tx.try_send(WorkerCommand::Stop);
        }
        self.respawn_at.clear();
    }

    /// Abort every worker task immediately.
    pub(crate) fn terminate_all(&mut self) {
        for item in self.items.drain(..) {
            item.abort.abort();
        }
        self.respawn_at.clear();
    }

    pub(crate) fn snapshot(&self) -> Vec<WorkerSnapshot> {
        self.items
            .iter()
            .map(|w| WorkerSnapshot {
                worker_id: w.id,
                idle: w.is_idle,
                current_job_id: w.current_job_id.clone(),
                job_count: w.job_count,
            })
            .collect()
    }
}
