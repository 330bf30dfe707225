use std::sync::Arc;

use jobmill_core::Job;
use tokio::sync::mpsc;

use crate::pool::WorkerId;
use crate::runner::{JobRunner, ProgressReporter};

pub(crate) enum WorkerCommand {
    Run { job: Box<Job> },
    Stop,
}

/// Messages a worker sends about the job it is running.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum WorkerMessage {
    Progress {
        job_id: String,
        percent: u8,
        message: Option<String>,
    },
    Completed {
        job_id: String,
        result: serde_json::Value,
    },
    Failed {
        job_id: String,
        error: String,
    },
}

/// Lifecycle channel from workers to the engine. Every event carries the worker id.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum WorkerEvent {
    Message {
        worker_id: WorkerId,
        message: WorkerMessage,
    },
    /// The worker task died abnormally (panic).
    Error { worker_id: WorkerId, error: String },
    /// The worker task returned. `code` is 0 for a requested stop.
    Exit {
        worker_id: WorkerId,
        code: i32,
        reason: Option<String>,
    },
}

pub(crate) async fn run_worker_task(
    worker_id: WorkerId,
    mut rx: mpsc::Receiver<WorkerCommand>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    runner: Arc<dyn JobRunner>,
) -> anyhow::Result<()> {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WorkerCommand::Stop => return Ok(()),
            WorkerCommand::Run { job } => {
                let reporter = ProgressReporter {
                    worker_id,
                    job_id: job.job_id.clone(),
                    tx: events_tx.clone(),
                };
                tracing::debug!(worker_id, job_id = %job.job_id, "worker running job");

                let message = match runner.run(&job, &reporter).await {
                    Ok(result) => WorkerMessage::Completed {
                        job_id: job.job_id.clone(),
                        result,
                    },
                    Err(err) => WorkerMessage::Failed {
                        job_id: job.job_id.clone(),
                        error: format!("{err:#}"),
                    },
                };
                if events_tx.send(WorkerEvent::Message { worker_id, message }).is_err() {
                    anyhow::bail!("engine event channel closed");
                }
            }
        }
    }
    // Command channel closed without a stop request.
    Ok(())
}
