use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use jobmill_core::Job;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::worker::{WorkerEvent, WorkerMessage};

/// Business logic executed inside a worker.
///
/// Returning `Err` fails the job through the engine's retry policy. A panic is treated as a
/// worker crash: the worker is replaced and its job is failed.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Execute `job`, reporting progress through `progress`.
    async fn run(&self, job: &Job, progress: &ProgressReporter) -> anyhow::Result<serde_json::Value>;
}

/// Sends progress messages for one job back to the engine.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    pub(crate) worker_id: u64,
    pub(crate) job_id: String,
    pub(crate) tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl ProgressReporter {
    /// Report `percent` (clamped to 100) with an optional message.
    pub fn report(&self, percent: u8, message: Option<String>) {
        let _ = self.tx.send(WorkerEvent::Message {
            worker_id: self.worker_id,
            message: WorkerMessage::Progress {
                job_id: self.job_id.clone(),
                percent: percent.min(100),
                message,
            },
        });
    }

    /// Id of the job being reported on.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

/// Runs each job as an external command.
///
/// The payload is written to the child's stdin; `JOBMILL_JOB_ID`, `JOBMILL_QUEUE_TYPE` and
/// `JOBMILL_TEAM_ID` are set in its environment. Stdout lines of the form
/// `progress <percent> [message]` become progress reports; every other stdout line is part of
/// the result, which is parsed as JSON when possible and kept as a string otherwise.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
}

impl CommandRunner {
    /// Runner executing `program` with `args`.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

fn parse_progress_line(line: &str) -> Option<(u8, Option<String>)> {
    let rest = line.strip_prefix("progress ")?.trim();
    let (pct, message) = match rest.split_once(char::is_whitespace) {
        Some((pct, msg)) => (pct, Some(msg.trim().to_string())),
        None => (rest, None),
    };
    let pct: u8 = pct.trim_end_matches('%').parse().ok().filter(|p| *p <= 100)?;
    Some((pct, message.filter(|m| !m.is_empty())))
}

fn parse_result(lines: &[String]) -> serde_json::Value {
    let text = lines.join("\n");
    let text = text.trim();
    if text.is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| serde_json::Value::String(text.to_string()))
}

#[async_trait]
impl JobRunner for CommandRunner {
    async fn run(&self, job: &Job, progress: &ProgressReporter) -> anyhow::Result<serde_json::Value> {
        tracing::debug!(job_id = %job.job_id, program = %self.program, "spawning job command");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("JOBMILL_JOB_ID", &job.job_id)
            .env("JOBMILL_QUEUE_TYPE", &job.queue_type)
            .env("JOBMILL_TEAM_ID", &job.team_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn {}", self.program))?;

        let stdin_task = child.stdin.take().map(|mut stdin| {
            let payload = job.payload.as_bytes().to_vec();
            tokio::spawn(async move {
                // A child that never reads stdin closes the pipe early; that is not a failure.
                let _ = stdin.write_all(&payload).await;
                let _ = stdin.shutdown().await;
            })
        });

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("child stdout not captured"))?;
        let mut lines = BufReader::new(stdout).lines();
        let mut output = Vec::new();
        while let Some(line) = lines.next_line().await.context("read child stdout")? {
            match parse_progress_line(&line) {
                Some((pct, message)) => progress.report(pct, message),
                None => output.push(line),
            }
        }

        let status = child.wait().await.context("wait for child")?;
        if let Some(task) = stdin_task {
            let _ = task.await;
        }
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            let stderr = stderr.trim();
            if stderr.is_empty() {
                anyhow::bail!("{} exited with {status}", self.program);
            }
            anyhow::bail!("{} exited with {status}: {stderr}", self.program);
        }
        Ok(parse_result(&output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_lines_are_recognized() {
        assert_eq!(parse_progress_line("progress 40"), Some((40, None)));
        assert_eq!(
            parse_progress_line("progress 75% rendering frames"),
            Some((75, Some("rendering frames".to_string())))
        );
        assert_eq!(parse_progress_line("progress 250"), None);
        assert_eq!(parse_progress_line("progress abc"), None);
        assert_eq!(parse_progress_line("result 1"), None);
    }

    #[test]
    fn result_prefers_json() {
        assert_eq!(parse_result(&[]), serde_json::Value::Null);
        assert_eq!(
            parse_result(&["{\"ok\":".to_string(), "true}".to_string()]),
            serde_json::json!({"ok": true})
        );
        assert_eq!(
            parse_result(&["done".to_string()]),
            serde_json::Value::String("done".to_string())
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_runner_streams_progress_and_reads_stdin() {
        use jobmill_core::Payload;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let job = Job::new("shell", "team", Payload::from("hello"));
        let reporter = ProgressReporter {
            worker_id: 3,
            job_id: job.job_id.clone(),
            tx,
        };
        let runner = CommandRunner::new(
            "sh",
            vec![
                "-c".to_string(),
                "echo progress 50 half; cat; echo; echo $JOBMILL_QUEUE_TYPE".to_string(),
            ],
        );

        let result = runner.run(&job, &reporter).await.unwrap();
        assert_eq!(result, serde_json::Value::String("hello\nshell".to_string()));

        match rx.recv().await {
            Some(WorkerEvent::Message {
                worker_id: 3,
                message: WorkerMessage::Progress { percent: 50, message, .. },
            }) => assert_eq!(message.as_deref(), Some("half")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_runner_reports_non_zero_exit() {
        use jobmill_core::Payload;

        let (tx, _rx) = mpsc::unbounded_channel();
        let job = Job::new("shell", "team", Payload::default());
        let reporter = ProgressReporter {
            worker_id: 1,
            job_id: job.job_id.clone(),
            tx,
        };
        let runner = CommandRunner::new("sh", vec!["-c".to_string(), "echo boom >&2; exit 3".to_string()]);
        let err = runner.run(&job, &reporter).await.unwrap_err();
        assert!(format!("{err:#}").contains("boom"), "{err:#}");
    }
}
