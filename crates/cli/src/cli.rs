use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use reqwest::Url;

use jobmill_core::JobStatus;
use jobmill_core::settings::EngineSettings;
use jobmill_engine::{EngineConfig, RetryPolicy};

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

fn parse_status_label(input: &str) -> Result<(JobStatus, String), String> {
    let (status, label) = input
        .split_once('=')
        .ok_or_else(|| format!("expected STATUS=LABEL, got {input:?}"))?;
    let status =
        JobStatus::parse(status).ok_or_else(|| format!("unknown job status {:?}", status.trim()))?;
    let label = label.trim();
    if label.is_empty() {
        return Err(format!("empty label for status {status}"));
    }
    Ok((status, label.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreKind {
    /// In-process store; state is lost when the process exits.
    Memory,
    /// Shared Redis store (default).
    Redis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RetryMode {
    /// Honour each job's `maxRetries` (default).
    PerJob,
    /// Every job gets exactly one attempt.
    Single,
}

impl From<RetryMode> for RetryPolicy {
    fn from(mode: RetryMode) -> Self {
        match mode {
            RetryMode::PerJob => RetryPolicy::PerJob,
            RetryMode::Single => RetryPolicy::SingleAttempt,
        }
    }
}

#[derive(Debug, Clone, Parser)]
#[command(name = "jobmill", version, about = "Distributed job engine")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Args)]
pub struct GlobalArgs {
    /// Redis connection URL. Falls back to the settings file, then `redis://127.0.0.1:6379`.
    #[arg(long, global = true, env = "JOBMILL_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Queue class to serve or submit to.
    #[arg(long, global = true, env = "JOBMILL_QUEUE")]
    pub queue: Option<String>,

    /// Base URL of the job usage tracking service.
    #[arg(long, global = true, env = "JOBMILL_TRACKER_URL")]
    pub tracker_url: Option<Url>,

    /// Display label for a status, e.g. `completed=Done`. Repeatable.
    #[arg(long = "status-label", global = true, value_name = "STATUS=LABEL", value_parser = parse_status_label)]
    pub status_labels: Vec<(JobStatus, String)>,
}

impl GlobalArgs {
    pub fn redis_url(&self, settings: &EngineSettings) -> String {
        self.redis_url
            .clone()
            .or_else(|| settings.redis_url.clone())
            .unwrap_or_else(|| DEFAULT_REDIS_URL.to_string())
    }

    pub fn queue(&self, settings: &EngineSettings) -> String {
        self.queue
            .clone()
            .or_else(|| settings.queue_type.clone())
            .unwrap_or_else(|| EngineConfig::DEFAULT_QUEUE_TYPE.to_string())
    }

    pub fn tracker_url(&self, settings: &EngineSettings) -> anyhow::Result<Option<Url>> {
        if let Some(url) = &self.tracker_url {
            return Ok(Some(url.clone()));
        }
        match settings.tracker_url.as_deref() {
            Some(raw) => Ok(Some(Url::parse(raw).map_err(|err| {
                anyhow::anyhow!("invalid tracker_url {raw:?} in settings file: {err}")
            })?)),
            None => Ok(None),
        }
    }

    /// Queue-level engine config shared by every subcommand.
    pub fn engine_config(&self, settings: &EngineSettings) -> EngineConfig {
        let mut cfg = EngineConfig::for_queue(self.queue(settings));
        cfg.status_labels.extend(self.status_labels.iter().cloned());
        cfg
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run an engine instance until Ctrl-C.
    Run(RunArgs),
    /// Enqueue a batch of jobs as one session and print the session id.
    Submit(SubmitArgs),
    /// Print the status record of a job.
    Status {
        job_id: String,
    },
    /// Manage the settings file.
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Worker program; receives the job payload on stdin and prints its result on stdout.
    #[arg(long, env = "JOBMILL_PROGRAM")]
    pub program: String,

    /// Argument passed to the worker program. Repeatable.
    #[arg(long = "arg", value_name = "ARG", allow_hyphen_values = true)]
    pub args: Vec<String>,

    #[arg(long, value_enum, default_value_t = StoreKind::Redis)]
    pub store: StoreKind,

    /// JSON file with a batch to enqueue once the engine is up.
    #[arg(long, value_name = "FILE")]
    pub jobs: Option<PathBuf>,

    /// Team assigned to entries of `--jobs` that do not name one.
    #[arg(long)]
    pub team: Option<String>,

    #[arg(long, env = "JOBMILL_MIN_WORKERS")]
    pub min_workers: Option<usize>,

    #[arg(long, env = "JOBMILL_MAX_WORKERS")]
    pub max_workers: Option<usize>,

    /// Idle time in milliseconds before a surplus worker is retired.
    #[arg(long = "idle-ttl-ms")]
    pub idle_ttl_ms: Option<u64>,

    #[arg(long, value_enum, default_value_t = RetryMode::PerJob)]
    pub retry: RetryMode,

    /// Skip startup recovery of abandoned jobs.
    #[arg(long, default_value_t = false)]
    pub no_recover: bool,
}

impl RunArgs {
    /// Apply pool and retry options on top of `cfg`: flags, then settings, then defaults.
    pub fn apply(&self, mut cfg: EngineConfig, settings: &EngineSettings) -> EngineConfig {
        if let Some(n) = self.min_workers.or(settings.min_workers) {
            cfg.min_workers = n;
        }
        if let Some(n) = self.max_workers.or(settings.max_concurrent_jobs) {
            cfg.max_concurrent_jobs = n;
        }
        if let Some(ms) = self.idle_ttl_ms.or(settings.idle_worker_ttl_ms) {
            cfg.idle_worker_ttl = std::time::Duration::from_millis(ms);
        }
        cfg.retry_policy = self.retry.into();
        cfg.recover_on_start = !self.no_recover;
        cfg.normalized()
    }
}

#[derive(Debug, Clone, Args)]
pub struct SubmitArgs {
    /// JSON array of jobs.
    #[arg(long, value_name = "FILE")]
    pub file: PathBuf,

    /// Team assigned to entries that do not name one.
    #[arg(long)]
    pub team: Option<String>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum ConfigCommand {
    /// Print the settings file path and contents.
    Show,
    /// Persist the Redis URL used when `--redis-url` is not given.
    SetRedisUrl { url: String },
}
