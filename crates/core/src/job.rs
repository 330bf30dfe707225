use std::collections::BTreeMap;
use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Lifecycle state of a job.
///
/// Transitions only move forward (`Queued -> Running -> Completed | Failed`), except for the
/// restart path, which moves an orphaned `Running` job to `Requeued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    /// Re-pushed onto the pending list by startup recovery.
    Requeued,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Canonical lowercase label, used when a queue class has no display mapping.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Requeued => "requeued",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "requeued" => Some(JobStatus::Requeued),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque caller-defined job input. Serialized as base64 inside the JSON envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload(pub Vec<u8>);

impl Payload {
    pub fn from_json(value: &serde_json::Value) -> anyhow::Result<Self> {
        Ok(Self(serde_json::to_vec(value)?))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self(text.as_bytes().to_vec())
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&B64.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        B64.decode(raw.as_bytes())
            .map(Payload)
            .map_err(serde::de::Error::custom)
    }
}

fn default_max_retries() -> u32 {
    1
}

/// One unit of work.
///
/// The engine only reads the envelope fields; `payload` is handed to the worker untouched and
/// `labels` are echoed into every status record written for the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    #[serde(default)]
    pub job_id: String,
    pub queue_type: String,
    pub team_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,

    #[serde(default = "default_status")]
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<u64>,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub payload: Payload,
}

fn default_status() -> JobStatus {
    JobStatus::Queued
}

impl Job {
    /// New queued job with an engine-generated (UUID v7, time ordered) id.
    pub fn new(queue_type: impl Into<String>, team_id: impl Into<String>, payload: Payload) -> Self {
        let now = Utc::now();
        Self {
            job_id: generate_job_id(),
            queue_type: queue_type.into(),
            team_id: team_id.into(),
            owner_id: None,
            status: JobStatus::Queued,
            session_id: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            start_time: None,
            worker_id: None,
            max_retries: default_max_retries(),
            progress: 0,
            message: None,
            error: None,
            labels: BTreeMap::new(),
            payload,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Fills in an id when the caller did not supply one.
    pub fn ensure_id(&mut self) {
        if self.job_id.trim().is_empty() {
            self.job_id = generate_job_id();
        }
    }

    /// Owner used for tenant accounting: the explicit owner, else the team.
    pub fn owner(&self) -> &str {
        self.owner_id.as_deref().unwrap_or(&self.team_id)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.team_id.trim().is_empty() {
            return Err(format!("job {:?} has no team id", self.job_id));
        }
        if self.queue_type.trim().is_empty() {
            return Err(format!("job {:?} has no queue type", self.job_id));
        }
        Ok(())
    }

    pub fn to_raw(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_raw(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

fn generate_job_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// Persisted status of one job, as written by the engine's status store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusRecord {
    pub job_id: String,
    pub status: JobStatus,
    pub queue_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<u64>,
    #[serde(default)]
    pub team_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Exact serialized item that sits (or sat) in the pending/processing lists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_job: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requeued_at: Option<DateTime<Utc>>,
}

impl JobStatusRecord {
    /// Fresh record seeded from the job envelope.
    pub fn for_job(job: &Job, status: JobStatus) -> Self {
        Self {
            job_id: job.job_id.clone(),
            status,
            queue_type: job.queue_type.clone(),
            timestamp: Utc::now(),
            progress: job.progress,
            message: job.message.clone(),
            error: job.error.clone(),
            result: None,
            session_id: job.session_id.clone(),
            worker_id: job.worker_id,
            team_id: job.team_id.clone(),
            owner_id: job.owner_id.clone(),
            start_time: job.start_time,
            completed_at: job.completed_at,
            labels: job.labels.clone(),
            raw_job: None,
            requeued_at: None,
        }
    }
}

/// Bookkeeping for a cohort of jobs submitted by one `add_jobs` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    pub total_jobs: u64,
    pub team_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    pub queue_type: String,
}
