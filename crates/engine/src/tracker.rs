use std::time::Duration;

use async_trait::async_trait;
use jobmill_core::{Job, JobStatus};
use reqwest::Url;
use serde::Serialize;

/// Per-tenant job accounting.
///
/// Failures here are logged by the engine and never block job processing.
#[async_trait]
pub trait JobTracker: Send + Sync {
    /// A job was accepted into the queue.
    async fn track_increment(&self, job: &Job) -> anyhow::Result<()>;

    /// A job reached a terminal status.
    async fn track_completion(&self, job: &Job, status: JobStatus) -> anyhow::Result<()>;
}

/// Tracker that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracker;

#[async_trait]
impl JobTracker for NoopTracker {
    async fn track_increment(&self, _job: &Job) -> anyhow::Result<()> {
        Ok(())
    }

    async fn track_completion(&self, _job: &Job, _status: JobStatus) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TrackRequest<'a> {
    job_id: &'a str,
    queue_type: &'a str,
    team_id: &'a str,
    owner_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<JobStatus>,
}

impl<'a> TrackRequest<'a> {
    fn new(job: &'a Job, status: Option<JobStatus>) -> Self {
        Self {
            job_id: &job.job_id,
            queue_type: &job.queue_type,
            team_id: &job.team_id,
            owner_id: job.owner(),
            status,
        }
    }
}

/// Tracker that reports to an HTTP accounting service.
#[derive(Debug, Clone)]
pub struct HttpTracker {
    http: reqwest::Client,
    base: Url,
}

impl HttpTracker {
    /// Tracker posting to `base` (e.g. `https://accounting.internal/`).
    pub fn new(base: Url) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self { http, base })
    }

    async fn post(&self, path: &str, body: &TrackRequest<'_>) -> anyhow::Result<()> {
        let url = self.base.join(path)?;
        let res = self.http.post(url).json(body).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            anyhow::bail!("http {status}: {body}");
        }
        Ok(())
    }
}

#[async_trait]
impl JobTracker for HttpTracker {
    async fn track_increment(&self, job: &Job) -> anyhow::Result<()> {
        self.post("api/jobs/track/increment", &TrackRequest::new(job, None))
            .await
    }

    async fn track_completion(&self, job: &Job, status: JobStatus) -> anyhow::Result<()> {
        self.post(
            "api/jobs/track/completion",
            &TrackRequest::new(job, Some(status)),
        )
        .await
    }
}
