//! Batch files accepted by `run --jobs` and `submit --file`.
//!
//! A batch file is a JSON array of entries:
//!
//! ```json
//! [{ "teamId": "t1", "maxRetries": 3, "labels": { "kind": "thumb" }, "payload": { "src": "a.png" } }]
//! ```
//!
//! A string payload is handed to the worker as raw bytes, any other JSON value as its encoding.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context as _;
use serde::Deserialize;

use jobmill_core::{Job, Payload};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct JobEntry {
    #[serde(default)]
    job_id: Option<String>,
    #[serde(default)]
    team_id: Option<String>,
    #[serde(default)]
    owner_id: Option<String>,
    #[serde(default)]
    max_retries: Option<u32>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    payload: serde_json::Value,
}

fn payload_of(value: &serde_json::Value) -> anyhow::Result<Payload> {
    match value {
        serde_json::Value::Null => Ok(Payload::default()),
        serde_json::Value::String(s) => Ok(Payload::from(s.as_str())),
        other => Payload::from_json(other),
    }
}

pub fn parse_jobs(raw: &str, queue_type: &str, default_team: Option<&str>) -> anyhow::Result<Vec<Job>> {
    let entries: Vec<JobEntry> = serde_json::from_str(raw).context("batch file must be a JSON array of jobs")?;
    if entries.is_empty() {
        anyhow::bail!("batch file contains no jobs");
    }

    entries
        .into_iter()
        .enumerate()
        .map(|(idx, entry)| {
            let team = entry
                .team_id
                .or_else(|| default_team.map(str::to_string))
                .ok_or_else(|| anyhow::anyhow!("job #{idx} has no teamId (pass --team)"))?;
            let mut job = Job::new(queue_type, team, payload_of(&entry.payload)?);
            if let Some(id) = entry.job_id.filter(|id| !id.trim().is_empty()) {
                job.job_id = id;
            }
            job.owner_id = entry.owner_id;
            if let Some(n) = entry.max_retries {
                job = job.with_max_retries(n);
            }
            for (key, value) in entry.labels {
                job = job.with_label(key, value);
            }
            Ok(job)
        })
        .collect()
}

pub fn load_jobs(path: &Path, queue_type: &str, default_team: Option<&str>) -> anyhow::Result<Vec<Job>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_jobs(&raw, queue_type, default_team).with_context(|| format!("parse {}", path.display()))
}
