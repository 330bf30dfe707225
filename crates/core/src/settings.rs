//! Operator settings persisted at `$XDG_CONFIG_HOME/jobmill/config.json`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Values the CLI falls back to when no flag or environment variable is given.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default)]
    pub queue_type: Option<String>,
    #[serde(default)]
    pub tracker_url: Option<String>,
    #[serde(default)]
    pub min_workers: Option<usize>,
    #[serde(default)]
    pub max_concurrent_jobs: Option<usize>,
    #[serde(default)]
    pub idle_worker_ttl_ms: Option<u64>,
}

fn normalize_opt(value: &mut Option<String>) {
    *value = value.as_ref().map(|s| s.trim().to_string());
    if matches!(value.as_deref(), Some(s) if s.is_empty()) {
        *value = None;
    }
}

impl EngineSettings {
    fn normalize(&mut self) {
        normalize_opt(&mut self.redis_url);
        normalize_opt(&mut self.queue_type);
        normalize_opt(&mut self.tracker_url);
        if self.max_concurrent_jobs == Some(0) {
            self.max_concurrent_jobs = None;
        }
    }
}

fn xdg_config_home() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("XDG_CONFIG_HOME is set but empty");
        }
        return Ok(dir);
    }

    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".config"))
}

pub fn settings_path() -> anyhow::Result<PathBuf> {
    Ok(xdg_config_home()?.join("jobmill").join("config.json"))
}

pub fn load_settings() -> anyhow::Result<Option<EngineSettings>> {
    load_settings_from(&settings_path()?)
}

pub fn save_settings(settings: &EngineSettings) -> anyhow::Result<()> {
    save_settings_to(&settings_path()?, settings)
}

pub fn load_settings_from(path: &Path) -> anyhow::Result<Option<EngineSettings>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    let mut settings: EngineSettings = serde_json::from_str(&raw)?;
    settings.normalize();
    Ok(Some(settings))
}

pub fn save_settings_to(path: &Path, settings: &EngineSettings) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid config path: {}", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let mut settings = settings.clone();
    settings.normalize();

    let json = serde_json::to_string_pretty(&settings)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}
