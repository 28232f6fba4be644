use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override programmatic defaults)
    pub node_id: Option<i64>,
    pub embedded_database: Option<bool>,
    pub db_dir: Option<String>,
    pub startup_grace_secs: Option<u64>,

    // Feature configs
    pub scheduler: Option<SchedulerFileConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SchedulerFileConfig {
    /// Interval of the cluster event poll task in seconds.
    pub cluster_poll_interval_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
