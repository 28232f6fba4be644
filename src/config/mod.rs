mod file_config;

pub use file_config::{FileConfig, SchedulerFileConfig};

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Programmatic defaults that can be overridden by TOML config.
/// The embedding application fills these from its own argument handling.
#[derive(Debug, Clone)]
pub struct ConfigOverrides {
    pub node_id: Option<i64>,
    pub embedded_database: bool,
    pub db_dir: Option<PathBuf>,
    pub startup_grace_secs: u64,
    pub cluster_poll_interval_secs: u64,
}

impl Default for ConfigOverrides {
    fn default() -> Self {
        Self {
            node_id: None,
            embedded_database: false,
            db_dir: None,
            startup_grace_secs: 60,
            cluster_poll_interval_secs: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Identity of this node in the shared database. Cluster events are
    /// addressed to a node id, so two live nodes must never share one.
    pub node_id: i64,
    /// True when this process owns the database engine. Tasks flagged
    /// embedded-only are skipped on nodes pointing at an external server.
    pub embedded_database: bool,
    pub db_dir: PathBuf,
    /// Warm-up delay before the first tick after process start.
    pub startup_grace: Duration,
    /// Cadence of the cluster poll task row the scheduler seeds on start.
    pub cluster_poll_interval_secs: u64,
}

impl SchedulerConfig {
    /// Resolve configuration from programmatic defaults and optional TOML
    /// file config. TOML values override programmatic values where present.
    pub fn resolve(overrides: &ConfigOverrides, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let node_id = file
            .node_id
            .or(overrides.node_id)
            .ok_or_else(|| anyhow::anyhow!("node_id must be specified in config"))?;
        if node_id <= 0 {
            bail!("node_id must be positive, got {}", node_id);
        }

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| overrides.db_dir.clone())
            .ok_or_else(|| anyhow::anyhow!("db_dir must be specified in config"))?;
        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let embedded_database = file
            .embedded_database
            .unwrap_or(overrides.embedded_database);

        let startup_grace_secs = file
            .startup_grace_secs
            .unwrap_or(overrides.startup_grace_secs);

        let scheduler_file = file.scheduler.unwrap_or_default();
        let cluster_poll_interval_secs = scheduler_file
            .cluster_poll_interval_secs
            .unwrap_or(overrides.cluster_poll_interval_secs);
        if cluster_poll_interval_secs == 0 {
            bail!("cluster_poll_interval_secs must be at least 1");
        }

        Ok(Self {
            node_id,
            embedded_database,
            db_dir,
            startup_grace: Duration::from_secs(startup_grace_secs),
            cluster_poll_interval_secs,
        })
    }

    pub fn scheduler_db_path(&self) -> PathBuf {
        self.db_dir.join("scheduler.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_temp_db_dir() -> TempDir {
        TempDir::new().unwrap()
    }

    fn base_overrides(db_dir: &TempDir) -> ConfigOverrides {
        ConfigOverrides {
            node_id: Some(1),
            db_dir: Some(db_dir.path().to_path_buf()),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_overrides_only() {
        let temp_dir = make_temp_db_dir();
        let overrides = ConfigOverrides {
            node_id: Some(7),
            embedded_database: true,
            db_dir: Some(temp_dir.path().to_path_buf()),
            startup_grace_secs: 5,
            cluster_poll_interval_secs: 10,
        };

        let config = SchedulerConfig::resolve(&overrides, None).unwrap();

        assert_eq!(config.node_id, 7);
        assert!(config.embedded_database);
        assert_eq!(config.db_dir, temp_dir.path());
        assert_eq!(config.startup_grace, Duration::from_secs(5));
        assert_eq!(config.cluster_poll_interval_secs, 10);
    }

    #[test]
    fn test_resolve_toml_overrides_defaults() {
        let temp_dir = make_temp_db_dir();
        let overrides = ConfigOverrides {
            node_id: Some(1),
            embedded_database: false,
            db_dir: Some(PathBuf::from("/should/be/overridden")),
            ..Default::default()
        };
        let file_config = FileConfig {
            node_id: Some(3),
            embedded_database: Some(true),
            db_dir: Some(temp_dir.path().to_string_lossy().to_string()),
            startup_grace_secs: Some(0),
            scheduler: Some(SchedulerFileConfig {
                cluster_poll_interval_secs: Some(1),
            }),
        };

        let config = SchedulerConfig::resolve(&overrides, Some(file_config)).unwrap();

        assert_eq!(config.node_id, 3);
        assert!(config.embedded_database);
        assert_eq!(config.db_dir, temp_dir.path());
        assert_eq!(config.startup_grace, Duration::ZERO);
        assert_eq!(config.cluster_poll_interval_secs, 1);
    }

    #[test]
    fn test_resolve_missing_node_id_error() {
        let temp_dir = make_temp_db_dir();
        let overrides = ConfigOverrides {
            node_id: None,
            db_dir: Some(temp_dir.path().to_path_buf()),
            ..Default::default()
        };
        let result = SchedulerConfig::resolve(&overrides, None);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("node_id must be specified"));
    }

    #[test]
    fn test_resolve_non_positive_node_id_error() {
        let temp_dir = make_temp_db_dir();
        let mut overrides = base_overrides(&temp_dir);
        overrides.node_id = Some(0);
        assert!(SchedulerConfig::resolve(&overrides, None).is_err());
    }

    #[test]
    fn test_resolve_nonexistent_db_dir_error() {
        let overrides = ConfigOverrides {
            node_id: Some(1),
            db_dir: Some(PathBuf::from("/nonexistent/path/that/should/not/exist")),
            ..Default::default()
        };
        let result = SchedulerConfig::resolve(&overrides, None);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("does not exist"));
    }

    #[test]
    fn test_resolve_db_dir_not_directory_error() {
        let temp_file = tempfile::NamedTempFile::new().unwrap();
        let overrides = ConfigOverrides {
            node_id: Some(1),
            db_dir: Some(temp_file.path().to_path_buf()),
            ..Default::default()
        };
        let result = SchedulerConfig::resolve(&overrides, None);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("not a directory"));
    }

    #[test]
    fn test_resolve_zero_poll_interval_error() {
        let temp_dir = make_temp_db_dir();
        let mut overrides = base_overrides(&temp_dir);
        overrides.cluster_poll_interval_secs = 0;
        assert!(SchedulerConfig::resolve(&overrides, None).is_err());
    }

    #[test]
    fn test_db_path_helper() {
        let temp_dir = make_temp_db_dir();
        let config = SchedulerConfig::resolve(&base_overrides(&temp_dir), None).unwrap();
        assert_eq!(
            config.scheduler_db_path(),
            temp_dir.path().join("scheduler.db")
        );
    }

    #[test]
    fn test_file_config_parses_toml() {
        let toml_str = r#"
            node_id = 4
            embedded_database = true
            db_dir = "/data"

            [scheduler]
            cluster_poll_interval_secs = 5
        "#;
        let file: FileConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(file.node_id, Some(4));
        assert_eq!(file.embedded_database, Some(true));
        assert_eq!(file.db_dir.as_deref(), Some("/data"));
        assert_eq!(
            file.scheduler.unwrap().cluster_poll_interval_secs,
            Some(5)
        );
    }
}
