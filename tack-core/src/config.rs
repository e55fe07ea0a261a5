//! Configuration management.

use crate::error::{Result, TackError};
use crate::filter::IgnoreFilter;
use crate::mounter::MounterConfig;
use crate::mounts::MountSettings;
use crate::observability::ObservabilityConfig;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "TACK_CONFIG";

/// Persistent configuration for tack.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Watched root holding the disk images
    pub image_dir: PathBuf,
    /// Root under which mountpoints are created
    pub mount_dir: PathBuf,
    /// Catalog database location
    pub database: PathBuf,
    /// Only catalogue paths containing this substring
    pub path_contains: Option<String>,
    /// Directory names pruned from the walk
    pub skip_subdirectories: Vec<String>,
    /// Force-unmount and clean the mount root at startup
    pub clean_stale_mounts: bool,
    pub unmount_on_shutdown: bool,
    pub reconcile_interval_secs: u64,
    pub mounter: MounterConfig,
    pub log_level: String,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            image_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            mount_dir: paths::mount_dir(),
            database: paths::db_path(),
            path_contains: None,
            skip_subdirectories: Vec::new(),
            clean_stale_mounts: false,
            unmount_on_shutdown: true,
            reconcile_interval_secs: 3,
            mounter: MounterConfig::default(),
            log_level: "info".to_string(),
            metrics_port: None,
        }
    }
}

impl Config {
    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| paths::config_dir().join("config.json"))
    }

    /// Load configuration from disk, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path())?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load configuration from `path`, or defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| TackError::InvalidConfig {
            reason: format!("Failed to read config: {}", e),
        })?;
        serde_json::from_str(&content).map_err(|e| TackError::InvalidConfig {
            reason: format!("Failed to parse config: {}", e),
        })
    }

    /// Override file settings from `TACK_*` variables resolved by `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("TACK_IMAGE_DIR") {
            self.image_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("TACK_MOUNT_DIR") {
            self.mount_dir = PathBuf::from(dir);
        }
        if let Some(db) = lookup("TACK_DATABASE") {
            self.database = PathBuf::from(db);
        }
        if let Some(needle) = lookup("TACK_PATH_CONTAINS") {
            self.path_contains = Some(needle).filter(|s| !s.is_empty());
        }
    }

    /// Save configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| TackError::IoError { path: parent.to_path_buf(), source: e })?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| TackError::InvalidConfig {
            reason: format!("Failed to serialize config: {}", e),
        })?;
        std::fs::write(path, content)
            .map_err(|e| TackError::IoError { path: path.to_path_buf(), source: e })
    }

    /// Check the settings the daemon cannot run without.
    pub fn validate(&self) -> Result<()> {
        if !self.image_dir.is_dir() {
            return Err(TackError::InvalidConfig {
                reason: format!("image_dir {} is not a directory", self.image_dir.display()),
            });
        }
        if self.mount_dir.as_os_str().is_empty() {
            return Err(TackError::InvalidConfig { reason: "mount_dir must be set".to_string() });
        }
        if self.reconcile_interval_secs == 0 {
            return Err(TackError::InvalidConfig {
                reason: "reconcile_interval_secs must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn ignore_filter(&self) -> IgnoreFilter {
        IgnoreFilter::new(self.path_contains.clone())
    }

    pub fn mount_settings(&self) -> MountSettings {
        MountSettings { mount_dir: self.mount_dir.clone() }
    }

    pub fn observability(&self) -> ObservabilityConfig {
        ObservabilityConfig { log_level: self.log_level.clone(), metrics_port: self.metrics_port }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.unmount_on_shutdown);
        assert!(!config.clean_stale_mounts);
        assert_eq!(config.reconcile_interval(), Duration::from_secs(3));
        assert_eq!(config.mounter.program, PathBuf::from("imount"));
        assert!(config.database.ends_with("tack.db"));
        assert!(config.mount_dir.ends_with("mounts"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"image_dir": "/srv/images", "skip_subdirectories": ["exports"],
                "mounter": {"program": "/opt/imount"}}"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.image_dir, PathBuf::from("/srv/images"));
        assert_eq!(config.skip_subdirectories, vec!["exports"]);
        assert_eq!(config.mounter.program, PathBuf::from("/opt/imount"));
        assert!(config.mounter.extra_args.is_empty());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.reconcile_interval_secs, 3);
    }

    #[test]
    fn test_malformed_file_is_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(Config::load_from(&path), Err(TackError::InvalidConfig { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("TACK_IMAGE_DIR", "/evidence"),
            ("TACK_DATABASE", "/tmp/catalog.db"),
            ("TACK_PATH_CONTAINS", "case-42"),
        ]);

        let mut config = Config::default();
        let mount_dir = config.mount_dir.clone();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.image_dir, PathBuf::from("/evidence"));
        assert_eq!(config.database, PathBuf::from("/tmp/catalog.db"));
        assert_eq!(config.path_contains.as_deref(), Some("case-42"));
        assert_eq!(config.mount_dir, mount_dir);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.json");

        let config = Config { metrics_port: Some(9464), ..Config::default() };
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.metrics_port, Some(9464));
        assert_eq!(loaded.image_dir, config.image_dir);
    }

    #[test]
    fn test_validate() {
        let dir = tempfile::tempdir().unwrap();
        let valid = Config { image_dir: dir.path().to_path_buf(), ..Config::default() };
        assert!(valid.validate().is_ok());

        let missing = Config { image_dir: dir.path().join("nope"), ..valid.clone() };
        assert!(missing.validate().is_err());

        let no_mount_dir = Config { mount_dir: PathBuf::new(), ..valid.clone() };
        assert!(no_mount_dir.validate().is_err());

        let zero_interval = Config { reconcile_interval_secs: 0, ..valid };
        assert!(zero_interval.validate().is_err());
    }
}
