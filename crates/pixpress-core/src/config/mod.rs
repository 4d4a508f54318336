//! Configuration management for Pixpress.
//!
//! Configuration is loaded from the platform config directory with sensible
//! defaults. All config structs implement `Default`.

mod types;
mod validate;

pub use types::*;

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration structure for Pixpress.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker settings
    pub processing: ProcessingConfig,

    /// Pipeline settings
    pub pipeline: PipelineConfig,

    /// Output codec and size limits
    pub compression: CompressionConfig,

    /// Persistent retry settings
    pub retry: RetryConfig,

    /// Work queue and batching
    pub queue: QueueConfig,

    /// Resource monitor
    pub monitor: MonitorConfig,

    /// Local storage
    pub storage: StorageConfig,

    /// Task database
    pub database: DatabaseConfig,

    /// Source cleanup sweeper
    pub cleanup: CleanupConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Returns default configuration if the file doesn't exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default config file path.
    ///
    /// Uses platform-appropriate directories:
    /// - macOS: ~/Library/Application Support/com.pixpress.pixpress/config.toml
    /// - Linux: ~/.config/pixpress/config.toml
    /// - Windows: C:\Users\<User>\AppData\Roaming\pixpress\config\config.toml
    ///
    /// Falls back to ~/.pixpress/config.toml if directory detection fails.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("com", "pixpress", "pixpress")
            .map(|dirs| dirs.config_dir().to_path_buf().join("config.toml"))
            .unwrap_or_else(|| {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
                PathBuf::from(home).join(".pixpress").join("config.toml")
            })
    }

    /// Resolved storage root (with ~ expansion).
    pub fn storage_root(&self) -> PathBuf {
        expand(&self.storage.root)
    }

    /// Resolved database path (with ~ expansion).
    pub fn database_path(&self) -> PathBuf {
        expand(&self.database.path)
    }

    /// Serialize the config to a pretty TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ValidationError(e.to_string()))
    }
}

fn expand(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    let expanded = shellexpand::tilde(&path_str);
    PathBuf::from(expanded.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.processing.parallel_workers, 4);
        assert!(config.processing.concurrent);
        assert_eq!(config.pipeline.buffer_size, 100);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.queue.batch_size, 10);
    }

    #[test]
    fn test_config_to_toml() {
        let config = Config::default();
        let toml = config.to_toml().unwrap();
        assert!(toml.contains("[processing]"));
        assert!(toml.contains("[queue]"));
        assert!(toml.contains("[compression]"));
    }

    #[test]
    fn test_load_from_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[queue]\nbatch_size = 4\n\n[compression]\nformat = \"jpeg\"\nquality = 70\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.queue.batch_size, 4);
        assert_eq!(config.queue.name, "file_compression");
        assert_eq!(config.compression.format, OutputFormat::Jpeg);
        assert_eq!(config.compression.quality, 70);
    }

    #[test]
    fn test_load_from_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[queue]\nbatch_size = 0\n").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn test_tilde_expansion() {
        let mut config = Config::default();
        config.database.path = PathBuf::from("/var/lib/pixpress.db");
        assert_eq!(config.database_path(), PathBuf::from("/var/lib/pixpress.db"));

        config.storage.root = PathBuf::from("~/files");
        assert!(!config.storage_root().to_string_lossy().starts_with('~'));
    }
}
