//! Sub-configuration structs with their defaults.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Worker settings for a compression run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Transcode pool size; read and write pools get half (at least one)
    pub parallel_workers: usize,

    /// Use the three-stage pipeline; `false` selects the sequential loop
    pub concurrent: bool,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            parallel_workers: 4,
            concurrent: true,
        }
    }
}

impl ProcessingConfig {
    /// Number of read (and write) workers.
    pub fn io_workers(&self) -> usize {
        (self.parallel_workers / 2).max(1)
    }
}

/// Pipeline settings for backpressure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Max jobs buffered between pipeline stages
    pub buffer_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { buffer_size: 100 }
    }
}

/// Target codec for compressed output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Lossless WebP (quality is ignored)
    Webp,
    Jpeg,
    Avif,
}

impl OutputFormat {
    /// File extension for this codec, without the dot.
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Webp => "webp",
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Avif => "avif",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Webp => f.write_str("webp"),
            OutputFormat::Jpeg => f.write_str("jpeg"),
            OutputFormat::Avif => f.write_str("avif"),
        }
    }
}

/// Output codec and size limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Output codec
    pub format: OutputFormat,

    /// Encoder quality (1-100) for lossy codecs
    pub quality: u8,

    /// Maximum output width in pixels; larger sources are downsampled
    pub max_width: u32,

    /// Maximum output height in pixels
    pub max_height: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Webp,
            quality: 80,
            max_width: 1920,
            max_height: 1920,
        }
    }
}

/// Persistent retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Failed attempts after which a task is dead-lettered
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

/// Work queue and batching settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Primary work queue
    pub name: String,

    /// Queue receiving deliveries that exceeded the delivery limit
    pub dead_letter_name: String,

    /// Redeliveries allowed before the broker dead-letters a message
    pub delivery_limit: u32,

    /// Messages per batch; also the broker prefetch
    pub batch_size: usize,

    /// Idle time after the last received message before a partial batch is flushed
    pub batch_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "file_compression".to_string(),
            dead_letter_name: "file_compression_dlq".to_string(),
            delivery_limit: 5,
            batch_size: 10,
            batch_timeout_ms: 5000,
        }
    }
}

/// Resource monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Memory sampling interval in milliseconds (sub-second)
    pub sample_interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 100,
        }
    }
}

/// Local storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory all storage keys are resolved against
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("~/.pixpress/files"),
        }
    }
}

/// Database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("~/.pixpress/pixpress.db"),
        }
    }
}

/// Source cleanup sweeper settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Run the sweeper alongside the consumer
    pub enabled: bool,

    /// Seconds between sweeps
    pub interval_secs: u64,

    /// Max deletion rows handled per sweep
    pub batch_limit: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            batch_limit: 100,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,

    /// Log format: "pretty" or "json"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_workers_halves_with_floor_of_one() {
        let mut config = ProcessingConfig::default();
        assert_eq!(config.io_workers(), 2);
        config.parallel_workers = 1;
        assert_eq!(config.io_workers(), 1);
        config.parallel_workers = 7;
        assert_eq!(config.io_workers(), 3);
    }

    #[test]
    fn test_output_extensions() {
        assert_eq!(OutputFormat::Webp.extension(), "webp");
        assert_eq!(OutputFormat::Jpeg.extension(), "jpg");
        assert_eq!(OutputFormat::Avif.extension(), "avif");
    }

    #[test]
    fn test_output_format_parses_lowercase() {
        let config: CompressionConfig = toml::from_str("format = \"jpeg\"").unwrap();
        assert_eq!(config.format, OutputFormat::Jpeg);
        assert_eq!(config.quality, 80);
    }
}
