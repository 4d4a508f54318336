//! Configuration validation with range checks.

use crate::error::ConfigError;

use super::Config;

impl Config {
    /// Validate configuration values are within acceptable ranges.
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.processing.parallel_workers == 0 {
            return Err(ConfigError::ValidationError(
                "processing.parallel_workers must be > 0".into(),
            ));
        }
        if self.pipeline.buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "pipeline.buffer_size must be > 0".into(),
            ));
        }
        if !(1..=100).contains(&self.compression.quality) {
            return Err(ConfigError::ValidationError(
                "compression.quality must be between 1 and 100".into(),
            ));
        }
        if self.compression.max_width == 0 || self.compression.max_height == 0 {
            return Err(ConfigError::ValidationError(
                "compression.max_width and compression.max_height must be > 0".into(),
            ));
        }
        if self.retry.max_retries == 0 {
            return Err(ConfigError::ValidationError(
                "retry.max_retries must be > 0".into(),
            ));
        }
        if self.queue.batch_size == 0 || self.queue.batch_size > u16::MAX as usize {
            return Err(ConfigError::ValidationError(format!(
                "queue.batch_size must be between 1 and {}",
                u16::MAX
            )));
        }
        if self.queue.batch_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "queue.batch_timeout_ms must be > 0".into(),
            ));
        }
        if self.queue.name.is_empty() || self.queue.dead_letter_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "queue.name and queue.dead_letter_name must not be empty".into(),
            ));
        }
        if self.queue.name == self.queue.dead_letter_name {
            return Err(ConfigError::ValidationError(
                "queue.dead_letter_name must differ from queue.name".into(),
            ));
        }
        if self.monitor.sample_interval_ms == 0 || self.monitor.sample_interval_ms >= 1000 {
            return Err(ConfigError::ValidationError(
                "monitor.sample_interval_ms must be between 1 and 999".into(),
            ));
        }
        if self.cleanup.interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "cleanup.interval_secs must be > 0".into(),
            ));
        }
        Ok(())
    }
}
