//! Pixpress Core - queue-driven image compression.
//!
//! Pixpress converts uploaded images to a compact format in bounded batches
//! triggered by messages on a work queue. Per-file retry state lives in the
//! task table, so interrupted or failed work resumes with the next batch.
//!
//! # Architecture
//!
//! ```text
//! queue ─▶ BatchConsumer ─▶ Compressor ─▶ Read → Transcode → Write ─▶ RetryTracker
//!              ▲                                                        │
//!              └──────────────── ack / requeue / discard ◀──────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use pixpress_core::{Compressor, Config, LocalStorage, SqliteTaskStore};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> pixpress_core::Result<()> {
//!     let config = Config::load()?;
//!     let store = Arc::new(SqliteTaskStore::new(&config.database_path())?);
//!     let storage = Arc::new(LocalStorage::new(config.storage_root()));
//!     let compressor = Compressor::new(&config, store, storage);
//!
//!     let report = compressor.compress(&[1, 2, 3], &CancellationToken::new()).await?;
//!     println!("{} succeeded", report.summary.succeeded);
//!     Ok(())
//! }
//! ```

// Module declarations
pub mod cleanup;
pub mod compressor;
pub mod config;
pub mod error;
pub mod monitor;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod storage;
pub mod store;
pub mod types;

// Re-exports for convenient access
pub use cleanup::{SourceSweeper, SweepStats};
pub use compressor::Compressor;
pub use config::Config;
pub use error::{
    ConfigError, PipelineError, PipelineResult, PixpressError, QueueError, Result, StoreError,
};
pub use monitor::ResourceMonitor;
pub use queue::{BatchConsumer, Broker, DeadLetterConsumer, MemoryBroker, Publisher};
pub use retry::RetryTracker;
pub use storage::{LocalStorage, Storage};
pub use store::{SqliteTaskStore, TaskStore};
pub use types::{
    CompressionMessage, CompressionReport, CompressionSummary, FileId, FileStatus, FileTask,
    TaskOutcome,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
