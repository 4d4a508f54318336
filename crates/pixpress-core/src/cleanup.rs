//! Deferred deletion of transcoded sources.
//!
//! Success only records a deletion obligation; this sweeper fulfils it
//! later, so a failed delete can never undo a committed transcode.

use std::io;
use std::sync::Arc;

use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CleanupConfig;
use crate::error::Result;
use crate::storage::Storage;
use crate::store::TaskStore;

/// Counts for one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub deleted: usize,
    pub failed: usize,
}

/// Periodically deletes source files recorded in `source_files_to_delete`.
pub struct SourceSweeper {
    store: Arc<dyn TaskStore>,
    storage: Arc<dyn Storage>,
    config: CleanupConfig,
}

impl SourceSweeper {
    pub fn new(store: Arc<dyn TaskStore>, storage: Arc<dyn Storage>, config: CleanupConfig) -> Self {
        Self {
            store,
            storage,
            config,
        }
    }

    /// Work through up to `batch_limit` outstanding deletions.
    ///
    /// An object that is already gone counts as deleted. A row whose delete
    /// fails stays for the next sweep.
    pub async fn sweep_once(&self) -> Result<SweepStats> {
        let pending = self.store.pending_source_deletions(self.config.batch_limit)?;
        let mut stats = SweepStats::default();

        for row in pending {
            match self.storage.delete(&row.source_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("Source {} already gone", row.source_path);
                }
                Err(e) => {
                    warn!(
                        "Could not delete source {} of file {}: {}",
                        row.source_path, row.file_id, e
                    );
                    stats.failed += 1;
                    continue;
                }
            }

            self.store.remove_source_deletion(row.id)?;
            stats.deleted += 1;
        }

        if stats.deleted > 0 || stats.failed > 0 {
            info!(
                "Source sweep: {} deleted, {} left for retry",
                stats.deleted, stats.failed
            );
        }
        Ok(stats)
    }

    /// Sweep on the configured interval until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval(Duration::from_secs(self.config.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Source sweeper started (interval: {}s, batch: {})",
            self.config.interval_secs, self.config.batch_limit
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Source sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!("Source sweep failed: {}", e);
                    }
                }
            }
        }
    }
}
