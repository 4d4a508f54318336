//! Command implementations and the shared service wiring they use.

pub mod add;
pub mod compress;
pub mod config;
pub mod serve;
pub mod sweep;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use pixpress_core::{Config, LocalStorage, SqliteTaskStore};
use tokio_util::sync::CancellationToken;

/// Store and storage opened from the config.
pub struct Services {
    pub store: Arc<SqliteTaskStore>,
    pub storage: Arc<LocalStorage>,
}

impl Services {
    pub fn open(config: &Config) -> anyhow::Result<Self> {
        let db_path = config.database_path();
        let store = SqliteTaskStore::new(&db_path)
            .with_context(|| format!("Cannot open task database {}", db_path.display()))?;

        let root = config.storage_root();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Cannot create storage root {}", root.display()))?;

        tracing::debug!("Database: {}, storage: {}", db_path.display(), root.display());
        Ok(Self {
            store: Arc::new(store),
            storage: Arc::new(LocalStorage::new(root)),
        })
    }
}

/// Token cancelled on the first Ctrl-C.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Interrupt received, shutting down");
                trigger.cancel();
            }
            Err(e) => tracing::warn!("Cannot listen for Ctrl-C: {}", e),
        }
    });
    token
}

/// Expand a leading `~` in a user-supplied path.
pub fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())
}
