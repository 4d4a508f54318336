//! The `pixpress sweep` command: one source cleanup pass.

use pixpress_core::{Config, SourceSweeper};

use super::Services;

/// Execute the sweep command.
pub async fn execute(config: &Config) -> anyhow::Result<()> {
    let services = Services::open(config)?;
    let sweeper = SourceSweeper::new(services.store, services.storage, config.cleanup.clone());

    let stats = sweeper.sweep_once().await?;
    println!(
        "Deleted {} source file(s); {} left for the next sweep",
        stats.deleted, stats.failed
    );
    Ok(())
}
