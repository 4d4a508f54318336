//! The `pixpress compress` command: one orchestrator pass over given ids.

use clap::Args;
use pixpress_core::{Compressor, Config, FileId};

use super::Services;

/// Arguments for the `compress` command.
#[derive(Args, Debug)]
pub struct CompressArgs {
    /// Task ids to compress
    #[arg(required = true)]
    pub ids: Vec<FileId>,

    /// Process one file at a time instead of the concurrent pipeline
    #[arg(long)]
    pub sequential: bool,

    /// Number of parallel workers (overrides config)
    #[arg(short, long)]
    pub parallel: Option<usize>,
}

/// Execute the compress command.
pub async fn execute(args: CompressArgs, mut config: Config) -> anyhow::Result<()> {
    if args.sequential {
        config.processing.concurrent = false;
    }
    if let Some(workers) = args.parallel {
        anyhow::ensure!(workers > 0, "--parallel must be at least 1");
        config.processing.parallel_workers = workers;
    }

    let services = Services::open(&config)?;
    let compressor = Compressor::new(&config, services.store, services.storage);
    let cancel = super::shutdown_token();

    let report = compressor.compress(&args.ids, &cancel).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.summary.failed > 0 {
        tracing::warn!("{} file(s) failed; see last_error in the task table", report.summary.failed);
    }
    Ok(())
}
