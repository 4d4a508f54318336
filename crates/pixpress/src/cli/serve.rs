//! The `pixpress serve` command: run the queue consumers until interrupted.

use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use pixpress_core::store::TaskStore;
use pixpress_core::{
    BatchConsumer, Compressor, Config, DeadLetterConsumer, MemoryBroker, Publisher, SourceSweeper,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::Services;

/// Arguments for the `serve` command.
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Seconds between scans that enqueue pending tasks (0 disables)
    #[arg(long, default_value = "30")]
    pub rescan_secs: u64,

    /// Do not run the source cleanup sweeper
    #[arg(long)]
    pub no_cleanup: bool,
}

/// Execute the serve command.
pub async fn execute(args: ServeArgs, config: Config) -> anyhow::Result<()> {
    let services = Services::open(&config)?;
    let store: Arc<dyn TaskStore> = services.store.clone();

    let stale = store.reset_processing()?;
    if stale > 0 {
        tracing::warn!("Returned {} task(s) stranded in processing to pending", stale);
    }

    let broker = Arc::new(MemoryBroker::new());
    let compressor = Arc::new(Compressor::new(&config, store.clone(), services.storage.clone()));
    let consumer = BatchConsumer::new(broker.clone(), compressor, config.queue.clone());
    consumer.declare().await?;

    let publisher = Publisher::new(broker.clone(), config.queue.name.clone());
    publisher.enqueue_pending(store.as_ref()).await?;

    let cancel = super::shutdown_token();
    let mut background = JoinSet::new();

    let dead_letters = DeadLetterConsumer::new(broker.clone(), config.queue.dead_letter_name.clone());
    let token = cancel.clone();
    background.spawn(async move {
        if let Err(e) = dead_letters.run(token).await {
            tracing::error!("Dead-letter consumer failed: {}", e);
        }
    });

    if config.cleanup.enabled && !args.no_cleanup {
        let sweeper = SourceSweeper::new(store.clone(), services.storage.clone(), config.cleanup.clone());
        let token = cancel.clone();
        background.spawn(async move { sweeper.run(token).await });
    }

    if args.rescan_secs > 0 {
        let token = cancel.clone();
        let store = store.clone();
        let period = Duration::from_secs(args.rescan_secs);
        background.spawn(async move { rescan(publisher, store, period, token).await });
    }

    let totals = consumer.run(cancel.clone()).await;
    cancel.cancel();
    while let Some(joined) = background.join_next().await {
        if let Err(e) = joined {
            tracing::error!("Background task terminated abnormally: {}", e);
        }
    }

    let totals = totals?;
    tracing::info!(
        "Served {} message(s): {} acked, {} requeued, {} discarded",
        totals.received,
        totals.acked,
        totals.requeued,
        totals.discarded
    );
    Ok(())
}

/// Periodically publish pending tasks, picking up uploads registered by
/// other processes. A duplicate for a task that is no longer pending is
/// skipped and acked by the consumer.
async fn rescan(
    publisher: Publisher,
    store: Arc<dyn TaskStore>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    // First tick is immediate; startup already enqueued everything
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = publisher.enqueue_pending(store.as_ref()).await {
                    tracing::warn!("Pending rescan failed: {}", e);
                }
            }
        }
    }
}
