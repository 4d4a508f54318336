//! Batching consumer for the compression work queue.

use std::collections::{HashMap, HashSet};
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::types::{CompressionMessage, CompressionReport, FileId};

use super::batch::collect_batch;
use super::{BatchHandler, Broker, Delivery, QueueOptions};

/// Settlement counts for one or more batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub received: usize,
    pub acked: usize,
    pub requeued: usize,
    /// Malformed payloads rejected without requeue
    pub discarded: usize,
}

impl AddAssign for BatchStats {
    fn add_assign(&mut self, other: Self) {
        self.received += other.received;
        self.acked += other.acked;
        self.requeued += other.requeued;
        self.discarded += other.discarded;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settle {
    Ack,
    Requeue,
    Discard,
}

/// Pulls deliveries in batches and settles them from the handler's outcomes.
pub struct BatchConsumer {
    broker: Arc<dyn Broker>,
    handler: Arc<dyn BatchHandler>,
    config: QueueConfig,
}

impl BatchConsumer {
    pub fn new(broker: Arc<dyn Broker>, handler: Arc<dyn BatchHandler>, config: QueueConfig) -> Self {
        Self {
            broker,
            handler,
            config,
        }
    }

    /// Declare the dead-letter queue, then the work queue routing to it.
    pub async fn declare(&self) -> Result<(), QueueError> {
        self.broker
            .declare_queue(&self.config.dead_letter_name, QueueOptions::default())
            .await?;
        self.broker
            .declare_queue(
                &self.config.name,
                QueueOptions {
                    delivery_limit: Some(self.config.delivery_limit),
                    dead_letter_queue: Some(self.config.dead_letter_name.clone()),
                },
            )
            .await
    }

    /// Consume until cancelled or the delivery stream closes.
    pub async fn run(&self, cancel: CancellationToken) -> Result<BatchStats, QueueError> {
        self.declare().await?;

        let prefetch = u16::try_from(self.config.batch_size).unwrap_or(u16::MAX);
        let timeout = Duration::from_millis(self.config.batch_timeout_ms);
        let mut stream = self.broker.consume(&self.config.name, prefetch).await?;
        let mut totals = BatchStats::default();

        tracing::info!(
            "Consuming {} (batch size {}, timeout {:?})",
            self.config.name,
            self.config.batch_size,
            timeout
        );

        loop {
            let batch = collect_batch(&mut stream, self.config.batch_size, timeout, &cancel).await;

            if batch.cancelled {
                for delivery in &batch.deliveries {
                    self.settle(delivery, Settle::Requeue).await;
                }
                totals.received += batch.len();
                totals.requeued += batch.len();
                tracing::info!(
                    "Consumer cancelled; returned {} uncollected message(s)",
                    batch.len()
                );
                break;
            }

            let closed = batch.closed;
            if !batch.is_empty() {
                totals += self.process_batch(batch.deliveries, &cancel).await;
            }
            if closed {
                tracing::warn!("Delivery stream for {} closed", self.config.name);
                break;
            }
        }

        tracing::info!(
            "Consumer stopped: {} received, {} acked, {} requeued, {} discarded",
            totals.received,
            totals.acked,
            totals.requeued,
            totals.discarded
        );
        Ok(totals)
    }

    /// Parse, hand off, and settle one batch.
    pub async fn process_batch(&self, deliveries: Vec<Delivery>, cancel: &CancellationToken) -> BatchStats {
        let mut stats = BatchStats {
            received: deliveries.len(),
            ..BatchStats::default()
        };

        let mut ids: Vec<FileId> = Vec::new();
        let mut by_id: HashMap<FileId, Vec<Delivery>> = HashMap::new();
        for delivery in deliveries {
            match CompressionMessage::parse(&delivery.body) {
                Ok(message) => {
                    let entry = by_id.entry(message.file_id).or_default();
                    if entry.is_empty() {
                        ids.push(message.file_id);
                    }
                    entry.push(delivery);
                }
                Err(e) => {
                    tracing::warn!(
                        "Discarding malformed message (tag {}): {}",
                        delivery.delivery_tag,
                        QueueError::from(e)
                    );
                    self.settle(&delivery, Settle::Discard).await;
                    stats.discarded += 1;
                }
            }
        }

        if ids.is_empty() {
            return stats;
        }

        let redelivered = by_id.values().flatten().filter(|d| d.redelivered).count();
        tracing::debug!(
            "Dispatching batch of {} file id(s), {} redelivered",
            ids.len(),
            redelivered
        );
        let decisions = match self.handler.handle(&ids, cancel).await {
            Ok(report) => match Self::decide(&ids, &report) {
                Ok(decisions) => decisions,
                Err(e) => {
                    tracing::error!("Requeueing whole batch: {}", e);
                    HashMap::new()
                }
            },
            Err(e) => {
                tracing::error!(
                    "Requeueing whole batch: {}",
                    QueueError::Handler(e.to_string())
                );
                HashMap::new()
            }
        };

        for id in &ids {
            let decision = decisions.get(id).copied().unwrap_or(Settle::Requeue);
            for delivery in by_id.get(id).into_iter().flatten() {
                self.settle(delivery, decision).await;
                match decision {
                    Settle::Ack => stats.acked += 1,
                    Settle::Requeue => stats.requeued += 1,
                    Settle::Discard => stats.discarded += 1,
                }
            }
        }

        stats
    }

    /// Map the handler's report onto per-id settlements.
    ///
    /// Successful and skipped ids are acked; failed and missing ids are
    /// requeued. Results that cannot be attributed to the submitted ids are
    /// a [`QueueError::ResultMismatch`].
    fn decide(
        ids: &[FileId],
        report: &CompressionReport,
    ) -> Result<HashMap<FileId, Settle>, QueueError> {
        let submitted: HashSet<FileId> = ids.iter().copied().collect();
        let mismatch = QueueError::ResultMismatch {
            submitted: ids.len(),
            returned: report.outcomes.len(),
        };

        if report.outcomes.len() > ids.len() {
            return Err(mismatch);
        }

        let mut decisions = HashMap::with_capacity(ids.len());
        for outcome in &report.outcomes {
            if !submitted.contains(&outcome.file_id) {
                return Err(mismatch);
            }
            let decision = if outcome.success {
                Settle::Ack
            } else {
                Settle::Requeue
            };
            if decisions.insert(outcome.file_id, decision).is_some() {
                return Err(mismatch);
            }
        }

        for id in &report.skipped {
            if submitted.contains(id) {
                decisions.entry(*id).or_insert(Settle::Ack);
            }
        }

        let missing = ids.iter().filter(|id| !decisions.contains_key(id)).count();
        if missing > 0 {
            tracing::warn!("{} submitted id(s) had no result; requeueing them", missing);
        }
        Ok(decisions)
    }

    async fn settle(&self, delivery: &Delivery, decision: Settle) {
        let result = match decision {
            Settle::Ack => self.broker.ack(delivery).await,
            Settle::Requeue => self.broker.nack(delivery, true).await,
            Settle::Discard => self.broker.nack(delivery, false).await,
        };
        if let Err(e) = result {
            tracing::warn!(
                "Failed to settle delivery {} ({:?}): {}",
                delivery.delivery_tag,
                decision,
                e
            );
        }
    }
}
