//! Audit drain for the broker's dead-letter queue.
//!
//! Dead-lettering is terminal: every message is logged and acknowledged,
//! never requeued or reprocessed.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::QueueError;
use crate::types::{CompressionMessage, FileId};

use super::{Broker, Delivery};

/// What the dead-letter consumer learned about one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetterEntry {
    /// `None` when the payload itself was unparseable
    pub file_id: Option<FileId>,
    pub reason: String,
    pub delivery_count: u64,
}

impl DeadLetterEntry {
    pub fn from_delivery(delivery: &Delivery) -> Self {
        Self {
            file_id: CompressionMessage::parse(&delivery.body)
                .ok()
                .map(|m| m.file_id),
            reason: delivery.death_reason(),
            delivery_count: delivery.delivery_count(),
        }
    }
}

/// Logs and acknowledges everything on the dead-letter queue.
pub struct DeadLetterConsumer {
    broker: Arc<dyn Broker>,
    queue: String,
    prefetch: u16,
}

impl DeadLetterConsumer {
    pub fn new(broker: Arc<dyn Broker>, queue: impl Into<String>) -> Self {
        Self {
            broker,
            queue: queue.into(),
            prefetch: 10,
        }
    }

    /// Log and acknowledge one dead-lettered delivery.
    pub async fn handle(&self, delivery: &Delivery) -> Result<DeadLetterEntry, QueueError> {
        let entry = DeadLetterEntry::from_delivery(delivery);
        match entry.file_id {
            Some(file_id) => tracing::warn!(
                "Dead-lettered file {} (reason: {}, deliveries: {})",
                file_id,
                entry.reason,
                entry.delivery_count
            ),
            None => tracing::warn!(
                "Dead-lettered unparseable message {:?} (reason: {}, deliveries: {})",
                String::from_utf8_lossy(&delivery.body),
                entry.reason,
                entry.delivery_count
            ),
        }

        self.broker.ack(delivery).await?;
        Ok(entry)
    }

    /// Drain the queue until cancelled or the stream closes; returns the
    /// number of messages handled.
    pub async fn run(&self, cancel: CancellationToken) -> Result<usize, QueueError> {
        let mut stream = self.broker.consume(&self.queue, self.prefetch).await?;
        let mut handled = 0usize;
        tracing::info!("Draining dead-letter queue {}", self.queue);

        loop {
            let delivery = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = stream.recv() => match next {
                    Some(delivery) => delivery,
                    None => {
                        tracing::warn!("Dead-letter stream for {} closed", self.queue);
                        break;
                    }
                },
            };

            match self.handle(&delivery).await {
                Ok(_) => handled += 1,
                Err(e) => tracing::error!(
                    "Failed to acknowledge dead letter {}: {}",
                    delivery.delivery_tag,
                    e
                ),
            }
        }

        tracing::info!("Dead-letter consumer stopped after {} message(s)", handled);
        Ok(handled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{MemoryBroker, QueueOptions};
    use std::time::Duration;

    async fn broker() -> Arc<MemoryBroker> {
        let broker = Arc::new(MemoryBroker::new());
        broker.declare_queue("dlq", QueueOptions::default()).await.unwrap();
        broker
            .declare_queue(
                "work",
                QueueOptions {
                    delivery_limit: Some(0),
                    dead_letter_queue: Some("dlq".into()),
                },
            )
            .await
            .unwrap();
        broker
    }

    #[tokio::test]
    async fn test_entry_defaults_without_metadata() {
        let broker = broker().await;
        broker.publish("dlq", br#"{"fileID":4}"#.to_vec()).await.unwrap();
        let mut stream = broker.consume("dlq", 1).await.unwrap();
        let delivery = stream.recv().await.unwrap();

        let consumer = DeadLetterConsumer::new(broker.clone(), "dlq");
        let entry = consumer.handle(&delivery).await.unwrap();
        assert_eq!(
            entry,
            DeadLetterEntry {
                file_id: Some(4),
                reason: "unknown".into(),
                delivery_count: 0,
            }
        );
        assert_eq!(broker.stats("dlq").unwrap().acked, 1);
    }

    #[tokio::test]
    async fn test_run_acks_exhausted_and_garbage_messages() {
        let broker = broker().await;
        broker.publish("work", br#"{"fileID":9}"#.to_vec()).await.unwrap();
        broker.publish("work", b"garbage".to_vec()).await.unwrap();

        // Exhaust one message and reject the other
        let mut work = broker.consume("work", 2).await.unwrap();
        let first = work.recv().await.unwrap();
        let second = work.recv().await.unwrap();
        broker.nack(&first, true).await.unwrap();
        broker.nack(&second, false).await.unwrap();

        let consumer = DeadLetterConsumer::new(broker.clone(), "dlq");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        assert_eq!(consumer.run(cancel).await.unwrap(), 2);
        assert_eq!(broker.ready_count("dlq").unwrap(), 0);
        assert_eq!(broker.unacked_count("dlq").unwrap(), 0);
        assert_eq!(broker.stats("dlq").unwrap().acked, 2);
    }

    #[test]
    fn test_entry_from_unparseable_payload() {
        let delivery = Delivery {
            queue: "dlq".into(),
            delivery_tag: 1,
            body: b"garbage".to_vec(),
            headers: Default::default(),
            redelivered: false,
        };
        assert_eq!(DeadLetterEntry::from_delivery(&delivery).file_id, None);
    }
}
