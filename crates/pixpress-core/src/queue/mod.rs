//! Work-queue plumbing: the broker seam, batching consumer, and dead-letter
//! drain.
//!
//! The transcode side never sees a [`Delivery`]. The [`BatchHandler`]
//! receives bare file ids and returns per-file outcomes; the consumer turns
//! those into acknowledgements.

mod batch;
mod consumer;
mod dead_letter;
mod memory;
mod publisher;

pub use batch::{collect_batch, Batch};
pub use consumer::{BatchConsumer, BatchStats};
pub use dead_letter::{DeadLetterConsumer, DeadLetterEntry};
pub use memory::{MemoryBroker, QueueStats};
pub use publisher::Publisher;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::QueueError;
use crate::types::{CompressionReport, FileId};

/// Header carrying the number of earlier failed deliveries.
pub const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";
/// Header carrying the reason a message was first dead-lettered.
pub const FIRST_DEATH_REASON_HEADER: &str = "x-first-death-reason";
/// Header carrying the dead-letter history.
pub const DEATH_HEADER: &str = "x-death";

/// Messages pushed to one consumer.
pub type DeliveryStream = mpsc::Receiver<Delivery>;

/// Queue declaration arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Redeliveries allowed before the message is dead-lettered
    pub delivery_limit: Option<u32>,

    /// Queue receiving rejected and exhausted messages
    pub dead_letter_queue: Option<String>,
}

/// One message handed to a consumer, awaiting ack or nack.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub headers: BTreeMap<String, Value>,
    pub redelivered: bool,
}

impl Delivery {
    /// Earlier failed deliveries of this message; 0 when the header is absent.
    pub fn delivery_count(&self) -> u64 {
        self.headers
            .get(DELIVERY_COUNT_HEADER)
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    /// Why the message was dead-lettered; "unknown" when not recorded.
    pub fn death_reason(&self) -> String {
        if let Some(reason) = self
            .headers
            .get(FIRST_DEATH_REASON_HEADER)
            .and_then(Value::as_str)
        {
            return reason.to_string();
        }

        self.headers
            .get(DEATH_HEADER)
            .and_then(Value::as_array)
            .and_then(|deaths| deaths.first())
            .and_then(|death| death.get("reason"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string()
    }
}

/// Broker client capability.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Create the queue if it does not exist yet.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), QueueError>;

    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<(), QueueError>;

    /// Start consuming; at most `prefetch` deliveries are unacked at once.
    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream, QueueError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError>;
}

/// Processes one batch of file ids.
///
/// An `Err` means the batch as a whole could not be handled (database or
/// transport failure); per-file failures belong in the report.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle(
        &self,
        ids: &[FileId],
        cancel: &CancellationToken,
    ) -> crate::Result<CompressionReport>;
}
