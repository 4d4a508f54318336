use std::sync::Arc;

use crate::error::QueueError;
use crate::store::TaskStore;
use crate::types::{CompressionMessage, FileId, FileStatus};

use super::Broker;

/// Publishes compression requests onto the work queue.
pub struct Publisher {
    broker: Arc<dyn Broker>,
    queue: String,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>, queue: impl Into<String>) -> Self {
        Self {
            broker,
            queue: queue.into(),
        }
    }

    pub async fn publish(&self, file_id: FileId) -> Result<(), QueueError> {
        let body = CompressionMessage::new(file_id).to_bytes()?;
        self.broker.publish(&self.queue, body).await
    }

    /// Publish one message for every task currently `pending`.
    pub async fn enqueue_pending(&self, store: &dyn TaskStore) -> crate::Result<usize> {
        let ids = store.ids_with_status(FileStatus::Pending)?;
        for id in &ids {
            self.publish(*id).await?;
        }
        if !ids.is_empty() {
            tracing::info!("Enqueued {} pending file(s) on {}", ids.len(), self.queue);
        }
        Ok(ids.len())
    }
}
