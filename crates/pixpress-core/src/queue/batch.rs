//! Size- and time-bounded batch collection.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{Delivery, DeliveryStream};

/// Deliveries gathered for one handler invocation.
#[derive(Debug, Default)]
pub struct Batch {
    pub deliveries: Vec<Delivery>,

    /// The delivery stream ended while collecting
    pub closed: bool,

    /// Collection stopped because of cancellation
    pub cancelled: bool,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deliveries.len()
    }
}

/// Collect up to `size` deliveries.
///
/// Waits for the first delivery without a deadline, then flushes once
/// `size` messages have arrived or `timeout` passes without a new one (the
/// timer restarts on every message). Cancellation or a closed stream return
/// whatever has accumulated so far.
pub async fn collect_batch(
    stream: &mut DeliveryStream,
    size: usize,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Batch {
    let size = size.max(1);
    let mut batch = Batch {
        deliveries: Vec::with_capacity(size),
        ..Batch::default()
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            batch.cancelled = true;
            return batch;
        }
        first = stream.recv() => match first {
            Some(delivery) => batch.deliveries.push(delivery),
            None => {
                batch.closed = true;
                return batch;
            }
        },
    }

    while batch.deliveries.len() < size {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                batch.cancelled = true;
                break;
            }
            next = stream.recv() => match next {
                Some(delivery) => batch.deliveries.push(delivery),
                None => {
                    batch.closed = true;
                    break;
                }
            },
            _ = tokio::time::sleep(timeout) => {
                tracing::trace!("Batch timeout with {}/{} messages", batch.len(), size);
                break;
            }
        }
    }

    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tokio::sync::mpsc;

    fn delivery(tag: u64) -> Delivery {
        Delivery {
            queue: "work".into(),
            delivery_tag: tag,
            body: Vec::new(),
            headers: BTreeMap::new(),
            redelivered: false,
        }
    }

    #[tokio::test]
    async fn test_flushes_at_size_cap() {
        let (tx, mut rx) = mpsc::channel(10);
        for tag in 1..=5 {
            tx.send(delivery(tag)).await.unwrap();
        }

        let batch = collect_batch(&mut rx, 3, Duration::from_secs(60), &CancellationToken::new()).await;
        let tags: Vec<u64> = batch.deliveries.iter().map(|d| d.delivery_tag).collect();
        assert_eq!(tags, vec![1, 2, 3]);
        assert!(!batch.closed && !batch.cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_partial_batch_after_timeout() {
        let (tx, mut rx) = mpsc::channel(10);
        tx.send(delivery(1)).await.unwrap();
        tx.send(delivery(2)).await.unwrap();

        let batch = collect_batch(&mut rx, 10, Duration::from_millis(200), &CancellationToken::new()).await;
        assert_eq!(batch.len(), 2);
        assert!(!batch.closed);
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_restarts_on_each_message() {
        let (tx, mut rx) = mpsc::channel(10);
        tokio::spawn(async move {
            for tag in 1..=3 {
                tx.send(delivery(tag)).await.unwrap();
                tokio::time::sleep(Duration::from_millis(150)).await;
            }
            // Keep the stream open past the final timeout
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        // Each gap (150ms) is shorter than the timeout (200ms)
        let batch = collect_batch(&mut rx, 10, Duration::from_millis(200), &CancellationToken::new()).await;
        assert_eq!(batch.len(), 3);
    }

    #[tokio::test]
    async fn test_closed_stream() {
        let (tx, mut rx) = mpsc::channel(10);
        tx.send(delivery(1)).await.unwrap();
        drop(tx);

        let batch = collect_batch(&mut rx, 10, Duration::from_secs(60), &CancellationToken::new()).await;
        assert_eq!(batch.len(), 1);
        assert!(batch.closed);

        let empty = collect_batch(&mut rx, 10, Duration::from_secs(60), &CancellationToken::new()).await;
        assert!(empty.is_empty() && empty.closed);
    }

    #[tokio::test]
    async fn test_cancel_returns_partial_batch() {
        let (tx, mut rx) = mpsc::channel(10);
        tx.send(delivery(1)).await.unwrap();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let batch = collect_batch(&mut rx, 10, Duration::from_secs(60), &cancel).await;
        assert_eq!(batch.len(), 1);
        assert!(batch.cancelled);
        drop(tx);
    }
}
