//! In-process broker with quorum-queue style redelivery semantics.
//!
//! Messages are pushed to consumers up to their prefetch. A nack with
//! requeue bumps the message's delivery count; once the count exceeds the
//! queue's delivery limit, or on a nack without requeue, the message moves
//! to the configured dead-letter queue with `x-death` headers attached.
//! Unacked messages of a consumer whose stream was dropped go back to the
//! front of the queue on the next broker operation.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::error::QueueError;

use super::{
    Broker, Delivery, DeliveryStream, QueueOptions, DEATH_HEADER, DELIVERY_COUNT_HEADER,
    FIRST_DEATH_REASON_HEADER,
};

/// Per-queue counters, for inspection and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub published: u64,
    pub acked: u64,
    pub requeued: u64,
    pub rejected: u64,
    pub dead_lettered: u64,
}

#[derive(Debug, Clone)]
struct Message {
    body: Vec<u8>,
    headers: BTreeMap<String, Value>,
    delivery_count: u64,
}

struct ConsumerSlot {
    id: u64,
    prefetch: usize,
    in_flight: usize,
    tx: mpsc::Sender<Delivery>,
}

struct Unacked {
    consumer: u64,
    message: Message,
}

#[derive(Default)]
struct QueueState {
    options: QueueOptions,
    ready: VecDeque<Message>,
    unacked: HashMap<u64, Unacked>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
    stats: QueueStats,
}

#[derive(Default)]
struct Inner {
    queues: HashMap<String, QueueState>,
    next_tag: u64,
    next_consumer_id: u64,
}

/// Broker holding every queue in memory.
#[derive(Default)]
pub struct MemoryBroker {
    inner: Mutex<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, QueueError> {
        self.inner.lock().map_err(|_| QueueError::Closed)
    }

    /// Messages waiting to be delivered.
    pub fn ready_count(&self, queue: &str) -> Result<usize, QueueError> {
        let mut inner = self.lock()?;
        inner.reap_closed(queue);
        inner.queue(queue).map(|q| q.ready.len())
    }

    /// Messages delivered but not yet settled.
    pub fn unacked_count(&self, queue: &str) -> Result<usize, QueueError> {
        let mut inner = self.lock()?;
        inner.reap_closed(queue);
        inner.queue(queue).map(|q| q.unacked.len())
    }

    pub fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        self.lock()?.queue(queue).map(|q| q.stats)
    }
}

impl Inner {
    fn queue(&self, name: &str) -> Result<&QueueState, QueueError> {
        self.queues
            .get(name)
            .ok_or_else(|| QueueError::UnknownQueue(name.to_string()))
    }

    fn queue_mut(&mut self, name: &str) -> Result<&mut QueueState, QueueError> {
        self.queues
            .get_mut(name)
            .ok_or_else(|| QueueError::UnknownQueue(name.to_string()))
    }

    /// Drop consumers whose stream is gone and requeue what they held.
    fn reap_closed(&mut self, name: &str) {
        let Some(queue) = self.queues.get_mut(name) else {
            return;
        };

        let closed: Vec<u64> = queue
            .consumers
            .iter()
            .filter(|c| c.tx.is_closed())
            .map(|c| c.id)
            .collect();
        if closed.is_empty() {
            return;
        }

        queue.consumers.retain(|c| !c.tx.is_closed());
        let mut orphaned: Vec<(u64, Message)> = Vec::new();
        queue.unacked.retain(|tag, entry| {
            if closed.contains(&entry.consumer) {
                orphaned.push((*tag, entry.message.clone()));
                false
            } else {
                true
            }
        });

        // Oldest first back at the head of the queue
        orphaned.sort_by_key(|(tag, _)| *tag);
        for (_, message) in orphaned.into_iter().rev() {
            queue.ready.push_front(message);
        }
        tracing::debug!(
            "Queue {}: {} consumer(s) went away; unacked messages returned",
            name,
            closed.len()
        );
    }

    /// Push ready messages to consumers with free prefetch slots.
    fn dispatch(&mut self, name: &str) {
        self.reap_closed(name);
        let Some(queue) = self.queues.get_mut(name) else {
            return;
        };

        while !queue.ready.is_empty() {
            let count = queue.consumers.len();
            if count == 0 {
                break;
            }

            let start = queue.next_consumer % count;
            let Some(slot) = (0..count)
                .map(|offset| (start + offset) % count)
                .find(|&i| queue.consumers[i].in_flight < queue.consumers[i].prefetch)
            else {
                break;
            };
            queue.next_consumer = slot + 1;

            let Some(message) = queue.ready.pop_front() else {
                break;
            };
            self.next_tag += 1;
            let tag = self.next_tag;

            let consumer = &mut queue.consumers[slot];
            let delivery = Delivery {
                queue: name.to_string(),
                delivery_tag: tag,
                body: message.body.clone(),
                headers: message.headers.clone(),
                redelivered: message.delivery_count > 0,
            };

            match consumer.tx.try_send(delivery) {
                Ok(()) => {
                    consumer.in_flight += 1;
                    let id = consumer.id;
                    queue.unacked.insert(tag, Unacked { consumer: id, message });
                }
                Err(_) => {
                    // Stream closed between reap and send
                    queue.ready.push_front(message);
                    queue.consumers.remove(slot);
                }
            }
        }
    }

    fn settle(&mut self, delivery: &Delivery) -> Result<Message, QueueError> {
        let queue = self.queue_mut(&delivery.queue)?;
        let entry = queue
            .unacked
            .remove(&delivery.delivery_tag)
            .ok_or_else(|| QueueError::UnknownDelivery {
                queue: delivery.queue.clone(),
                tag: delivery.delivery_tag,
            })?;

        if let Some(consumer) = queue.consumers.iter_mut().find(|c| c.id == entry.consumer) {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }
        Ok(entry.message)
    }

    /// Route a message to `source`'s dead-letter queue, if it has one.
    fn dead_letter(&mut self, source: &str, mut message: Message, reason: &str) {
        let target = self
            .queues
            .get(source)
            .and_then(|q| q.options.dead_letter_queue.clone());

        let Some(target) = target.filter(|t| self.queues.contains_key(t)) else {
            tracing::warn!(
                "Queue {}: dropping message ({}) with no dead-letter queue",
                source,
                reason
            );
            return;
        };

        message
            .headers
            .entry(FIRST_DEATH_REASON_HEADER.to_string())
            .or_insert_with(|| json!(reason));
        message
            .headers
            .entry("x-first-death-queue".to_string())
            .or_insert_with(|| json!(source));

        let death = json!({ "queue": source, "reason": reason, "count": 1 });
        match message.headers.get_mut(DEATH_HEADER) {
            Some(Value::Array(deaths)) => deaths.insert(0, death),
            _ => {
                message
                    .headers
                    .insert(DEATH_HEADER.to_string(), Value::Array(vec![death]));
            }
        }

        if let Some(queue) = self.queues.get_mut(source) {
            queue.stats.dead_lettered += 1;
        }
        if let Some(queue) = self.queues.get_mut(&target) {
            queue.stats.published += 1;
            queue.ready.push_back(message);
        }
        self.dispatch(&target);
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), QueueError> {
        let mut inner = self.lock()?;
        let queue = inner.queues.entry(name.to_string()).or_default();
        if queue.options != options && queue.options != QueueOptions::default() {
            tracing::warn!("Queue {} redeclared with different options; keeping the original", name);
        } else {
            queue.options = options;
        }
        tracing::debug!("Declared queue {}", name);
        Ok(())
    }

    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<(), QueueError> {
        let mut inner = self.lock()?;
        let state = inner.queue_mut(queue)?;
        state.stats.published += 1;
        state.ready.push_back(Message {
            body,
            headers: BTreeMap::new(),
            delivery_count: 0,
        });
        inner.dispatch(queue);
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream, QueueError> {
        let prefetch = usize::from(prefetch.max(1));
        let (tx, rx) = mpsc::channel(prefetch);

        let mut inner = self.lock()?;
        inner.next_consumer_id += 1;
        let id = inner.next_consumer_id;
        inner.queue_mut(queue)?.consumers.push(ConsumerSlot {
            id,
            prefetch,
            in_flight: 0,
            tx,
        });
        inner.dispatch(queue);

        tracing::debug!("Consumer {} attached to {} (prefetch {})", id, queue, prefetch);
        Ok(rx)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut inner = self.lock()?;
        inner.settle(delivery)?;
        inner.queue_mut(&delivery.queue)?.stats.acked += 1;
        inner.dispatch(&delivery.queue);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        let mut inner = self.lock()?;
        let mut message = inner.settle(delivery)?;

        if !requeue {
            inner.queue_mut(&delivery.queue)?.stats.rejected += 1;
            inner.dead_letter(&delivery.queue, message, "rejected");
            inner.dispatch(&delivery.queue);
            return Ok(());
        }

        message.delivery_count += 1;
        message
            .headers
            .insert(DELIVERY_COUNT_HEADER.to_string(), json!(message.delivery_count));

        let queue = inner.queue_mut(&delivery.queue)?;
        queue.stats.requeued += 1;
        let exhausted = queue
            .options
            .delivery_limit
            .is_some_and(|limit| message.delivery_count > u64::from(limit));

        if exhausted {
            tracing::debug!(
                "Queue {}: message exceeded delivery limit after {} redeliveries",
                delivery.queue,
                message.delivery_count
            );
            inner.dead_letter(&delivery.queue, message, "delivery_limit");
        } else {
            queue.ready.push_back(message);
        }
        inner.dispatch(&delivery.queue);
        Ok(())
    }
}
