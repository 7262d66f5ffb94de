use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::broker::{Broker, DeadLetter, DeliveryHandle, RawDelivery};
use crate::error::QueueError;
use crate::topology::Topology;

/// At-least-once publish/subscribe with per-message delayed redelivery.
///
/// Delays are implemented without a scheduler: the message sits in the
/// topic's holding queue with an expiry equal to the delay, and the broker
/// dead-letters it into the consumer queue once that expiry elapses.
/// Handlers must tolerate duplicates.
#[derive(Clone)]
pub struct DelayedQueue {
    broker: Arc<dyn Broker>,
    declared: Arc<Mutex<HashSet<String>>>,
}

impl DelayedQueue {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            declared: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    fn is_declared(&self, key: &str) -> bool {
        self.declared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }

    fn mark_declared(&self, key: &str) {
        self.declared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string());
    }

    /// Declares the full delayed topology for `topic` once per process.
    ///
    /// Publishers declare the dead-letter side too, so entries expiring before
    /// any consumer ever subscribed still land in the consumer queue.
    async fn ensure_delayed_topology(&self, topic: &str) -> Result<Topology, QueueError> {
        let topology = Topology::for_topic(topic);
        let key = format!("delayed:{topic}");
        if self.is_declared(&key) {
            return Ok(topology);
        }
        let dead_letter = DeadLetter {
            exchange: topology.dead_letter_exchange.clone(),
            routing_key: topology.dead_letter_routing_key.clone(),
        };
        self.broker
            .declare_exchange(&topology.holding_exchange)
            .await?;
        self.broker
            .declare_exchange(&topology.dead_letter_exchange)
            .await?;
        self.broker
            .declare_queue(&topology.holding_queue, Some(&dead_letter))
            .await?;
        self.broker
            .bind_queue(&topology.holding_queue, &topology.holding_exchange, "")
            .await?;
        self.broker
            .declare_queue(&topology.consumer_queue, None)
            .await?;
        self.broker
            .bind_queue(
                &topology.consumer_queue,
                &topology.dead_letter_exchange,
                &topology.dead_letter_routing_key,
            )
            .await?;
        self.mark_declared(&key);
        debug!("queue: declared delayed topology for {topic}");
        Ok(topology)
    }

    async fn ensure_plain_queue(&self, topic: &str) -> Result<(), QueueError> {
        let key = format!("plain:{topic}");
        if self.is_declared(&key) {
            return Ok(());
        }
        self.broker.declare_queue(topic, None).await?;
        self.mark_declared(&key);
        Ok(())
    }

    /// Publishes `payload` so that `subscribe_delayed(topic)` sees it no
    /// earlier than `delay` from now. A zero delay delivers as soon as the
    /// broker processes the expiry.
    pub async fn publish_delayed<T>(
        &self,
        topic: &str,
        payload: &T,
        delay: Duration,
    ) -> Result<(), QueueError>
    where
        T: Serialize + ?Sized,
    {
        let bytes = serde_json::to_vec(payload).map_err(QueueError::Encode)?;
        let topology = self.ensure_delayed_topology(topic).await?;
        debug!(
            "queue: publishing to {topic} with delay {}ms",
            delay.as_millis()
        );
        self.broker
            .publish("", &topology.holding_queue, bytes, Some(delay))
            .await
    }

    /// Publishes `payload` directly to the plain queue `topic`.
    pub async fn publish_now<T>(&self, topic: &str, payload: &T) -> Result<(), QueueError>
    where
        T: Serialize + ?Sized,
    {
        let bytes = serde_json::to_vec(payload).map_err(QueueError::Encode)?;
        self.ensure_plain_queue(topic).await?;
        self.broker.publish("", topic, bytes, None).await
    }

    /// Subscribes to the plain queue `topic`.
    pub async fn subscribe(&self, topic: &str, prefetch: u16) -> Result<Subscription, QueueError> {
        self.ensure_plain_queue(topic).await?;
        info!("queue: subscribing to {topic}");
        let rx = self.broker.consume(topic, prefetch).await?;
        Ok(Subscription::new(topic, rx, Arc::clone(&self.broker)))
    }

    /// Subscribes to the dead-lettered side of `topic`, so only messages whose
    /// delay has elapsed are ever delivered.
    pub async fn subscribe_delayed(
        &self,
        topic: &str,
        prefetch: u16,
    ) -> Result<Subscription, QueueError> {
        let topology = self.ensure_delayed_topology(topic).await?;
        info!("queue: subscribing to delayed {topic}");
        let rx = self
            .broker
            .consume(&topology.consumer_queue, prefetch)
            .await?;
        Ok(Subscription::new(topic, rx, Arc::clone(&self.broker)))
    }
}

/// Stream of deliveries for one subscribed topic.
pub struct Subscription {
    topic: String,
    rx: mpsc::Receiver<RawDelivery>,
    broker: Arc<dyn Broker>,
}

impl Subscription {
    fn new(topic: &str, rx: mpsc::Receiver<RawDelivery>, broker: Arc<dyn Broker>) -> Self {
        Self {
            topic: topic.to_string(),
            rx,
            broker,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Waits for the next delivery. `None` once the consumer is closed.
    pub async fn next(&mut self) -> Option<Delivery> {
        let raw = self.rx.recv().await?;
        Some(Delivery {
            topic: self.topic.clone(),
            raw,
            broker: Arc::clone(&self.broker),
        })
    }
}

/// One delivered message. Must be settled explicitly; dropping it leaves the
/// message owned by the broker.
pub struct Delivery {
    topic: String,
    raw: RawDelivery,
    broker: Arc<dyn Broker>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("topic", &self.topic)
            .field("handle", &self.raw.handle)
            .field("redelivered", &self.raw.redelivered)
            .finish()
    }
}

impl Delivery {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.raw.payload
    }

    pub fn handle(&self) -> &DeliveryHandle {
        &self.raw.handle
    }

    pub fn redelivered(&self) -> bool {
        self.raw.redelivered
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, QueueError> {
        serde_json::from_slice(&self.raw.payload).map_err(QueueError::Decode)
    }

    /// Settles the message as processed.
    pub async fn ack(&self) -> Result<(), QueueError> {
        self.broker.ack(&self.raw.handle).await
    }

    /// Returns the message to the head of its queue for immediate retry.
    pub async fn reject_and_requeue(&self) -> Result<(), QueueError> {
        self.broker.reject(&self.raw.handle, true).await
    }

    /// Rejects without requeue (dead-lettered if the queue has a target).
    pub async fn reject_and_drop(&self) -> Result<(), QueueError> {
        self.broker.reject(&self.raw.handle, false).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde::{Deserialize, Serialize};

    use super::DelayedQueue;
    use crate::broker::Broker;
    use crate::memory::InMemoryBroker;
    use crate::topology::Topology;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Ping {
        n: u32,
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_message_is_withheld_until_delay_elapses() {
        let broker = InMemoryBroker::new();
        let queue = DelayedQueue::new(Arc::new(broker.clone()));
        let mut sub = queue
            .subscribe_delayed("verifyChunkId", 8)
            .await
            .expect("subscribe");

        queue
            .publish_delayed("verifyChunkId", &Ping { n: 1 }, Duration::from_secs(60))
            .await
            .expect("publish");

        tokio::time::advance(Duration::from_secs(59)).await;
        tokio::task::yield_now().await;
        assert_eq!(broker.queue_len("verifyChunkIdQueue"), 1);

        let started = tokio::time::Instant::now();
        let delivery = sub.next().await.expect("delivery after delay");
        assert!(started.elapsed() <= Duration::from_secs(1));
        assert_eq!(delivery.decode::<Ping>().expect("decode"), Ping { n: 1 });
        delivery.ack().await.expect("ack");
    }

    #[tokio::test(start_paused = true)]
    async fn zero_delay_delivers_promptly() {
        let queue = DelayedQueue::new(Arc::new(InMemoryBroker::new()));
        let mut sub = queue
            .subscribe_delayed("verifyBundledTx", 8)
            .await
            .expect("subscribe");
        queue
            .publish_delayed("verifyBundledTx", &Ping { n: 2 }, Duration::ZERO)
            .await
            .expect("publish");
        let delivery = sub.next().await.expect("delivery");
        assert_eq!(delivery.decode::<Ping>().expect("decode").n, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn publishing_before_any_subscriber_is_not_lost() {
        let broker = InMemoryBroker::new();
        let queue = DelayedQueue::new(Arc::new(broker.clone()));
        queue
            .publish_delayed("reupload", &Ping { n: 3 }, Duration::from_millis(10))
            .await
            .expect("publish");
        tokio::time::advance(Duration::from_millis(20)).await;
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        let topology = Topology::for_topic("reupload");
        assert_eq!(broker.queue_len(&topology.consumer_queue), 1);

        let mut sub = queue.subscribe_delayed("reupload", 1).await.expect("sub");
        let delivery = sub.next().await.expect("delivery");
        assert_eq!(delivery.decode::<Ping>().expect("decode").n, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_without_requeue_is_not_redelivered() {
        let broker = InMemoryBroker::new();
        let queue = DelayedQueue::new(Arc::new(broker.clone()));
        let mut sub = queue.subscribe("upload", 4).await.expect("subscribe");
        queue
            .publish_now("upload", &Ping { n: 5 })
            .await
            .expect("publish");

        let delivery = sub.next().await.expect("delivery");
        delivery.reject_and_drop().await.expect("reject");
        assert_eq!(broker.queue_len("upload"), 0);
        assert_eq!(broker.unacked_len("upload"), 0);
        assert_eq!(broker.health_snapshot().dropped, 1);
        assert!(
            tokio::time::timeout(Duration::from_secs(1), sub.next())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn publish_now_and_subscribe_round_trip_with_requeue() {
        let queue = DelayedQueue::new(Arc::new(InMemoryBroker::new()));
        let mut sub = queue.subscribe("upload", 4).await.expect("subscribe");
        queue
            .publish_now("upload", &Ping { n: 4 })
            .await
            .expect("publish");

        let first = sub.next().await.expect("first");
        assert!(!first.redelivered());
        first.reject_and_requeue().await.expect("requeue");

        let second = sub.next().await.expect("second");
        assert!(second.redelivered());
        assert_eq!(second.payload(), first.payload());
        second.ack().await.expect("ack");
    }
}
