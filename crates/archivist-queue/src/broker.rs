use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::QueueError;

/// Dead-letter target configured on a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub exchange: String,
    pub routing_key: String,
}

/// Identifies one delivered-but-unsettled message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryHandle {
    /// Queue the message was consumed from.
    pub queue: String,
    /// Broker-assigned delivery tag.
    pub tag: u64,
}

/// A message handed to a consumer, still owned by the broker until settled.
#[derive(Debug, Clone)]
pub struct RawDelivery {
    pub handle: DeliveryHandle,
    pub payload: Vec<u8>,
    /// True when the broker delivered this message before (requeue/crash).
    pub redelivered: bool,
}

/// Coarse broker counters for health reporting and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerHealthSnapshot {
    pub published: u64,
    pub delivered: u64,
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub dropped: u64,
}

/// Primitive at-least-once pub/sub operations the delayed queue is built on.
///
/// Implementations must not acknowledge anything implicitly: a delivery stays
/// owned by the broker until [`Broker::ack`] or [`Broker::reject`] is called.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declares a durable direct exchange. Idempotent.
    async fn declare_exchange(&self, name: &str) -> Result<(), QueueError>;

    /// Declares a queue, optionally dead-lettering expired/rejected entries. Idempotent.
    async fn declare_queue(
        &self,
        name: &str,
        dead_letter: Option<&DeadLetter>,
    ) -> Result<(), QueueError>;

    /// Binds `queue` to `exchange` for `routing_key`. Idempotent.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), QueueError>;

    /// Publishes `payload`. An empty `exchange` routes straight to the queue
    /// named by `routing_key`. `expiration` bounds how long the entry may
    /// wait in a queue before it is dead-lettered.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        expiration: Option<Duration>,
    ) -> Result<(), QueueError>;

    /// Starts a consumer with at most `prefetch` unsettled deliveries.
    async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<mpsc::Receiver<RawDelivery>, QueueError>;

    /// Settles a delivery as processed.
    async fn ack(&self, handle: &DeliveryHandle) -> Result<(), QueueError>;

    /// Rejects a delivery. With `requeue` it returns to the head of its queue
    /// for immediate redelivery; otherwise it is dead-lettered or dropped.
    async fn reject(&self, handle: &DeliveryHandle, requeue: bool) -> Result<(), QueueError>;

    /// Best-effort counters.
    fn health_snapshot(&self) -> BrokerHealthSnapshot {
        BrokerHealthSnapshot::default()
    }
}
