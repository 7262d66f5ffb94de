use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use crate::broker::{Broker, BrokerHealthSnapshot, DeadLetter, DeliveryHandle, RawDelivery};
use crate::error::QueueError;

/// In-process at-least-once broker for tests and simulations.
///
/// Mirrors the broker semantics the delayed queue relies on: direct
/// exchanges, per-message expiry with dead-lettering, prefetch-bounded
/// dispatch, manual ack and head-of-queue requeue.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Mutex<BrokerState>>,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, Vec<Binding>>,
    queues: HashMap<String, QueueState>,
    next_message_id: u64,
    next_consumer_id: u64,
    stats: BrokerHealthSnapshot,
}

#[derive(Debug, Clone)]
struct Binding {
    queue: String,
    routing_key: String,
}

#[derive(Debug, Default)]
struct QueueState {
    dead_letter: Option<DeadLetter>,
    ready: VecDeque<Message>,
    consumers: Vec<ConsumerSlot>,
    unacked: HashMap<u64, Unacked>,
    next_tag: u64,
    next_consumer: usize,
}

#[derive(Debug, Clone)]
struct Message {
    id: u64,
    payload: Vec<u8>,
    redelivered: bool,
    expiration: Option<Duration>,
}

#[derive(Debug)]
struct Unacked {
    consumer_id: u64,
    message: Message,
}

#[derive(Debug)]
struct ConsumerSlot {
    id: u64,
    tx: mpsc::Sender<RawDelivery>,
    prefetch: usize,
    in_flight: usize,
}

/// Expiry timer to arm once the state lock is released.
#[derive(Debug)]
struct PendingExpiry {
    queue: String,
    message_id: u64,
    ttl: Duration,
}

impl BrokerState {
    fn enqueue(&mut self, queue: &str, mut message: Message, armed: &mut Vec<PendingExpiry>) -> bool {
        self.next_message_id += 1;
        message.id = self.next_message_id;
        let Some(state) = self.queues.get_mut(queue) else {
            return false;
        };
        if let Some(ttl) = message.expiration {
            armed.push(PendingExpiry {
                queue: queue.to_string(),
                message_id: message.id,
                ttl,
            });
        }
        state.ready.push_back(message);
        true
    }

    /// Routes a message and returns how many queues received it.
    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: Message,
        armed: &mut Vec<PendingExpiry>,
    ) -> usize {
        if exchange.is_empty() {
            return usize::from(self.enqueue(routing_key, message, armed));
        }
        let targets: Vec<String> = self
            .exchanges
            .get(exchange)
            .map(|bindings| {
                bindings
                    .iter()
                    .filter(|b| b.routing_key == routing_key)
                    .map(|b| b.queue.clone())
                    .collect()
            })
            .unwrap_or_default();
        let mut routed = 0usize;
        for queue in targets {
            if self.enqueue(&queue, message.clone(), armed) {
                routed += 1;
            }
        }
        routed
    }

    /// Moves a message out of `queue` to its dead-letter target, if any.
    fn dead_letter(&mut self, queue: &str, mut message: Message, armed: &mut Vec<PendingExpiry>) {
        let target = self.queues.get(queue).and_then(|q| q.dead_letter.clone());
        match target {
            Some(target) => {
                message.expiration = None;
                let routed = self.route(&target.exchange, &target.routing_key, message, armed);
                if routed == 0 {
                    self.stats.dropped += 1;
                } else {
                    self.stats.dead_lettered += 1;
                }
            }
            None => self.stats.dropped += 1,
        }
    }

    fn expire(&mut self, queue: &str, message_id: u64, armed: &mut Vec<PendingExpiry>) {
        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };
        let Some(pos) = state.ready.iter().position(|m| m.id == message_id) else {
            // Already delivered to a consumer.
            return;
        };
        let Some(message) = state.ready.remove(pos) else {
            return;
        };
        debug!("memory broker: message {message_id} expired on {queue}");
        self.dead_letter(queue, message, armed);
    }

    fn dispatch_all(&mut self) {
        let mut delivered = 0u64;
        for (name, queue) in self.queues.iter_mut() {
            delivered += queue.dispatch(name);
        }
        self.stats.delivered += delivered;
    }
}

impl QueueState {
    fn next_consumer_with_capacity(&mut self) -> Option<usize> {
        let count = self.consumers.len();
        for offset in 0..count {
            let idx = (self.next_consumer + offset) % count;
            if self.consumers[idx].in_flight < self.consumers[idx].prefetch {
                self.next_consumer = (idx + 1) % count;
                return Some(idx);
            }
        }
        None
    }

    fn dispatch(&mut self, name: &str) -> u64 {
        let mut delivered = 0u64;
        while !self.ready.is_empty() {
            let Some(idx) = self.next_consumer_with_capacity() else {
                break;
            };
            let Some(message) = self.ready.pop_front() else {
                break;
            };
            self.next_tag += 1;
            let tag = self.next_tag;
            let delivery = RawDelivery {
                handle: DeliveryHandle {
                    queue: name.to_string(),
                    tag,
                },
                payload: message.payload.clone(),
                redelivered: message.redelivered,
            };
            match self.consumers[idx].tx.try_send(delivery) {
                Ok(()) => {
                    let consumer = &mut self.consumers[idx];
                    consumer.in_flight += 1;
                    self.unacked.insert(
                        tag,
                        Unacked {
                            consumer_id: consumer.id,
                            message,
                        },
                    );
                    delivered += 1;
                }
                Err(TrySendError::Full(_)) => {
                    self.ready.push_front(message);
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    self.consumers.remove(idx);
                    self.next_consumer = 0;
                    self.ready.push_front(message);
                }
            }
        }
        delivered
    }

    fn settle(&mut self, tag: u64) -> Option<Message> {
        let unacked = self.unacked.remove(&tag)?;
        if let Some(consumer) = self
            .consumers
            .iter_mut()
            .find(|c| c.id == unacked.consumer_id)
        {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }
        Some(unacked.message)
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn arm(&self, armed: Vec<PendingExpiry>) {
        for expiry in armed {
            let inner = Arc::clone(&self.inner);
            // The clock starts at publish, not when the task is first polled.
            let deadline = tokio::time::Instant::now() + expiry.ttl;
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                let mut state = inner.lock().unwrap_or_else(|e| e.into_inner());
                let mut rearm = Vec::new();
                state.expire(&expiry.queue, expiry.message_id, &mut rearm);
                state.dispatch_all();
                // Dead-lettered copies carry no expiry, so `rearm` stays empty.
                debug_assert!(rearm.is_empty());
            });
        }
    }

    /// Number of ready (undelivered) messages in `queue`.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Number of delivered-but-unsettled messages in `queue`.
    pub fn unacked_len(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Drops every consumer and returns their unsettled messages to the head
    /// of their queues, as a broker does when a consumer connection dies.
    pub fn close_consumers(&self) {
        let mut state = self.lock();
        let mut returned = 0u64;
        for queue in state.queues.values_mut() {
            queue.consumers.clear();
            queue.next_consumer = 0;
            let mut tags: Vec<u64> = queue.unacked.keys().copied().collect();
            tags.sort_unstable();
            for tag in tags.into_iter().rev() {
                if let Some(unacked) = queue.unacked.remove(&tag) {
                    let mut message = unacked.message;
                    message.redelivered = true;
                    queue.ready.push_front(message);
                    returned += 1;
                }
            }
        }
        state.stats.requeued += returned;
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_exchange(&self, name: &str) -> Result<(), QueueError> {
        self.lock().exchanges.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        dead_letter: Option<&DeadLetter>,
    ) -> Result<(), QueueError> {
        let mut state = self.lock();
        let queue = state.queues.entry(name.to_string()).or_default();
        if queue.dead_letter.is_none() {
            queue.dead_letter = dead_letter.cloned();
        }
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), QueueError> {
        let mut state = self.lock();
        if !state.queues.contains_key(queue) {
            return Err(QueueError::UnknownDestination(queue.to_string()));
        }
        let bindings = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| QueueError::UnknownDestination(exchange.to_string()))?;
        if !bindings
            .iter()
            .any(|b| b.queue == queue && b.routing_key == routing_key)
        {
            bindings.push(Binding {
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        expiration: Option<Duration>,
    ) -> Result<(), QueueError> {
        let armed = {
            let mut state = self.lock();
            if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
                return Err(QueueError::UnknownDestination(exchange.to_string()));
            }
            state.stats.published += 1;
            let mut armed = Vec::new();
            let message = Message {
                id: 0,
                payload,
                redelivered: false,
                expiration,
            };
            if state.route(exchange, routing_key, message, &mut armed) == 0 {
                state.stats.dropped += 1;
            }
            state.dispatch_all();
            armed
        };
        self.arm(armed);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<mpsc::Receiver<RawDelivery>, QueueError> {
        let prefetch = usize::from(prefetch.max(1));
        let (tx, rx) = mpsc::channel(prefetch);
        let mut state = self.lock();
        state.next_consumer_id += 1;
        let id = state.next_consumer_id;
        let target = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::UnknownDestination(queue.to_string()))?;
        target.consumers.push(ConsumerSlot {
            id,
            tx,
            prefetch,
            in_flight: 0,
        });
        state.dispatch_all();
        Ok(rx)
    }

    async fn ack(&self, handle: &DeliveryHandle) -> Result<(), QueueError> {
        let mut state = self.lock();
        let queue = state
            .queues
            .get_mut(&handle.queue)
            .ok_or_else(|| QueueError::UnknownDestination(handle.queue.clone()))?;
        if queue.settle(handle.tag).is_none() {
            return Err(QueueError::UnknownDelivery {
                queue: handle.queue.clone(),
                tag: handle.tag,
            });
        }
        state.stats.acked += 1;
        state.dispatch_all();
        Ok(())
    }

    async fn reject(&self, handle: &DeliveryHandle, requeue: bool) -> Result<(), QueueError> {
        let armed = {
            let mut state = self.lock();
            let queue = state
                .queues
                .get_mut(&handle.queue)
                .ok_or_else(|| QueueError::UnknownDestination(handle.queue.clone()))?;
            let Some(mut message) = queue.settle(handle.tag) else {
                return Err(QueueError::UnknownDelivery {
                    queue: handle.queue.clone(),
                    tag: handle.tag,
                });
            };
            let mut armed = Vec::new();
            if requeue {
                message.redelivered = true;
                queue.ready.push_front(message);
                state.stats.requeued += 1;
            } else {
                state.dead_letter(&handle.queue, message, &mut armed);
            }
            state.dispatch_all();
            armed
        };
        self.arm(armed);
        Ok(())
    }

    fn health_snapshot(&self) -> BrokerHealthSnapshot {
        self.lock().stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::InMemoryBroker;
    use crate::broker::{Broker, DeadLetter};

    async fn declare_plain(broker: &InMemoryBroker, queue: &str) {
        broker
            .declare_queue(queue, None)
            .await
            .expect("declare should succeed");
    }

    #[tokio::test]
    async fn publish_then_consume_delivers_in_order() {
        let broker = InMemoryBroker::new();
        declare_plain(&broker, "upload").await;
        broker
            .publish("", "upload", b"a".to_vec(), None)
            .await
            .expect("publish a");
        broker
            .publish("", "upload", b"b".to_vec(), None)
            .await
            .expect("publish b");

        let mut rx = broker.consume("upload", 10).await.expect("consume");
        let first = rx.recv().await.expect("first delivery");
        let second = rx.recv().await.expect("second delivery");
        assert_eq!(first.payload, b"a");
        assert_eq!(second.payload, b"b");
        assert_eq!(broker.unacked_len("upload"), 2);

        broker.ack(&first.handle).await.expect("ack first");
        broker.ack(&second.handle).await.expect("ack second");
        assert_eq!(broker.unacked_len("upload"), 0);
        assert!(broker.ack(&first.handle).await.is_err());
    }

    #[tokio::test]
    async fn prefetch_bounds_unsettled_deliveries() {
        let broker = InMemoryBroker::new();
        declare_plain(&broker, "upload").await;
        for i in 0..3_u8 {
            broker
                .publish("", "upload", vec![i], None)
                .await
                .expect("publish");
        }
        let mut rx = broker.consume("upload", 1).await.expect("consume");
        let first = rx.recv().await.expect("first delivery");
        assert!(rx.try_recv().is_err());
        assert_eq!(broker.queue_len("upload"), 2);

        broker.ack(&first.handle).await.expect("ack");
        let second = rx.recv().await.expect("second delivery");
        assert_eq!(second.payload, vec![1]);
    }

    #[tokio::test]
    async fn reject_with_requeue_redelivers_at_head() {
        let broker = InMemoryBroker::new();
        declare_plain(&broker, "upload").await;
        broker
            .publish("", "upload", b"x".to_vec(), None)
            .await
            .expect("publish x");
        broker
            .publish("", "upload", b"y".to_vec(), None)
            .await
            .expect("publish y");
        let mut rx = broker.consume("upload", 1).await.expect("consume");
        let x = rx.recv().await.expect("x");
        broker.reject(&x.handle, true).await.expect("reject");

        let again = rx.recv().await.expect("redelivery");
        assert_eq!(again.payload, b"x");
        assert!(again.redelivered);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_messages_are_dead_lettered() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("dlx").await.expect("exchange");
        broker
            .declare_queue(
                "holding",
                Some(&DeadLetter {
                    exchange: "dlx".to_string(),
                    routing_key: "rk".to_string(),
                }),
            )
            .await
            .expect("holding");
        declare_plain(&broker, "ready").await;
        broker.bind_queue("ready", "dlx", "rk").await.expect("bind");

        broker
            .publish("", "holding", b"later".to_vec(), Some(Duration::from_secs(5)))
            .await
            .expect("publish");
        let mut rx = broker.consume("ready", 4).await.expect("consume");

        tokio::time::advance(Duration::from_secs(4)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(broker.queue_len("holding"), 1);

        let delivery = rx.recv().await.expect("dead-lettered delivery");
        assert_eq!(delivery.payload, b"later");
        assert_eq!(broker.queue_len("holding"), 0);
        assert_eq!(broker.health_snapshot().dead_lettered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_counts_from_publish_time() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("dlx").await.expect("exchange");
        broker
            .declare_queue(
                "holding",
                Some(&DeadLetter {
                    exchange: "dlx".to_string(),
                    routing_key: "rk".to_string(),
                }),
            )
            .await
            .expect("holding");
        declare_plain(&broker, "ready").await;
        broker.bind_queue("ready", "dlx", "rk").await.expect("bind");
        let mut rx = broker.consume("ready", 4).await.expect("consume");

        broker
            .publish("", "holding", b"due".to_vec(), Some(Duration::from_secs(60)))
            .await
            .expect("publish");
        // The clock moves past the expiry before the timer task ever runs.
        tokio::time::advance(Duration::from_secs(60)).await;

        let started = tokio::time::Instant::now();
        let delivery = rx.recv().await.expect("dead-lettered delivery");
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(delivery.payload, b"due");
    }

    #[tokio::test]
    async fn close_consumers_returns_unacked_messages() {
        let broker = InMemoryBroker::new();
        declare_plain(&broker, "upload").await;
        broker
            .publish("", "upload", b"m".to_vec(), None)
            .await
            .expect("publish");
        let mut rx = broker.consume("upload", 4).await.expect("consume");
        let _unsettled = rx.recv().await.expect("delivery");

        broker.close_consumers();
        assert_eq!(broker.unacked_len("upload"), 0);
        assert_eq!(broker.queue_len("upload"), 1);

        let mut rx2 = broker.consume("upload", 4).await.expect("consume again");
        let again = rx2.recv().await.expect("redelivery");
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn publish_to_unknown_exchange_fails() {
        let broker = InMemoryBroker::new();
        assert!(broker
            .publish("missingEx", "", b"m".to_vec(), None)
            .await
            .is_err());
    }
}
