use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::broker::{Broker, BrokerHealthSnapshot, DeadLetter, DeliveryHandle, RawDelivery};
use crate::error::QueueError;

/// AMQP 0-9-1 broker backed by `lapin`.
///
/// Consumption and settlement share the rx channel (delivery tags are
/// channel-scoped); publishing and topology declaration use the tx channel.
pub struct AmqpBroker {
    connection: Connection,
    rx_channel: Channel,
    tx_channel: Channel,
    counters: Arc<Counters>,
}

/// Client-side view of broker traffic. Expiry dead-lettering happens on the
/// server and is not counted here.
#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
    dropped: AtomicU64,
    dead_letter_queues: Mutex<HashSet<String>>,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn note_dead_letter_queue(&self, queue: &str) {
        self.dead_letter_queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(queue.to_string());
    }

    /// A reject without requeue dead-letters on queues declared with a
    /// target and discards everywhere else.
    fn rejected(&self, queue: &str) {
        let dead_letters = self
            .dead_letter_queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(queue);
        if dead_letters {
            Self::bump(&self.dead_lettered);
        } else {
            Self::bump(&self.dropped);
        }
    }

    fn snapshot(&self) -> BrokerHealthSnapshot {
        BrokerHealthSnapshot {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl AmqpBroker {
    /// Connects and opens the rx/tx channels.
    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|err| QueueError::Connect(err.to_string()))?;
        let rx_channel = connection
            .create_channel()
            .await
            .map_err(|err| QueueError::Connect(err.to_string()))?;
        let tx_channel = connection
            .create_channel()
            .await
            .map_err(|err| QueueError::Connect(err.to_string()))?;
        info!("amqp: connected to broker");
        Ok(Self {
            connection,
            rx_channel,
            tx_channel,
            counters: Arc::new(Counters::default()),
        })
    }

    /// Closes the connection; unsettled deliveries return to their queues.
    pub async fn close(&self) -> Result<(), QueueError> {
        self.connection.close(200, "shutdown").await?;
        Ok(())
    }
}

fn dead_letter_arguments(dead_letter: Option<&DeadLetter>) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(target) = dead_letter {
        arguments.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(target.exchange.as_str())),
        );
        arguments.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(LongString::from(target.routing_key.as_str())),
        );
    }
    arguments
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_exchange(&self, name: &str) -> Result<(), QueueError> {
        self.tx_channel
            .exchange_declare(
                name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        dead_letter: Option<&DeadLetter>,
    ) -> Result<(), QueueError> {
        self.tx_channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    ..QueueDeclareOptions::default()
                },
                dead_letter_arguments(dead_letter),
            )
            .await?;
        if dead_letter.is_some() {
            self.counters.note_dead_letter_queue(name);
        }
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), QueueError> {
        self.tx_channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        expiration: Option<Duration>,
    ) -> Result<(), QueueError> {
        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from("application/json"))
            .with_delivery_mode(2);
        if let Some(expiration) = expiration {
            properties =
                properties.with_expiration(ShortString::from(expiration.as_millis().to_string()));
        }
        self.tx_channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await?;
        Counters::bump(&self.counters.published);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<mpsc::Receiver<RawDelivery>, QueueError> {
        self.rx_channel
            .basic_qos(prefetch.max(1), BasicQosOptions::default())
            .await?;
        let mut consumer = self
            .rx_channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        let (tx, rx) = mpsc::channel(usize::from(prefetch.max(1)));
        let queue_name = queue.to_string();
        let counters = Arc::clone(&self.counters);
        tokio::spawn(async move {
            while let Some(next) = consumer.next().await {
                match next {
                    Ok(delivery) => {
                        let raw = RawDelivery {
                            handle: DeliveryHandle {
                                queue: queue_name.clone(),
                                tag: delivery.delivery_tag,
                            },
                            payload: delivery.data,
                            redelivered: delivery.redelivered,
                        };
                        Counters::bump(&counters.delivered);
                        if tx.send(raw).await.is_err() {
                            warn!("amqp: subscriber for {queue_name} went away");
                            break;
                        }
                    }
                    Err(err) => {
                        error!("amqp: consumer for {queue_name} failed: {err}");
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn ack(&self, handle: &DeliveryHandle) -> Result<(), QueueError> {
        self.rx_channel
            .basic_ack(handle.tag, BasicAckOptions::default())
            .await?;
        Counters::bump(&self.counters.acked);
        Ok(())
    }

    async fn reject(&self, handle: &DeliveryHandle, requeue: bool) -> Result<(), QueueError> {
        if requeue {
            self.rx_channel
                .basic_nack(
                    handle.tag,
                    BasicNackOptions {
                        multiple: false,
                        requeue: true,
                    },
                )
                .await?;
            Counters::bump(&self.counters.requeued);
        } else {
            self.rx_channel
                .basic_reject(handle.tag, BasicRejectOptions { requeue: false })
                .await?;
            self.counters.rejected(&handle.queue);
        }
        Ok(())
    }

    fn health_snapshot(&self) -> BrokerHealthSnapshot {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use lapin::types::{AMQPValue, ShortString};

    use super::{dead_letter_arguments, Counters};
    use crate::broker::{BrokerHealthSnapshot, DeadLetter};

    #[test]
    fn dead_letter_arguments_name_exchange_and_routing_key() {
        let args = dead_letter_arguments(Some(&DeadLetter {
            exchange: "uploadExDLX".to_string(),
            routing_key: "uploadRoutingKeyDLX".to_string(),
        }));
        let inner = args.inner();
        assert!(matches!(
            inner.get(&ShortString::from("x-dead-letter-exchange")),
            Some(AMQPValue::LongString(_))
        ));
        assert!(inner.contains_key(&ShortString::from("x-dead-letter-routing-key")));
    }

    #[test]
    fn counters_split_rejects_by_dead_letter_target() {
        let counters = Counters::default();
        counters.note_dead_letter_queue("uploadHoldingQueue");
        Counters::bump(&counters.published);
        Counters::bump(&counters.published);
        Counters::bump(&counters.delivered);
        Counters::bump(&counters.acked);
        Counters::bump(&counters.requeued);
        counters.rejected("uploadHoldingQueue");
        counters.rejected("upload");
        counters.rejected("upload");

        assert_eq!(
            counters.snapshot(),
            BrokerHealthSnapshot {
                published: 2,
                delivered: 1,
                acked: 1,
                requeued: 1,
                dead_lettered: 1,
                dropped: 2,
            }
        );
    }

    #[test]
    fn no_dead_letter_means_no_arguments() {
        assert!(dead_letter_arguments(None).inner().is_empty());
    }
}
