//! Delayed-delivery queueing for archivist.
//!
//! Everything above the broker only depends on the primitive [`broker::Broker`]
//! contract (exchanges, queues, bindings, per-message expiry, manual ack).
//! [`delayed::DelayedQueue`] layers scheduled redelivery on top of it by
//! routing messages through a holding queue whose expired entries are
//! dead-lettered into the consumer-facing queue.

pub mod amqp;
pub mod broker;
pub mod delayed;
pub mod error;
pub mod memory;
pub mod topology;

pub use broker::{Broker, BrokerHealthSnapshot, DeadLetter, DeliveryHandle, RawDelivery};
pub use delayed::{DelayedQueue, Delivery, Subscription};
pub use error::QueueError;
pub use memory::InMemoryBroker;
pub use topology::Topology;
