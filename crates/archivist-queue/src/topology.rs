/// Broker object names backing one delayed logical topic.
///
/// For topic `T`: messages are published into holding queue `T+"Queue"`
/// (bound to exchange `T+"Ex"`) with a per-message expiry. Expired entries
/// are dead-lettered to exchange `T+"ExDLX"` with routing key
/// `T+"RoutingKeyDLX"`, which is bound to the consumer queue `T+"QueueDLX"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub topic: String,
    pub holding_exchange: String,
    pub holding_queue: String,
    pub dead_letter_exchange: String,
    pub dead_letter_routing_key: String,
    pub consumer_queue: String,
}

impl Topology {
    /// Derives the delayed topology names for `topic`.
    pub fn for_topic(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            holding_exchange: format!("{topic}Ex"),
            holding_queue: format!("{topic}Queue"),
            dead_letter_exchange: format!("{topic}ExDLX"),
            dead_letter_routing_key: format!("{topic}RoutingKeyDLX"),
            consumer_queue: format!("{topic}QueueDLX"),
        }
    }
}
