use thiserror::Error;

/// Errors surfaced by brokers and the delayed-queue layer.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Connection to the broker could not be established.
    #[error("broker connect failed: {0}")]
    Connect(String),
    /// Broker-side protocol/channel failure.
    #[error("broker protocol error: {0}")]
    Protocol(String),
    /// Payload could not be serialized.
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),
    /// Payload could not be deserialized.
    #[error("decode error: {0}")]
    Decode(#[source] serde_json::Error),
    /// Publish/consume targeted an undeclared exchange or queue.
    #[error("unknown destination: {0}")]
    UnknownDestination(String),
    /// Ack/reject targeted a delivery the broker no longer tracks.
    #[error("unknown delivery {tag} on {queue}")]
    UnknownDelivery { queue: String, tag: u64 },
    /// Broker has been closed.
    #[error("broker is closed")]
    Closed,
}

impl From<lapin::Error> for QueueError {
    fn from(err: lapin::Error) -> Self {
        QueueError::Protocol(err.to_string())
    }
}
