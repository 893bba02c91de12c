//! Publish/subscribe transport contract
//!
//! Defines the abstract broker interface the bus publishes through. A
//! concrete implementation wraps a real broker connection (e.g. MQTT);
//! the in-process [`MemoryBroker`](super::memory::MemoryBroker) conforms
//! to the same contract for tests and demos.

use std::sync::Arc;
use thiserror::Error;

/// Callback invoked once per received message with the raw payload.
///
/// Handlers may run on the transport's own delivery threads, concurrently
/// with local bus calls.
pub type MessageHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Disconnected")]
    Disconnected,

    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Not subscribed to topic: {0}")]
    NotSubscribed(String),
}

/// A topic-based publish/subscribe transport.
///
/// Publishing is fire-and-forget: no acknowledgment, no retry and no
/// backpressure flow back to the caller. A send failure surfaces once,
/// synchronously, and retry policy belongs to whoever owns the broker
/// connection.
pub trait Transport: Send + Sync {
    /// Announce intent to publish on a topic.
    fn advertise(&self, topic: &str) -> Result<(), TransportError>;

    /// Withdraw a previous advertisement.
    fn unadvertise(&self, topic: &str) -> Result<(), TransportError>;

    /// Register a handler for messages on a topic.
    fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), TransportError>;

    /// Remove this endpoint's handler for a topic.
    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Publish a payload to every subscriber of a topic.
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;
}
