pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

/// A message as seen on the broker side.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: serde_json::Value,
    pub timestamp: jiff::Timestamp,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("connection refused for client '{0}'")]
    ConnectionRefused(String),
    #[error("client '{0}' is not connected")]
    NotConnected(String),
    #[error("publish to '{0}' failed: {1}")]
    PublishFailed(String, String),
}

/// Publish/subscribe boundary the devices talk to.
///
/// The real broker is an external collaborator; this trait is the seam. Every
/// device connects under its own client identity and no two devices share a
/// connection object.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Register a client identity. Connecting an already-connected client
    /// replaces its session.
    async fn connect(&self, client_id: &str) -> Result<(), BrokerError>;

    /// Drop a client identity. Unknown clients are a no-op.
    async fn disconnect(&self, client_id: &str) -> Result<(), BrokerError>;

    /// Publish a JSON payload to a topic.
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), BrokerError>;
}
