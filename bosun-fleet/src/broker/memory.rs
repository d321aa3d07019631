use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast};
use tracing::trace;

use super::{Broker, BrokerError, BrokerMessage};

/// In-process broker implementation.
///
/// Keeps a full message log and fans messages out over a broadcast channel.
/// Primarily intended for tests and for running the fleet binary without an
/// external broker.
pub struct MemoryBroker {
    inner: Arc<Mutex<Inner>>,
    tx: broadcast::Sender<BrokerMessage>,
}

struct Inner {
    clients: HashSet<String>,
    log: Vec<BrokerMessage>,
    refuse_connects: bool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                clients: HashSet::new(),
                log: Vec::new(),
                refuse_connects: false,
            })),
            tx,
        }
    }

    /// Subscribe to every message published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerMessage> {
        self.tx.subscribe()
    }

    /// Snapshot of all messages published so far, in order.
    pub async fn messages(&self) -> Vec<BrokerMessage> {
        self.inner.lock().await.log.clone()
    }

    /// Messages whose topic matches exactly.
    pub async fn messages_on(&self, topic: &str) -> Vec<BrokerMessage> {
        self.inner
            .lock()
            .await
            .log
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub async fn clear(&self) {
        self.inner.lock().await.log.clear();
    }

    pub async fn connected_clients(&self) -> usize {
        self.inner.lock().await.clients.len()
    }

    /// Make subsequent `connect` calls fail. Used to exercise the connect
    /// error path.
    pub async fn refuse_connections(&self, refuse: bool) {
        self.inner.lock().await.refuse_connects = refuse;
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MemoryBroker {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            tx: self.tx.clone(),
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, client_id: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        if inner.refuse_connects {
            return Err(BrokerError::ConnectionRefused(client_id.to_owned()));
        }
        inner.clients.insert(client_id.to_owned());
        Ok(())
    }

    async fn disconnect(&self, client_id: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        inner.clients.remove(client_id);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), BrokerError> {
        let message = BrokerMessage {
            topic: topic.to_owned(),
            payload,
            timestamp: jiff::Timestamp::now(),
        };

        let mut inner = self.inner.lock().await;
        inner.log.push(message.clone());
        drop(inner);

        trace!(topic, "Broker message published");
        // No subscribers is fine; the log still captures the message.
        let _ = self.tx.send(message);
        Ok(())
    }
}
