//! Transport boundary. The core only needs to hand a message to a client,
//! broadcast to everyone, and read back how far behind a client is.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info};

use crate::error::{Result, StreamError};
use crate::protocol::OutboundMessage;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, client_id: &str, message: OutboundMessage) -> Result<()>;

    /// Number of clients the message was handed to.
    async fn broadcast(&self, message: OutboundMessage) -> Result<usize>;

    /// Messages queued for the client but not yet consumed.
    fn queue_depth(&self, _client_id: &str) -> Option<u64> {
        None
    }
}

/// In-process transport: one bounded queue per client.
///
/// Delivery never waits on a full queue, so a slow consumer only loses its
/// own messages and cannot stall delivery to other clients.
pub struct ChannelTransport {
    capacity: usize,
    senders: DashMap<String, mpsc::Sender<OutboundMessage>>,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            senders: DashMap::new(),
        }
    }

    /// Open a queue for the client, replacing any previous one.
    pub fn register(&self, client_id: &str) -> mpsc::Receiver<OutboundMessage> {
        let (tx, rx) = mpsc::channel(self.capacity);
        if self.senders.insert(client_id.to_string(), tx).is_some() {
            info!("Replaced transport queue for client {}", client_id);
        }
        rx
    }

    pub fn unregister(&self, client_id: &str) -> bool {
        self.senders.remove(client_id).is_some()
    }

    pub fn connected_clients(&self) -> usize {
        self.senders.len()
    }

    fn sender(&self, client_id: &str) -> Option<mpsc::Sender<OutboundMessage>> {
        self.senders.get(client_id).map(|tx| tx.clone())
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn deliver(&self, client_id: &str, message: OutboundMessage) -> Result<()> {
        let tx = self
            .sender(client_id)
            .ok_or_else(|| StreamError::transport(format!("Client {} is not connected", client_id)))?;

        match tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(message)) => Err(StreamError::transport(format!(
                "Queue full for client {}, dropped {} message",
                client_id,
                message.kind()
            ))),
            Err(TrySendError::Closed(_)) => {
                self.senders.remove(client_id);
                Err(StreamError::transport(format!("Client {} receiver closed", client_id)))
            }
        }
    }

    async fn broadcast(&self, message: OutboundMessage) -> Result<usize> {
        let senders: Vec<(String, mpsc::Sender<OutboundMessage>)> = self
            .senders
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut delivered = 0;
        for (client_id, tx) in senders {
            match tx.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!("Broadcast to {} skipped: {}", client_id, e),
            }
        }
        Ok(delivered)
    }

    fn queue_depth(&self, client_id: &str) -> Option<u64> {
        self.senders
            .get(client_id)
            .map(|tx| (tx.max_capacity() - tx.capacity()) as u64)
    }
}
