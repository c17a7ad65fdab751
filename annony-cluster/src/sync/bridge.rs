use annony_core::models::Message;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::bus::MessageBus;
use super::dedup::{DedupKey, MessageDeduplicator};
use crate::Result;

/// Wire form of a message on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub node_id: String,
    pub seq: u64,
    pub message: Message,
}

/// Receives every message delivered on a subscribed topic.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &Message);
}

impl MessageHandler for tokio::sync::mpsc::UnboundedSender<Message> {
    fn handle(&self, message: &Message) {
        let _ = self.send(message.clone());
    }
}

/// Cross-instance broadcast over a [`MessageBus`].
///
/// Messages published here are delivered back through the bus to every
/// subscriber, this instance included; nothing is short-circuited locally.
pub struct PubSubBridge {
    bus: Arc<dyn MessageBus>,
    node_id: String,
    seq: AtomicU64,
    deduplicator: MessageDeduplicator,
    cancel_token: CancellationToken,
}

impl PubSubBridge {
    #[must_use]
    pub fn new(bus: Arc<dyn MessageBus>, node_id: impl Into<String>) -> Self {
        let deduplicator = MessageDeduplicator::with_defaults();
        let cancel_token = CancellationToken::new();
        deduplicator.spawn_cleanup(cancel_token.clone());

        Self {
            bus,
            node_id: node_id.into(),
            seq: AtomicU64::new(0),
            deduplicator,
            cancel_token,
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Publish `message` to every subscriber of `topic`.
    pub async fn publish(&self, topic: &str, message: &Message) -> Result<()> {
        let envelope = Envelope {
            node_id: self.node_id.clone(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            message: message.clone(),
        };
        let payload = serde_json::to_vec(&envelope)?;
        self.bus.publish(topic, Bytes::from(payload)).await?;

        debug!(topic = %topic, seq = envelope.seq, sender = %message.sender, "Message published");
        Ok(())
    }

    /// Subscribe `handler` to `topic`.
    ///
    /// The subscription is established before this returns, so a bus that is
    /// unreachable fails here. Delivery then runs on a spawned task until
    /// [`shutdown`](Self::shutdown) or until the bus closes the subscription.
    pub async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<JoinHandle<()>> {
        let mut subscription = self.bus.subscribe(topic).await?;
        let deduplicator = self.deduplicator.clone();
        let cancel = self.cancel_token.clone();
        let topic = topic.to_string();

        info!(topic = %topic, node_id = %self.node_id, "Bridge subscribed");

        Ok(tokio::spawn(async move {
            loop {
                let payload = tokio::select! {
                    () = cancel.cancelled() => break,
                    payload = subscription.recv() => payload,
                };
                let Some(payload) = payload else {
                    warn!(topic = %topic, "Bus subscription closed");
                    break;
                };

                let envelope: Envelope = match serde_json::from_slice(&payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(error = %e, topic = %topic, "Failed to deserialize envelope");
                        continue;
                    }
                };

                if !deduplicator.should_process(&DedupKey::new(envelope.node_id.as_str(), envelope.seq)) {
                    debug!(topic = %topic, node_id = %envelope.node_id, seq = envelope.seq, "Skipping duplicate envelope");
                    continue;
                }

                handler.handle(&envelope.message);
            }
        }))
    }

    /// Stop all delivery tasks started by this bridge
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

impl Drop for PubSubBridge {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
