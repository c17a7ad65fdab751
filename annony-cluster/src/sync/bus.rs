//! Minimal publish/subscribe transport

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::Result;

/// Buffered payloads per subscription before delivery starts dropping.
pub const SUBSCRIPTION_CAPACITY: usize = 10_000;

/// Receiving half of a topic subscription. Closed when the bus shuts down.
pub type Subscription = mpsc::Receiver<Bytes>;

/// Transport carrying opaque payloads between instances.
///
/// Implementations deliver each publisher's payloads to every subscriber of
/// the topic, the publisher included, in publish order. Delivery is
/// best-effort: a payload may be repeated after a reconnect or lost during an
/// outage.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    async fn subscribe(&self, topic: &str) -> Result<Subscription>;
}

/// In-process bus for single-node deployments and tests.
#[derive(Default)]
pub struct LocalBus {
    topics: RwLock<HashMap<String, Vec<mpsc::Sender<Bytes>>>>,
}

impl LocalBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Live subscriptions on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map_or(0, |subs| subs.iter().filter(|tx| !tx.is_closed()).count())
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        // Delivery happens under the write lock so concurrent publishers are
        // serialized and every subscriber observes the same order.
        let mut topics = self.topics.write();
        let Some(subscribers) = topics.get_mut(topic) else {
            return Ok(());
        };

        subscribers.retain(|tx| match tx.try_send(payload.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(topic = %topic, "Subscriber queue full, dropping payload");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        debug!(topic = %topic, subscribers = subscribers.len(), "Published to local bus");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.topics.write().entry(topic.to_string()).or_default().push(tx);
        Ok(rx)
    }
}
