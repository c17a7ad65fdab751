//! Cross-instance broadcast wiring
//!
//! Connects the bus, subscribes this instance's [`ConnectionRegistry`] to the
//! broadcast topic and exposes publishing to the message service.

use annony_core::models::Message;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::bridge::{MessageHandler, PubSubBridge};
use super::bus::{LocalBus, MessageBus};
use super::connection_registry::ConnectionRegistry;
use super::redis_pubsub::RedisBus;
use crate::Result;

/// Cluster configuration
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Redis connection URL; empty runs in single-node mode
    pub redis_url: String,
    /// Unique identifier for this node
    pub node_id: String,
    /// Broadcast topic
    pub topic: String,
    /// Connect and per-command timeout for Redis
    pub redis_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            redis_url: String::new(),
            node_id: format!("node_{}", nanoid::nanoid!(8)),
            topic: "annony:chat".to_string(),
            redis_timeout: RedisBus::DEFAULT_TIMEOUT,
        }
    }
}

/// Cluster synchronization manager
pub struct ClusterManager {
    bridge: PubSubBridge,
    topic: String,
    redis_bus: Option<Arc<RedisBus>>,
}

impl ClusterManager {
    /// Connect the configured bus and start delivering to `registry`.
    ///
    /// An unreachable bus fails with [`Error::BusUnavailable`](crate::Error::BusUnavailable).
    pub async fn start(config: ClusterConfig, registry: Arc<ConnectionRegistry>) -> Result<Self> {
        let (bus, redis_bus): (Arc<dyn MessageBus>, Option<Arc<RedisBus>>) =
            if config.redis_url.is_empty() {
                warn!("Redis URL not provided, running in single-node mode");
                (Arc::new(LocalBus::new()), None)
            } else {
                let redis = Arc::new(RedisBus::connect(&config.redis_url, config.redis_timeout).await?);
                (Arc::clone(&redis) as Arc<dyn MessageBus>, Some(redis))
            };

        Self::with_bus(bus, config, registry, redis_bus).await
    }

    /// Start on an existing bus (shared in-process bus, tests).
    pub async fn start_with_bus(
        bus: Arc<dyn MessageBus>,
        config: ClusterConfig,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<Self> {
        Self::with_bus(bus, config, registry, None).await
    }

    async fn with_bus(
        bus: Arc<dyn MessageBus>,
        config: ClusterConfig,
        registry: Arc<ConnectionRegistry>,
        redis_bus: Option<Arc<RedisBus>>,
    ) -> Result<Self> {
        let bridge = PubSubBridge::new(bus, config.node_id.clone());
        let handler: Arc<dyn MessageHandler> = registry;
        bridge.subscribe(&config.topic, handler).await?;

        info!(node_id = %config.node_id, topic = %config.topic, "Cluster manager started");

        Ok(Self {
            bridge,
            topic: config.topic,
            redis_bus,
        })
    }

    /// Broadcast `message` to every instance, this one included
    pub async fn publish(&self, message: &Message) -> Result<()> {
        self.bridge.publish(&self.topic, message).await
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        self.bridge.node_id()
    }

    /// Whether the backplane is currently reachable
    #[must_use]
    pub fn is_bus_connected(&self) -> bool {
        self.redis_bus.as_ref().is_none_or(|bus| bus.is_connected())
    }

    pub fn shutdown(&self) {
        info!("Shutting down cluster manager");
        self.bridge.shutdown();
        if let Some(bus) = &self.redis_bus {
            bus.shutdown();
        }
    }
}
