// Module: sync

pub mod bridge;
pub mod bus;
pub mod cluster_manager;
pub mod connection_registry;
pub mod dedup;
pub mod redis_pubsub;

pub use bridge::{Envelope, MessageHandler, PubSubBridge};
pub use bus::{LocalBus, MessageBus, Subscription};
pub use cluster_manager::{ClusterConfig, ClusterManager};
pub use connection_registry::{
    Connection, ConnectionLimits, ConnectionMetrics, ConnectionRegistry, ConnectionState,
};
pub use dedup::{DedupKey, MessageDeduplicator};
pub use redis_pubsub::{PublishRequest, RedisBus};
