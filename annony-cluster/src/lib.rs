pub mod error;
pub mod sync;

pub use error::{Error, Result};
pub use sync::{
    ClusterConfig, ClusterManager, Connection, ConnectionRegistry, ConnectionState, LocalBus,
    MessageBus, PubSubBridge, RedisBus,
};
