//! Message instance lifecycle
//!
//! Startup: history store (and welcome seed) → message bus → HTTP/WebSocket
//! listener. Shutdown: stop accepting, drain live connections, stop the bus,
//! close the database pool.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use annony_api::{create_router, AppState, MessageService};
use annony_cluster::sync::{ClusterConfig, ClusterManager, ConnectionLimits, ConnectionRegistry};
use annony_core::{
    repository::{HistoryStore, MemoryHistoryStore, PgHistoryStore},
    Config,
};

use crate::{migrations, shutdown::shutdown_signal};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A running message instance and everything it owns
pub struct ChatServer {
    config: Config,
    state: AppState,
    pool: Option<PgPool>,
}

/// Build every component and serve until a shutdown signal arrives.
pub async fn run(config: Config, node_id: String) -> anyhow::Result<()> {
    info!(node_id = %node_id, "Annony chat instance starting...");
    ChatServer::build(config, node_id).await?.start().await
}

impl ChatServer {
    pub async fn build(config: Config, node_id: String) -> anyhow::Result<Self> {
        // 3. History store
        let (store, pool): (Arc<dyn HistoryStore>, Option<PgPool>) = if config.database.url.is_empty() {
            warn!("Database URL not provided, history is kept in memory only");
            (Arc::new(MemoryHistoryStore::new()), None)
        } else {
            let store = PgHistoryStore::connect(&config.database).await?;
            migrations::run_migrations(store.pool()).await?;
            let pool = store.pool().clone();
            (Arc::new(store), Some(pool))
        };

        // 4. Connection registry
        let registry = Arc::new(ConnectionRegistry::new(ConnectionLimits {
            max_connections: config.chat.max_connections,
            ..ConnectionLimits::default()
        }));

        // 5. Message bus; an unreachable bus aborts startup
        let cluster_config = ClusterConfig {
            redis_url: config.redis.url.clone(),
            node_id,
            topic: config.chat.topic.clone(),
            redis_timeout: Duration::from_secs(config.redis.connect_timeout_seconds),
        };
        let cluster = ClusterManager::start(cluster_config, Arc::clone(&registry))
            .await
            .map_err(|e| {
                error!("Failed to start message bus: {}", e);
                anyhow::anyhow!("Message bus unavailable: {e}")
            })?;
        let cluster = Arc::new(cluster);
        info!(node_id = %cluster.node_id(), topic = %config.chat.topic, "Cluster manager started");

        // 6. Message service
        let message_service = Arc::new(MessageService::new(store, Arc::clone(&cluster), &config.chat));
        if config.chat.seed_welcome {
            // Non-fatal: an empty history is still a working chat
            if let Err(e) = message_service.seed_welcome().await {
                warn!("Failed to seed welcome message: {}", e);
            }
        }

        let state = AppState {
            message_service,
            registry,
            cluster,
            stream_path: config.gateway.stream_path.clone(),
        };

        Ok(Self { config, state, pool })
    }

    /// Serve HTTP and wait for shutdown
    pub async fn start(self) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let http_handle = self.start_http_server(shutdown_rx).await?;
        info!("Chat instance started");

        tokio::select! {
            _ = http_handle => {
                error!("HTTP server stopped unexpectedly");
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
            }
        }

        let _ = shutdown_tx.send(true);
        self.shutdown().await;
        Ok(())
    }

    async fn start_http_server(&self, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<JoinHandle<()>> {
        let http_address = self.config.http_address();
        let listener = tokio::net::TcpListener::bind(&http_address)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_address}: {e}"))?;
        info!("HTTP server listening on {}", http_address);

        let router = create_router(self.state.clone());

        let handle = tokio::spawn(async move {
            let mut rx = shutdown_rx;
            let graceful = async move {
                let _ = rx.changed().await;
            };

            if let Err(e) = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(graceful)
            .await
            {
                error!("HTTP server error: {}", e);
            }

            info!("HTTP server shut down gracefully");
        });

        Ok(handle)
    }

    async fn shutdown(&self) {
        info!("Shutting down chat instance...");

        // 1. Wait for active connections to drain (with timeout)
        let registry = &self.state.registry;
        let active = registry.connection_count();
        if active > 0 {
            info!(
                "Waiting up to {}s for {} active connection(s) to drain...",
                DRAIN_TIMEOUT.as_secs(),
                active
            );
            let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
            loop {
                let remaining = registry.connection_count();
                if remaining == 0 {
                    info!("All connections drained");
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    warn!(
                        "Drain timeout reached with {} connection(s) still active, proceeding with shutdown",
                        remaining
                    );
                    break;
                }
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        }

        // 2. Stop bus tasks
        self.state.cluster.shutdown();

        // 3. Close the database connection pool
        if let Some(pool) = &self.pool {
            info!("Closing database connection pool...");
            pool.close().await;
        }

        let metrics = registry.metrics();
        info!(
            total_attached = metrics.total_attached,
            total_delivered = metrics.total_delivered,
            total_dropped_slow = metrics.total_dropped_slow,
            "Chat instance shut down complete"
        );
    }
}
