//! Edge gateway lifecycle

use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use annony_core::{service::RateLimiter, Config};
use annony_proxy::{create_gateway_router, GatewayState};

use crate::shutdown::shutdown_signal;

pub async fn run(config: Config) -> anyhow::Result<()> {
    info!("Annony gateway starting...");

    // 3. Backend pool and admission control
    let limiter = RateLimiter::new(&config.rate_limit);
    let state = GatewayState::new(&config.gateway, limiter.clone())?;
    info!(
        backends = ?config.gateway.backend_urls,
        stream_path = %state.stream_path,
        max_requests = config.rate_limit.max_requests,
        window_seconds = config.rate_limit.window_seconds,
        "Gateway configured"
    );

    let cancel = CancellationToken::new();
    let pruner = limiter.spawn_pruner(cancel.clone());

    // 4. Serve
    let http_address = config.http_address();
    let listener = tokio::net::TcpListener::bind(&http_address)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_address}: {e}"))?;
    info!("Gateway listening on {}", http_address);

    let router = create_gateway_router(state);
    if let Err(e) = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    {
        error!("Gateway server error: {}", e);
    }

    cancel.cancel();
    let _ = pruner.await;
    info!("Gateway shut down complete");
    Ok(())
}
