//! Edge gateway
//!
//! Rate-limits clients by address, forwards `/messages` as plain HTTP and
//! relays upgraded chat streams byte-for-byte to a pool of message
//! instances.

pub mod error;
pub mod forward;
pub mod middleware;
pub mod pool;
pub mod relay;

use std::time::Duration;

use axum::{
    http::Method,
    middleware::from_fn_with_state,
    routing::{any, get},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use annony_core::{config::GatewayConfig, service::RateLimiter};

pub use error::{ProxyError, ProxyResult};
pub use pool::{Backend, BackendPool, Balancer, RoundRobin};

/// Shared gateway state
#[derive(Clone)]
pub struct GatewayState {
    pub pool: BackendPool,
    pub limiter: RateLimiter,
    pub client: reqwest::Client,
    pub handshake_timeout: Duration,
    pub trust_forwarded_for: bool,
    pub stream_path: String,
}

impl GatewayState {
    pub fn new(config: &GatewayConfig, limiter: RateLimiter) -> anyhow::Result<Self> {
        let pool = BackendPool::new(&config.backend_urls)?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.handshake_timeout_seconds))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {e}"))?;

        Ok(Self {
            pool,
            limiter,
            client,
            handshake_timeout: Duration::from_secs(config.handshake_timeout_seconds),
            trust_forwarded_for: config.trust_forwarded_for,
            stream_path: config.stream_path.clone(),
        })
    }
}

/// Create the gateway router.
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()`; the
/// client address drives both admission control and `X-Forwarded-For`.
pub fn create_gateway_router(state: GatewayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let proxied = Router::new()
        .route("/messages", any(forward::forward_handler))
        .route("/messages/{*rest}", any(forward::forward_handler))
        .route(&state.stream_path, any(relay::relay_handler))
        .route_layer(from_fn_with_state(state.clone(), middleware::rate_limit_middleware));

    Router::new()
        .merge(proxied)
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}
