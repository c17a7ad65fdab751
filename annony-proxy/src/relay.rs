//! Upgraded stream relay
//!
//! The client's upgrade request is replayed once against a backend over a
//! fresh HTTP/1.1 connection. `Upgrade`, `Connection` and `Sec-WebSocket-*`
//! headers pass through untouched; only `Host` is rewritten. When the backend
//! answers `101 Switching Protocols` the same response goes back to the
//! client and both upgraded connections are spliced with
//! `copy_bidirectional`. Bytes are never parsed or buffered beyond the copy
//! buffers.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::Response,
};
use bytes::Bytes;
use http_body_util::Empty;
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::{
    error::{ProxyError, ProxyResult},
    forward::{append_forwarded_for, forward_request},
    pool::Backend,
    GatewayState,
};

/// Whether the request asks for a protocol upgrade
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers.contains_key(header::UPGRADE)
        && headers
            .get(header::CONNECTION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.split(',').any(|token| token.trim().eq_ignore_ascii_case("upgrade")))
}

/// Handler for the stream path. Non-upgrade requests (long-polling fallbacks)
/// are forwarded as plain HTTP.
pub async fn relay_handler(
    State(state): State<GatewayState>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> ProxyResult<Response> {
    let backend = state.pool.select().clone();

    if !is_upgrade_request(request.headers()) {
        return forward_request(&state.client, &backend, client_addr, request).await;
    }

    relay_upgrade(&backend, client_addr, request, state.handshake_timeout).await
}

pub async fn relay_upgrade(
    backend: &Backend,
    client_addr: SocketAddr,
    mut request: Request,
    handshake_timeout: Duration,
) -> ProxyResult<Response> {
    let client_upgrade = request
        .extensions_mut()
        .remove::<OnUpgrade>()
        .ok_or_else(|| annony_core::Error::InvalidInput("connection cannot be upgraded".into()))?;

    let upstream_request = build_upstream_request(backend, client_addr, &request)?;

    let handshake = handshake(backend.authority().to_string(), upstream_request);
    let mut upstream_response = tokio::time::timeout(handshake_timeout, handshake)
        .await
        .map_err(|_| ProxyError::HandshakeTimeout(handshake_timeout))??;

    if upstream_response.status() != StatusCode::SWITCHING_PROTOCOLS {
        debug!(status = %upstream_response.status(), "Backend declined upgrade");
        return Ok(upstream_response.map(Body::new));
    }

    let upstream_upgrade = hyper::upgrade::on(&mut upstream_response);
    let (parts, _) = upstream_response.into_parts();

    tokio::spawn(async move {
        match tokio::try_join!(client_upgrade, upstream_upgrade) {
            Ok((client, upstream)) => splice(client, upstream, client_addr).await,
            Err(e) => warn!(error = %e, client = %client_addr, "Upgrade failed"),
        }
    });

    Ok(Response::from_parts(parts, Body::empty()))
}

fn build_upstream_request(
    backend: &Backend,
    client_addr: SocketAddr,
    request: &Request,
) -> ProxyResult<hyper::Request<Empty<Bytes>>> {
    let path = request
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str());

    let mut headers = request.headers().clone();
    let host = HeaderValue::from_str(backend.authority())
        .map_err(|e| ProxyError::upstream(format!("invalid backend authority: {e}")))?;
    headers.insert(header::HOST, host);
    append_forwarded_for(&mut headers, client_addr);

    let mut upstream = hyper::Request::builder()
        .method(request.method().clone())
        .uri(path)
        .body(Empty::<Bytes>::new())
        .map_err(|e| annony_core::Error::InvalidInput(format!("invalid upgrade request: {e}")))?;
    *upstream.headers_mut() = headers;
    Ok(upstream)
}

async fn handshake(
    authority: String,
    request: hyper::Request<Empty<Bytes>>,
) -> ProxyResult<hyper::Response<hyper::body::Incoming>> {
    let stream = TcpStream::connect(&authority)
        .await
        .map_err(|e| ProxyError::upstream(format!("connect to {authority} failed: {e}")))?;

    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| ProxyError::upstream(format!("handshake with {authority} failed: {e}")))?;

    tokio::spawn(async move {
        if let Err(e) = connection.with_upgrades().await {
            debug!(error = %e, "Upstream connection closed with error");
        }
    });

    sender
        .send_request(request)
        .await
        .map_err(|e| ProxyError::upstream(format!("upgrade request to {authority} failed: {e}")))
}

/// Copy bytes both ways until either side closes or errors; both ends are
/// dropped together.
async fn splice(client: Upgraded, upstream: Upgraded, client_addr: SocketAddr) {
    let mut client = TokioIo::new(client);
    let mut upstream = TokioIo::new(upstream);

    info!(client = %client_addr, "Relay established");
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((from_client, from_upstream)) => {
            info!(client = %client_addr, from_client, from_upstream, "Relay closed");
        }
        Err(e) => {
            debug!(client = %client_addr, error = %e, "Relay aborted");
        }
    }
}
