//! Plain HTTP forwarding
//!
//! Requests are replayed against the selected backend with hop-by-hop
//! headers removed and the client address appended to `X-Forwarded-For`.
//! The backend response is relayed back with its status and headers.

use std::net::SocketAddr;

use axum::{
    body::{to_bytes, Body},
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue},
    response::Response,
};

use crate::{
    error::{ProxyError, ProxyResult},
    pool::Backend,
    GatewayState,
};

/// Largest request body accepted for forwarding
const MAX_FORWARD_BODY: usize = 1024 * 1024;

/// Headers that describe a single transport hop and are never forwarded
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Append the client IP to an existing `X-Forwarded-For` chain
pub fn append_forwarded_for(headers: &mut HeaderMap, client_addr: SocketAddr) {
    let client_ip = client_addr.ip().to_string();
    let chain = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.trim().is_empty() => format!("{existing}, {client_ip}"),
        _ => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&chain) {
        headers.insert("x-forwarded-for", value);
    }
}

fn path_and_query(request: &Request) -> String {
    request
        .uri()
        .path_and_query()
        .map_or_else(|| request.uri().path().to_string(), |pq| pq.as_str().to_string())
}

/// Handler for `/messages` and anything below it
pub async fn forward_handler(
    State(state): State<GatewayState>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> ProxyResult<Response> {
    let backend = state.pool.select().clone();
    forward_request(&state.client, &backend, client_addr, request).await
}

pub async fn forward_request(
    client: &reqwest::Client,
    backend: &Backend,
    client_addr: SocketAddr,
    request: Request,
) -> ProxyResult<Response> {
    let target = backend.url_for(&path_and_query(&request));
    tracing::debug!(target = %target, "Proxying request");

    let (parts, body) = request.into_parts();
    let body = to_bytes(body, MAX_FORWARD_BODY)
        .await
        .map_err(|e| annony_core::Error::InvalidInput(format!("failed to read request body: {e}")))?;

    let mut headers = HeaderMap::with_capacity(parts.headers.len() + 1);
    for (name, value) in &parts.headers {
        if is_hop_by_hop(name) || name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    append_forwarded_for(&mut headers, client_addr);

    let upstream = client
        .request(parts.method, &target)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| ProxyError::upstream(format!("request to {target} failed: {e}")))?;

    let status = upstream.status();
    let response_headers = upstream.headers().clone();
    let body_bytes = upstream
        .bytes()
        .await
        .map_err(|e| ProxyError::upstream(format!("failed to read response from {target}: {e}")))?;

    let mut response = Response::new(Body::from(body_bytes));
    *response.status_mut() = status;
    for (name, value) in &response_headers {
        if is_hop_by_hop(name) || name == header::CONTENT_LENGTH {
            continue;
        }
        response.headers_mut().append(name.clone(), value.clone());
    }
    Ok(response)
}
