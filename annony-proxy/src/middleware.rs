// Admission control

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};

use crate::{error::ProxyResult, GatewayState};

/// Rate limit every proxied request by client address before any backend is contacted
pub async fn rate_limit_middleware(
    State(state): State<GatewayState>,
    request: Request,
    next: Next,
) -> ProxyResult<Response> {
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);
    let key = client_key(request.headers(), remote_addr, state.trust_forwarded_for);

    if let Err(e) = state.limiter.check(&key) {
        return Err(annony_core::Error::AdmissionDenied {
            key,
            retry_after_seconds: e.retry_after_seconds(),
        }
        .into());
    }

    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert("x-ratelimit-limit", HeaderValue::from(state.limiter.max_requests()));
    Ok(response)
}

/// Client identity for rate limiting.
///
/// The socket peer address unless forwarded headers are trusted, in which
/// case the first `X-Forwarded-For` hop wins.
pub fn client_key(headers: &HeaderMap, remote_addr: Option<SocketAddr>, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = headers
            .get("X-Forwarded-For")
            .and_then(|h| h.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }

    remote_addr
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forwarded(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("X-Forwarded-For", value.parse().unwrap());
        headers
    }

    #[test]
    fn test_client_key_uses_peer_address() {
        let addr: SocketAddr = "192.0.2.7:5123".parse().unwrap();
        assert_eq!(client_key(&HeaderMap::new(), Some(addr), false), "192.0.2.7");
    }

    #[test]
    fn test_client_key_ignores_untrusted_forwarded_for() {
        let addr: SocketAddr = "192.0.2.7:5123".parse().unwrap();
        assert_eq!(client_key(&forwarded("203.0.113.9"), Some(addr), false), "192.0.2.7");
    }

    #[test]
    fn test_client_key_trusts_first_forwarded_hop() {
        let addr: SocketAddr = "10.0.0.1:80".parse().unwrap();
        let headers = forwarded("203.0.113.9, 10.0.0.5");
        assert_eq!(client_key(&headers, Some(addr), true), "203.0.113.9");
    }

    #[test]
    fn test_client_key_without_address() {
        assert_eq!(client_key(&HeaderMap::new(), None, true), "unknown");
    }
}
