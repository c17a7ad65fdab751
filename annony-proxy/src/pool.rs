//! Backend selection
//!
//! Every proxied request asks the [`BackendPool`] for a target. Selection is
//! delegated to a [`Balancer`] so a load-aware strategy can replace the
//! default round-robin without touching the forwarding code.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use url::Url;

/// One message instance behind the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    base_url: String,
    authority: String,
}

impl Backend {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let url = Url::parse(raw.trim()).with_context(|| format!("invalid backend URL '{raw}'"))?;
        if url.scheme() != "http" {
            bail!("unsupported backend scheme '{}' in '{raw}'", url.scheme());
        }
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("backend URL '{raw}' has no host"))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| anyhow!("backend URL '{raw}' has no port"))?;

        Ok(Self {
            base_url: url.as_str().trim_end_matches('/').to_string(),
            authority: format!("{host}:{port}"),
        })
    }

    /// `host:port`, used for raw TCP connects and the rewritten `Host` header
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Absolute URL for a request path (`/messages?limit=10`)
    pub fn url_for(&self, path_and_query: &str) -> String {
        format!("{}{}", self.base_url, path_and_query)
    }
}

/// Picks the index of the backend for the next request
pub trait Balancer: Send + Sync {
    fn pick(&self, backends: &[Backend]) -> usize;
}

#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl Balancer for RoundRobin {
    fn pick(&self, backends: &[Backend]) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % backends.len().max(1)
    }
}

/// Static set of backends for the lifetime of the process
#[derive(Clone)]
pub struct BackendPool {
    backends: Arc<[Backend]>,
    balancer: Arc<dyn Balancer>,
}

impl BackendPool {
    pub fn new(urls: &[String]) -> anyhow::Result<Self> {
        Self::with_balancer(urls, Arc::new(RoundRobin::default()))
    }

    pub fn with_balancer(urls: &[String], balancer: Arc<dyn Balancer>) -> anyhow::Result<Self> {
        let backends = urls
            .iter()
            .map(|url| Backend::parse(url))
            .collect::<anyhow::Result<Vec<_>>>()?;
        if backends.is_empty() {
            bail!("at least one backend URL is required");
        }
        Ok(Self {
            backends: backends.into(),
            balancer,
        })
    }

    pub fn select(&self) -> &Backend {
        let index = self.balancer.pick(&self.backends) % self.backends.len();
        &self.backends[index]
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl std::fmt::Debug for BackendPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendPool")
            .field("backends", &self.backends)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_backend_parse() {
        let backend = Backend::parse("http://chat-1:3001/").unwrap();
        assert_eq!(backend.authority(), "chat-1:3001");
        assert_eq!(backend.url_for("/messages?limit=5"), "http://chat-1:3001/messages?limit=5");

        let default_port = Backend::parse("http://chat-2").unwrap();
        assert_eq!(default_port.authority(), "chat-2:80");
    }

    #[test]
    fn test_backend_parse_rejects_bad_urls() {
        assert!(Backend::parse("not a url").is_err());
        assert!(Backend::parse("https://chat:443").is_err());
    }

    #[test]
    fn test_round_robin_cycles() {
        let pool = BackendPool::new(&urls(&["http://a:1", "http://b:2", "http://c:3"])).unwrap();
        let picked: Vec<_> = (0..6).map(|_| pool.select().authority().to_string()).collect();
        assert_eq!(picked, vec!["a:1", "b:2", "c:3", "a:1", "b:2", "c:3"]);
    }

    #[test]
    fn test_single_backend_pool() {
        let pool = BackendPool::new(&urls(&["http://127.0.0.1:3001"])).unwrap();
        for _ in 0..3 {
            assert_eq!(pool.select().authority(), "127.0.0.1:3001");
        }
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_empty_pool_rejected() {
        assert!(BackendPool::new(&[]).is_err());
    }

    #[test]
    fn test_custom_balancer() {
        struct Last;
        impl Balancer for Last {
            fn pick(&self, backends: &[Backend]) -> usize {
                backends.len() - 1
            }
        }

        let pool =
            BackendPool::with_balancer(&urls(&["http://a:1", "http://b:2"]), Arc::new(Last)).unwrap();
        assert_eq!(pool.select().authority(), "b:2");
    }
}
