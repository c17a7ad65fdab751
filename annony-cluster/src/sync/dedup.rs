//! Envelope deduplication for at-least-once bus delivery
//!
//! A bus may redeliver an envelope after a reconnect. Every envelope carries
//! the publishing node and a per-node sequence number, which together
//! identify it uniquely.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Deduplication key for bus envelopes
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct DedupKey {
    pub node_id: String,
    pub seq: u64,
}

impl DedupKey {
    #[must_use]
    pub fn new(node_id: impl Into<String>, seq: u64) -> Self {
        Self {
            node_id: node_id.into(),
            seq,
        }
    }
}

/// Message deduplicator with periodic cleanup
#[derive(Clone)]
pub struct MessageDeduplicator {
    /// Map of dedup keys to expiration times
    entries: Arc<DashMap<DedupKey, Instant>>,
    dedup_window: Duration,
    cleanup_interval: Duration,
}

impl MessageDeduplicator {
    /// Create a new deduplicator
    ///
    /// # Arguments
    /// * `dedup_window` - How long to remember envelopes
    /// * `cleanup_interval` - How often [`spawn_cleanup`](Self::spawn_cleanup) evicts expired keys
    #[must_use]
    pub fn new(dedup_window: Duration, cleanup_interval: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            dedup_window,
            cleanup_interval,
        }
    }

    /// 60 second window, cleaned every 30 seconds
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(30))
    }

    /// Returns `true` the first time a key is seen within the window.
    #[must_use]
    pub fn should_process(&self, key: &DedupKey) -> bool {
        let now = Instant::now();

        match self.entries.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if *entry.get() > now {
                    return false;
                }
                entry.insert(now + self.dedup_window);
                true
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(now + self.dedup_window);
                true
            }
        }
    }

    /// Evict expired keys periodically until `cancel` fires.
    pub fn spawn_cleanup(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let dedup = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(dedup.cleanup_interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => dedup.cleanup_expired(),
                }
            }
        })
    }

    fn cleanup_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_key, expires_at| *expires_at > now);
    }

    /// Get the number of tracked envelopes
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MessageDeduplicator {
    fn default() -> Self {
        Self::with_defaults()
    }
}
