use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{clock::Clock, clock::DefaultClock, DefaultKeyedRateLimiter, Quota, RateLimiter as GovernorRateLimiter};
use nonzero_ext::nonzero;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RateLimitConfig;

/// Reason returned to clients whose requests are refused.
pub const RATE_LIMIT_REASON: &str = "Too many messages, slow down.";

const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("Too many messages, slow down. Try again in {retry_after_seconds}s")]
    RateLimitExceeded { retry_after_seconds: u64 },
}

impl RateLimitError {
    #[must_use]
    pub const fn retry_after_seconds(&self) -> u64 {
        match self {
            Self::RateLimitExceeded { retry_after_seconds } => *retry_after_seconds,
        }
    }
}

/// Per-client admission control backed by the `governor` crate (GCRA).
///
/// Each key holds up to `max_requests` tokens refilled evenly over
/// `window_seconds`. Checks never block and never queue; an exhausted key is
/// refused until a token is replenished.
#[derive(Clone)]
pub struct RateLimiter {
    limiter: Arc<DefaultKeyedRateLimiter<String>>,
    max_requests: u32,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::with_quota(config.max_requests, Duration::from_secs(config.window_seconds))
    }

    #[must_use]
    pub fn with_quota(max_requests: u32, window: Duration) -> Self {
        let burst = NonZeroU32::new(max_requests).unwrap_or(nonzero!(1u32));
        // One cell per (window / max_requests), bursting up to max_requests.
        let period = window
            .checked_div(burst.get())
            .filter(|p| !p.is_zero())
            .unwrap_or(Duration::from_millis(1));
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(burst))
            .allow_burst(burst);

        Self {
            limiter: Arc::new(GovernorRateLimiter::keyed(quota)),
            max_requests: burst.get(),
        }
    }

    /// Consume one token for `key`. Returns `false` when the key is exhausted.
    #[must_use]
    pub fn allow(&self, key: &str) -> bool {
        self.check(key).is_ok()
    }

    /// Like [`allow`](Self::allow) but reports how long until the next token.
    pub fn check(&self, key: &str) -> Result<(), RateLimitError> {
        match self.limiter.check_key(&key.to_string()) {
            Ok(()) => Ok(()),
            Err(not_until) => {
                let wait = not_until.wait_time_from(DefaultClock::default().now());
                Err(RateLimitError::RateLimitExceeded {
                    retry_after_seconds: wait.as_secs().max(1),
                })
            }
        }
    }

    #[must_use]
    pub const fn max_requests(&self) -> u32 {
        self.max_requests
    }

    /// Number of keys currently tracked.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.limiter.len()
    }

    /// Drop buckets that have fully refilled.
    pub fn prune(&self) {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
    }

    /// Periodically prune idle buckets until `cancel` fires.
    pub fn spawn_pruner(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PRUNE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        limiter.prune();
                        debug!(tracked_keys = limiter.tracked_keys(), "Pruned idle rate limit buckets");
                    }
                }
            }
        })
    }
}
