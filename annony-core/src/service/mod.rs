pub mod rate_limit;

pub use rate_limit::{RateLimitError, RateLimiter, RATE_LIMIT_REASON};
