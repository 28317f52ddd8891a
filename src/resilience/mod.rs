//! Shared, process-local resilience state: breaker, caches, rate limits.

pub mod cache;
pub mod circuit_breaker;
pub mod rate_limiter;

pub use cache::{BoundedCache, EmbedCache};
pub use circuit_breaker::CircuitBreaker;
pub use rate_limiter::{RateLimitDecision, RateLimiter};
