//! Resilience primitives
//!
//! Key rotation, circuit breaking, caller admission and retry with fallback.
//! Each primitive owns its own small lock; none of them is ever held across
//! a provider call.

/// Circuit breaker per external dependency
pub mod circuit_breaker;
/// Multi-key credential pools
pub mod key_pool;
/// Per-caller sliding-window limiter
pub mod rate_limiter;
/// Quota reset clocks
pub mod reset;
/// Retry executor with key rotation and model fallback
pub mod retry;

pub use circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig};
pub use key_pool::{Credential, CredentialStatus, KeyPool, KeyPoolConfig};
pub use rate_limiter::{Admission, CallerId, RateLimiter, RateLimiterConfig};
pub use reset::{DailyReset, ResetSchedule, RollingWindow};
pub use retry::{FallbackChain, RetryExecutor, RetryPolicy, Tier};
