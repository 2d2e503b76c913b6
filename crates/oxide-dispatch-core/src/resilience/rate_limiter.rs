//! Per-caller admission control
//!
//! Sliding-window limiter keyed by Telegram user id. Independent of provider
//! health: it protects the bot (and the shared key pools) from a single user
//! flooding commands. State is in memory only; a restart resets all windows.

use moka::future::Cache;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Telegram user id of the requester
pub type CallerId = i64;

/// Default number of requests per window
pub const DEFAULT_MAX_REQUESTS: usize = 10;
/// Default window length
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Limiter ceiling and window
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Requests admitted per window
    pub max_requests: usize,
    /// Window length
    pub window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_MAX_REQUESTS,
            window: DEFAULT_WINDOW,
        }
    }
}

/// Outcome of [`RateLimiter::try_admit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Request may proceed; it has been counted
    Admitted,
    /// Window is full
    Denied {
        /// Whole seconds until the oldest request leaves the window (at least 1)
        retry_after_secs: u64,
    },
}

type Window = Arc<Mutex<VecDeque<Instant>>>;

/// Sliding-window rate limiter
///
/// Each caller gets its own small lock. The cache has no capacity bound:
/// a window is evicted only after its caller has been idle for the window
/// length, when it can no longer hold a counted request. Memory grows with
/// the number of distinct callers active within one window.
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    windows: Cache<CallerId, Window>,
}

impl RateLimiter {
    /// Create a limiter with the given ceiling
    #[must_use]
    pub fn new(config: RateLimiterConfig) -> Self {
        let windows = Cache::builder().time_to_idle(config.window).build();
        Self { config, windows }
    }

    /// Configured ceiling
    #[must_use]
    pub const fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Admit and record a request from `caller`, or deny it.
    pub async fn try_admit(&self, caller: CallerId) -> Admission {
        let window = self
            .windows
            .get_with(caller, async { Arc::new(Mutex::new(VecDeque::new())) })
            .await;

        let now = Instant::now();
        let mut stamps = window.lock().unwrap_or_else(PoisonError::into_inner);
        while stamps
            .front()
            .is_some_and(|at| now.duration_since(*at) >= self.config.window)
        {
            stamps.pop_front();
        }

        if stamps.len() < self.config.max_requests {
            stamps.push_back(now);
            return Admission::Admitted;
        }

        let oldest = stamps.front().copied().unwrap_or(now);
        let remaining = self
            .config
            .window
            .saturating_sub(now.duration_since(oldest));
        let retry_after_secs = u64::try_from(remaining.as_millis().div_ceil(1000))
            .unwrap_or(u64::MAX)
            .max(1);
        debug!(caller, retry_after_secs, "Caller rate limited");
        Admission::Denied { retry_after_secs }
    }

    /// Requests currently counted for `caller`
    pub async fn in_window(&self, caller: CallerId) -> usize {
        let Some(window) = self.windows.get(&caller).await else {
            return 0;
        };
        let now = Instant::now();
        let stamps = window.lock().unwrap_or_else(PoisonError::into_inner);
        stamps
            .iter()
            .filter(|at| now.duration_since(**at) < self.config.window)
            .count()
    }
}
