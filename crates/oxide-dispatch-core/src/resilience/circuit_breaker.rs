//! Circuit breaker per external dependency
//!
//! Counts dependency-level failures (timeouts, 5xx, connection errors) in a
//! rolling window. At the threshold the breaker opens and sheds every call
//! for `cooldown`; then exactly one probe is let through. A successful probe
//! closes the breaker, a failed one re-opens it for a fresh cooldown.
//!
//! Credential-level 429s are not failures here: rotating keys fixes those.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Breaker state machine position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls pass through
    Closed,
    /// Calls are rejected until the cooldown elapses
    Open,
    /// One probe call decides between `Closed` and `Open`
    HalfOpen,
}

/// Breaker thresholds
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within `window` that open the breaker
    pub failure_threshold: u32,
    /// Rolling window for counting failures
    pub window: Duration,
    /// How long the breaker stays open before probing
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold
    #[must_use]
    pub const fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the rolling window failures are counted in
    #[must_use]
    pub const fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Set the open-state cooldown
    #[must_use]
    pub const fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

/// Admission ticket returned by [`CircuitBreaker::allow`]; hand it back to
/// [`CircuitBreaker::record_result`].
#[derive(Debug)]
#[must_use = "a permit must be returned through record_result"]
pub struct BreakerPermit {
    probe: bool,
}

impl BreakerPermit {
    /// Whether this call is the half-open probe
    #[must_use]
    pub const fn is_probe(&self) -> bool {
        self.probe
    }
}

/// Call shed by an open breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerRejected {
    /// Dependency the breaker protects
    pub dependency: String,
    /// Time until a probe will be admitted
    pub retry_after: Duration,
}

/// Point-in-time breaker view
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    /// Protected dependency
    pub dependency: String,
    /// Current state
    pub state: BreakerState,
    /// Failures counted in the current window
    pub failure_count: usize,
    /// Remaining open time, if currently open.
    pub open_remaining: Option<Duration>,
    /// Whether a half-open probe is outstanding
    pub probe_in_flight: bool,
}

#[derive(Debug)]
struct State {
    state: BreakerState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probe_started_at: Option<Instant>,
}

/// Circuit breaker for one provider
#[derive(Debug)]
pub struct CircuitBreaker {
    dependency: String,
    cfg: CircuitBreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    /// Create a closed breaker for `dependency`
    #[must_use]
    pub fn new(dependency: &str, cfg: CircuitBreakerConfig) -> Self {
        Self {
            dependency: dependency.to_string(),
            cfg,
            state: Mutex::new(State {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                probe_started_at: None,
            }),
        }
    }

    /// Dependency this breaker protects
    #[must_use]
    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask to make a call.
    ///
    /// # Errors
    ///
    /// Returns `BreakerRejected` while open, or while the half-open probe is
    /// still in flight.
    pub fn allow(&self) -> Result<BreakerPermit, BreakerRejected> {
        let now = Instant::now();
        let mut st = self.lock();
        match st.state {
            BreakerState::Closed => Ok(BreakerPermit { probe: false }),
            BreakerState::Open => {
                let reopen_at = st.opened_at.map_or(now, |at| at + self.cfg.cooldown);
                if now < reopen_at {
                    return Err(self.rejected(reopen_at - now));
                }
                st.state = BreakerState::HalfOpen;
                st.probe_started_at = Some(now);
                info!(dependency = %self.dependency, "Circuit breaker half-open, probing");
                Ok(BreakerPermit { probe: true })
            }
            BreakerState::HalfOpen => {
                // A probe whose caller vanished must not wedge the breaker.
                let stale = st
                    .probe_started_at
                    .is_none_or(|at| now.duration_since(at) >= self.cfg.cooldown);
                if stale {
                    st.probe_started_at = Some(now);
                    return Ok(BreakerPermit { probe: true });
                }
                Err(self.rejected(self.cfg.cooldown))
            }
        }
    }

    /// Report the outcome of a permitted call.
    ///
    /// `success` is `false` only for dependency-level failures.
    pub fn record_result(&self, permit: BreakerPermit, success: bool) {
        let now = Instant::now();
        let mut st = self.lock();

        if permit.probe {
            st.probe_started_at = None;
            if success {
                st.state = BreakerState::Closed;
                st.failures.clear();
                st.opened_at = None;
                info!(dependency = %self.dependency, "Circuit breaker closed after successful probe");
            } else {
                self.open(&mut st, now);
            }
            return;
        }

        if st.state != BreakerState::Closed {
            // Late result of a call admitted before the breaker opened.
            return;
        }

        // Successes do not clear earlier failures; those age out of the window.
        if success {
            return;
        }

        st.failures.push_back(now);
        while st
            .failures
            .front()
            .is_some_and(|at| now.duration_since(*at) > self.cfg.window)
        {
            st.failures.pop_front();
        }
        if st.failures.len() >= self.cfg.failure_threshold as usize {
            self.open(&mut st, now);
        }
    }

    /// Hand back a permit whose call never reached the dependency.
    ///
    /// Frees the half-open probe slot so the next caller can probe.
    pub fn release(&self, permit: BreakerPermit) {
        if permit.probe {
            let mut st = self.lock();
            if st.state == BreakerState::HalfOpen {
                st.probe_started_at = None;
            }
        }
    }

    fn open(&self, st: &mut State, now: Instant) {
        st.state = BreakerState::Open;
        st.opened_at = Some(now);
        st.probe_started_at = None;
        warn!(
            dependency = %self.dependency,
            failures = st.failures.len(),
            cooldown_secs = self.cfg.cooldown.as_secs(),
            "Circuit breaker opened"
        );
    }

    fn rejected(&self, retry_after: Duration) -> BreakerRejected {
        BreakerRejected {
            dependency: self.dependency.clone(),
            retry_after,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Point-in-time view for health reporting
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = Instant::now();
        let st = self.lock();
        let open_remaining = match (st.state, st.opened_at) {
            (BreakerState::Open, Some(at)) => {
                let until = at + self.cfg.cooldown;
                (until > now).then(|| until - now)
            }
            _ => None,
        };
        BreakerSnapshot {
            dependency: self.dependency.clone(),
            state: st.state,
            failure_count: st.failures.len(),
            open_remaining,
            probe_in_flight: st.probe_started_at.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "gemini",
            CircuitBreakerConfig::new()
                .with_failure_threshold(threshold)
                .with_cooldown(Duration::from_secs(cooldown_secs)),
        )
    }

    fn fail(cb: &CircuitBreaker) {
        let permit = cb.allow().expect("breaker should admit");
        cb.record_result(permit, false);
    }

    #[test]
    fn test_circuit_breaker_config_defaults() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.cooldown, Duration::from_secs(30));
        assert_eq!(config.window, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_threshold() {
        let cb = breaker(3, 30);
        fail(&cb);
        fail(&cb);
        assert_eq!(cb.state(), BreakerState::Closed);
        fail(&cb);
        assert_eq!(cb.state(), BreakerState::Open);

        let rejected = cb.allow().expect_err("open breaker must reject");
        assert_eq!(rejected.retry_after, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_probe_after_cooldown() {
        let cb = breaker(2, 30);
        fail(&cb);
        fail(&cb);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(cb.allow().is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        let probe = cb.allow().expect("probe admitted");
        assert!(probe.is_probe());
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert!(cb.allow().is_err(), "only one probe may be in flight");

        cb.record_result(probe, true);
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.snapshot().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens_for_fresh_cooldown() {
        let cb = breaker(1, 10);
        fail(&cb);
        tokio::time::advance(Duration::from_secs(10)).await;

        let probe = cb.allow().expect("probe admitted");
        cb.record_result(probe, false);
        assert_eq!(cb.state(), BreakerState::Open);
        assert_eq!(
            cb.snapshot().open_remaining,
            Some(Duration::from_secs(10))
        );

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(cb.allow().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_are_forgotten() {
        let cb = CircuitBreaker::new(
            "gemini",
            CircuitBreakerConfig::new()
                .with_failure_threshold(3)
                .with_window(Duration::from_secs(10)),
        );
        fail(&cb);
        fail(&cb);
        tokio::time::advance(Duration::from_secs(11)).await;
        fail(&cb);
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.snapshot().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interleaved_successes_do_not_hide_failures() {
        let cb = breaker(5, 30);
        for _ in 0..2 {
            for _ in 0..2 {
                fail(&cb);
            }
            let permit = cb.allow().expect("closed");
            cb.record_result(permit, true);
            tokio::time::advance(Duration::from_secs(5)).await;
        }
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.snapshot().failure_count, 4);

        fail(&cb);
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_probe_resets_failures() {
        let cb = breaker(2, 10);
        fail(&cb);
        fail(&cb);
        tokio::time::advance(Duration::from_secs(10)).await;
        let probe = cb.allow().expect("probe admitted");
        cb.record_result(probe, true);
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.snapshot().failure_count, 0);

        fail(&cb);
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_probe_frees_the_slot() {
        let cb = breaker(1, 10);
        fail(&cb);
        tokio::time::advance(Duration::from_secs(10)).await;
        let probe = cb.allow().expect("probe admitted");
        cb.release(probe);
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        let probe = cb.allow().expect("slot freed");
        assert!(probe.is_probe());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_probe_is_replaced_after_cooldown() {
        let cb = breaker(1, 10);
        fail(&cb);
        tokio::time::advance(Duration::from_secs(10)).await;
        let _lost_probe = cb.allow().expect("probe admitted");

        tokio::time::advance(Duration::from_secs(10)).await;
        let probe = cb.allow().expect("stale probe replaced");
        assert!(probe.is_probe());
        cb.record_result(probe, true);
        assert_eq!(cb.state(), BreakerState::Closed);
    }
}
