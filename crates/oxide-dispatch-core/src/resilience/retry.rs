//! Retry executor with key rotation and model fallback
//!
//! Drives one logical request through a [`FallbackChain`]: each tier is a
//! model backed by a key pool and guarded by its provider's circuit breaker.
//! Every provider response is first turned into a `Step` that says what
//! happens next, so fallback is ordinary control flow instead of a special
//! error bubbling up.
//!
//! Budget rules:
//! - dependency errors always count and back off exponentially with jitter;
//! - a rate-limited key is free to retry while another key is ready, counted
//!   otherwise;
//! - a quota-exhausted key does not count (the key simply leaves rotation);
//! - free retries are capped at the number of keys in the chain, so a
//!   provider that keeps answering 429 with a zero hint cannot spin forever;
//! - a rejected payload ends the request at once.

use super::circuit_breaker::{BreakerPermit, BreakerRejected, BreakerState, CircuitBreaker};
use super::key_pool::{Credential, KeyLease, KeyPool};
use crate::error::DispatchError;
use crate::llm::{ModelSpec, ProviderOutcome, ProviderResult};
use std::fmt;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_retry::strategy::jitter;
use tracing::{debug, info, instrument, warn};

/// Upper bound for a single backoff sleep
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Retry budget and backoff shape
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts counted against the budget before giving up
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Growth factor per retry
    pub multiplier: f64,
    /// Relative jitter, e.g. 0.25 for ±25%
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Check the policy for values that would loop or panic.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for zero attempts, a multiplier below 1 or a
    /// jitter outside `[0, 1)`.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.max_attempts == 0 {
            return Err(DispatchError::Configuration(
                "retry_max_attempts must be at least 1".to_string(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(DispatchError::Configuration(
                "retry_multiplier must be a finite number >= 1".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(DispatchError::Configuration(
                "retry_jitter must be within [0, 1)".to_string(),
            ));
        }
        Ok(())
    }

    /// Nominal delay before retry number `retry` (0-based): `base * multiplier^retry`.
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if secs.is_finite() && secs < MAX_BACKOFF.as_secs_f64() {
            Duration::from_secs_f64(secs.max(0.0))
        } else {
            MAX_BACKOFF
        }
    }

    /// `nominal` spread uniformly over `[nominal * (1 - j), nominal * (1 + j))`.
    #[must_use]
    pub fn jittered(&self, nominal: Duration) -> Duration {
        let j = self.jitter.clamp(0.0, 1.0);
        nominal.mul_f64(1.0 - j) + jitter(nominal.mul_f64(2.0 * j))
    }
}

/// One model in a fallback chain, with the pool and breaker that serve it
#[derive(Debug, Clone)]
pub struct Tier {
    /// Model to call
    pub model: ModelSpec,
    /// Keys for the model's (provider, class)
    pub pool: KeyPool,
    /// Breaker for the model's provider
    pub breaker: Arc<CircuitBreaker>,
}

/// Ordered tiers tried on exhaustion or breaker rejection
#[derive(Debug, Clone)]
pub struct FallbackChain {
    tiers: Vec<Tier>,
}

impl FallbackChain {
    /// Build a chain, primary tier first.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` when `tiers` is empty.
    pub fn new(tiers: Vec<Tier>) -> Result<Self, DispatchError> {
        if tiers.is_empty() {
            return Err(DispatchError::Configuration(
                "fallback chain has no usable tier".to_string(),
            ));
        }
        Ok(Self { tiers })
    }

    /// Tiers in order
    #[must_use]
    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    /// The preferred tier
    #[must_use]
    pub fn primary(&self) -> &Tier {
        // `new` guarantees at least one tier.
        &self.tiers[0]
    }

    fn total_keys(&self) -> usize {
        self.tiers.iter().map(|t| t.pool.len()).sum()
    }
}

impl fmt::Display for FallbackChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, tier) in self.tiers.iter().enumerate() {
            if i > 0 {
                f.write_str(" -> ")?;
            }
            write!(f, "{}", tier.model)?;
        }
        Ok(())
    }
}

/// What the task receives for one attempt
#[derive(Debug, Clone)]
pub struct AttemptContext {
    /// 1-based attempt number within the request
    pub attempt: u32,
    /// Leased credential
    pub credential: Credential,
    /// Model of the current tier
    pub model: ModelSpec,
}

/// How a single attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Provider returned a result
    Succeeded,
    /// Key was throttled
    RateLimited,
    /// Key's daily quota was spent
    QuotaExhausted,
    /// Provider-side failure
    DependencyError(String),
    /// Payload refused
    Rejected(String),
}

/// Record of one try within a request
#[derive(Debug, Clone)]
pub struct Attempt {
    /// 1-based attempt number
    pub attempt_number: u32,
    /// Model tried
    pub model: ModelSpec,
    /// Credential id used
    pub credential_id: String,
    /// When the provider call started
    pub started_at: Instant,
    /// How it ended
    pub outcome: AttemptOutcome,
}

/// Successful request
#[derive(Debug, Clone)]
pub struct Completion {
    /// Provider output
    pub result: ProviderResult,
    /// Model that produced it
    pub model: ModelSpec,
    /// Every attempt made, in order
    pub attempts: Vec<Attempt>,
}

/// Decision taken after one attempt
#[derive(Debug)]
enum Step {
    /// Done
    Complete(ProviderResult),
    /// Try the same tier again
    Retry { counted: bool, back_off: bool },
    /// This tier cannot serve the request any more; move down the chain
    RetryWithFallback { counted: bool },
    /// Stop with this error
    Terminal(DispatchError),
}

/// Why the last attempt failed
#[derive(Debug, Clone)]
enum Cause {
    Dependency(String),
    Throttled,
}

/// Bookkeeping for one `execute` call
struct Run<'a> {
    chain: &'a FallbackChain,
    tier: usize,
    budget_used: u32,
    free_retries: usize,
    free_cap: usize,
    last_cause: Cause,
    attempts: Vec<Attempt>,
    exhausted_wait: Option<Duration>,
    breaker_wait: Option<(String, Duration)>,
}

impl<'a> Run<'a> {
    fn new(chain: &'a FallbackChain) -> Self {
        Self {
            chain,
            tier: 0,
            budget_used: 0,
            free_retries: 0,
            free_cap: chain.total_keys(),
            last_cause: Cause::Throttled,
            attempts: Vec::new(),
            exhausted_wait: None,
            breaker_wait: None,
        }
    }

    fn note_exhausted(&mut self, wait: Duration) {
        self.exhausted_wait = Some(self.exhausted_wait.map_or(wait, |w| w.min(wait)));
    }

    fn note_breaker(&mut self, rejected: BreakerRejected) {
        let sooner = self
            .breaker_wait
            .as_ref()
            .is_none_or(|(_, wait)| rejected.retry_after < *wait);
        if sooner {
            self.breaker_wait = Some((rejected.dependency, rejected.retry_after));
        }
    }

    /// Moves past `tier`, remembering when it could serve again.
    fn leave_tier(&mut self, tier: &Tier) {
        if let Some(wait) = tier.pool.next_available_in() {
            self.note_exhausted(wait);
        }
        if let Some(remaining) = tier.breaker.snapshot().open_remaining {
            self.note_breaker(BreakerRejected {
                dependency: tier.breaker.dependency().to_string(),
                retry_after: remaining,
            });
        }
        self.tier += 1;
    }

    /// Breaker permit plus key lease for `tier`, or `None` if the tier must
    /// be skipped.
    async fn admit(&mut self, tier: &Tier) -> Option<(BreakerPermit, KeyLease)> {
        let permit = match tier.breaker.allow() {
            Ok(permit) => permit,
            Err(rejected) => {
                info!(
                    model = %tier.model,
                    dependency = %rejected.dependency,
                    retry_after_secs = rejected.retry_after.as_secs(),
                    "Breaker open, falling back"
                );
                self.note_breaker(rejected);
                return None;
            }
        };

        match tier.pool.acquire().await {
            Ok(lease) => Some((permit, lease)),
            Err(exhausted) => {
                tier.breaker.release(permit);
                info!(
                    model = %tier.model,
                    retry_after_secs = exhausted.retry_after.as_secs(),
                    "Key pool exhausted, falling back"
                );
                self.note_exhausted(exhausted.retry_after);
                None
            }
        }
    }

    /// One provider call plus settlement of key and breaker.
    async fn attempt<F, Fut>(
        &mut self,
        tier: &Tier,
        permit: BreakerPermit,
        lease: KeyLease,
        task: &mut F,
    ) -> Step
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = ProviderOutcome>,
    {
        let attempt_number = u32::try_from(self.attempts.len() + 1).unwrap_or(u32::MAX);
        let credential_id = lease.credential().id().to_string();
        let context = AttemptContext {
            attempt: attempt_number,
            credential: lease.credential().clone(),
            model: tier.model.clone(),
        };

        let started_at = Instant::now();
        let outcome = task(context).await;

        let free_left = self.free_retries < self.free_cap;
        let (step, recorded) = settle(tier, lease, permit, outcome, free_left);
        debug!(
            attempt = attempt_number,
            model = %tier.model,
            credential = %credential_id,
            outcome = ?recorded,
            "Attempt finished"
        );

        self.last_cause = match &recorded {
            AttemptOutcome::DependencyError(_) => Cause::Dependency(tier.model.provider.clone()),
            _ => Cause::Throttled,
        };
        self.attempts.push(Attempt {
            attempt_number,
            model: tier.model.clone(),
            credential_id,
            started_at,
            outcome: recorded,
        });
        step
    }

    /// Error for "every tier was skipped".
    fn chain_exhausted(&self) -> DispatchError {
        match (&self.breaker_wait, self.exhausted_wait) {
            (Some((dependency, breaker)), Some(keys)) if *breaker < keys => {
                DispatchError::DependencyUnavailable {
                    dependency: dependency.clone(),
                    retry_after: Some(*breaker),
                }
            }
            (_, Some(keys)) => DispatchError::AllKeysExhausted { retry_after: keys },
            (Some((dependency, breaker)), None) => DispatchError::DependencyUnavailable {
                dependency: dependency.clone(),
                retry_after: Some(*breaker),
            },
            (None, None) => DispatchError::Configuration(format!(
                "no tier of {} could be tried",
                self.chain
            )),
        }
    }

    /// Error for "the retry budget ran out on `tier`".
    fn budget_exhausted(&self, tier: &Tier) -> DispatchError {
        match &self.last_cause {
            Cause::Dependency(dependency) => DispatchError::DependencyUnavailable {
                dependency: dependency.clone(),
                retry_after: tier.breaker.snapshot().open_remaining,
            },
            Cause::Throttled => {
                let current = tier.pool.next_available_in();
                let earliest = match (current, self.exhausted_wait) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                DispatchError::AllKeysExhausted {
                    retry_after: earliest.unwrap_or(Duration::ZERO),
                }
            }
        }
    }
}

/// Reports the outcome to pool and breaker and decides the next step.
fn settle(
    tier: &Tier,
    lease: KeyLease,
    permit: BreakerPermit,
    outcome: ProviderOutcome,
    free_left: bool,
) -> (Step, AttemptOutcome) {
    match outcome {
        ProviderOutcome::Ok(result) => {
            tier.pool.report_success(lease);
            tier.breaker.record_result(permit, true);
            (Step::Complete(result), AttemptOutcome::Succeeded)
        }
        ProviderOutcome::RateLimited { retry_after } => {
            tier.pool.report_rate_limited(lease, retry_after);
            // The dependency answered; only this key is throttled.
            tier.breaker.record_result(permit, true);
            let step = if tier.pool.next_available_in().is_some() {
                Step::RetryWithFallback { counted: true }
            } else {
                Step::Retry {
                    counted: !(free_left && tier.pool.has_available()),
                    back_off: false,
                }
            };
            (step, AttemptOutcome::RateLimited)
        }
        ProviderOutcome::QuotaExhausted => {
            tier.pool.report_quota_exhausted(lease);
            tier.breaker.record_result(permit, true);
            let step = if tier.pool.next_available_in().is_some() {
                Step::RetryWithFallback { counted: !free_left }
            } else {
                Step::Retry {
                    counted: !free_left,
                    back_off: false,
                }
            };
            (step, AttemptOutcome::QuotaExhausted)
        }
        ProviderOutcome::DependencyError { reason } => {
            tier.pool.report_failure(lease);
            tier.breaker.record_result(permit, false);
            let step = if tier.breaker.state() == BreakerState::Open {
                Step::RetryWithFallback { counted: true }
            } else {
                Step::Retry {
                    counted: true,
                    back_off: true,
                }
            };
            (step, AttemptOutcome::DependencyError(reason))
        }
        ProviderOutcome::Rejected { reason } => {
            // Neither the key nor the dependency is at fault.
            tier.pool.report_success(lease);
            tier.breaker.record_result(permit, true);
            (
                Step::Terminal(DispatchError::RequestRejected {
                    reason: reason.clone(),
                }),
                AttemptOutcome::Rejected(reason),
            )
        }
    }
}

/// Runs tasks against a fallback chain with bounded retries
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Create an executor with `policy`
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Retry policy in use
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `task` until it succeeds, is rejected, or the budget or chain runs out.
    ///
    /// `task` performs exactly one provider call with the given context.
    ///
    /// # Errors
    ///
    /// - `RequestRejected` when the provider refuses the payload;
    /// - `AllKeysExhausted` when no tier has a usable key, with the earliest
    ///   recovery time;
    /// - `DependencyUnavailable` when breakers are open or dependency errors
    ///   used up the budget.
    #[instrument(skip_all, fields(chain = %chain))]
    pub async fn execute<F, Fut>(
        &self,
        chain: &FallbackChain,
        mut task: F,
    ) -> Result<Completion, DispatchError>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = ProviderOutcome>,
    {
        let mut run = Run::new(chain);
        loop {
            let Some(tier) = chain.tiers.get(run.tier) else {
                let error = run.chain_exhausted();
                warn!(error = %error, attempts = run.attempts.len(), "Fallback chain exhausted");
                return Err(error);
            };

            let Some((permit, lease)) = run.admit(tier).await else {
                run.tier += 1;
                continue;
            };

            let step = run.attempt(tier, permit, lease, &mut task).await;
            if let ControlFlow::Break(result) = self.advance(&mut run, tier, step).await {
                return result;
            }
        }
    }

    async fn advance(
        &self,
        run: &mut Run<'_>,
        tier: &Tier,
        step: Step,
    ) -> ControlFlow<Result<Completion, DispatchError>> {
        let (counted, back_off) = match step {
            Step::Complete(result) => {
                info!(model = %tier.model, attempts = run.attempts.len(), "Request completed");
                return ControlFlow::Break(Ok(Completion {
                    result,
                    model: tier.model.clone(),
                    attempts: std::mem::take(&mut run.attempts),
                }));
            }
            Step::Terminal(error) => {
                warn!(model = %tier.model, error = %error, "Request rejected by provider");
                return ControlFlow::Break(Err(error));
            }
            Step::Retry { counted, back_off } => (counted, back_off),
            Step::RetryWithFallback { counted } => {
                run.leave_tier(tier);
                (counted, false)
            }
        };

        if !counted {
            run.free_retries += 1;
            return ControlFlow::Continue(());
        }

        run.budget_used += 1;
        if run.budget_used >= self.policy.max_attempts {
            let error = run.budget_exhausted(tier);
            warn!(error = %error, attempts = run.attempts.len(), "Retry budget exhausted");
            return ControlFlow::Break(Err(error));
        }

        if back_off {
            let delay = self
                .policy
                .jittered(self.policy.backoff(run.budget_used - 1));
            debug!(delay_ms = delay.as_millis(), "Backing off");
            tokio::time::sleep(delay).await;
        }
        ControlFlow::Continue(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::CircuitBreakerConfig;
    use crate::resilience::key_pool::KeyPoolConfig;
    use crate::resilience::reset::RollingWindow;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn breaker(provider: &str) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(provider, CircuitBreakerConfig::default()))
    }

    fn tier(provider: &str, class: &str, keys: usize, breaker: &Arc<CircuitBreaker>) -> Tier {
        let secrets: Vec<String> = (1..=keys).map(|i| format!("{class}-secret-{i}")).collect();
        Tier {
            model: ModelSpec::new(provider, &format!("{class}-model"), class),
            pool: KeyPool::new(
                provider,
                class,
                &secrets,
                KeyPoolConfig::default(),
                Arc::new(RollingWindow(Duration::from_secs(86_400))),
            ),
            breaker: Arc::clone(breaker),
        }
    }

    fn text(s: &str) -> ProviderOutcome {
        ProviderOutcome::Ok(ProviderResult::Text(s.to_string()))
    }

    fn dependency_error() -> ProviderOutcome {
        ProviderOutcome::DependencyError {
            reason: "503 Service Unavailable".to_string(),
        }
    }

    /// Records every call and replays `outcomes` in order; falls back to
    /// `default` once the script runs out.
    struct Script {
        outcomes: Mutex<VecDeque<ProviderOutcome>>,
        default: ProviderOutcome,
        calls: Mutex<Vec<(String, String, Instant)>>,
    }

    impl Script {
        fn new(outcomes: Vec<ProviderOutcome>, default: ProviderOutcome) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                default,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn next(&self, context: &AttemptContext) -> ProviderOutcome {
            self.calls.lock().expect("lock").push((
                context.credential.id().to_string(),
                context.model.model_class.clone(),
                Instant::now(),
            ));
            self.outcomes
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| self.default.clone())
        }

        fn calls(&self) -> Vec<(String, String, Instant)> {
            self.calls.lock().expect("lock").clone()
        }
    }

    async fn run(
        executor: &RetryExecutor,
        chain: &FallbackChain,
        script: &Script,
    ) -> Result<Completion, DispatchError> {
        executor
            .execute(chain, |context| {
                let outcome = script.next(&context);
                async move { outcome }
            })
            .await
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(200), MAX_BACKOFF);
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy::default();
        let nominal = Duration::from_secs(8);
        for _ in 0..1000 {
            let delay = policy.jittered(nominal);
            assert!(delay >= Duration::from_secs(6), "{delay:?} too short");
            assert!(delay <= Duration::from_secs(10), "{delay:?} too long");
        }
    }

    #[test]
    fn test_policy_validation() {
        assert!(RetryPolicy::default().validate().is_ok());
        let zero = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        assert!(zero.validate().is_err());
        let shrinking = RetryPolicy {
            multiplier: 0.5,
            ..RetryPolicy::default()
        };
        assert!(shrinking.validate().is_err());
    }

    #[test]
    fn test_empty_chain_is_rejected() {
        assert!(matches!(
            FallbackChain::new(Vec::new()),
            Err(DispatchError::Configuration(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dependency_errors_use_full_budget_with_backoff() {
        let gemini = breaker("gemini");
        let chain = FallbackChain::new(vec![tier("gemini", "flash", 2, &gemini)]).expect("chain");
        let script = Script::new(Vec::new(), dependency_error());

        let result = run(&RetryExecutor::default(), &chain, &script).await;
        assert_eq!(
            result.expect_err("must fail"),
            DispatchError::DependencyUnavailable {
                dependency: "gemini".to_string(),
                retry_after: None,
            }
        );

        let calls = script.calls();
        assert_eq!(calls.len(), 3);
        for (k, pair) in calls.windows(2).enumerate() {
            let gap = pair[1].2.duration_since(pair[0].2);
            let nominal = Duration::from_secs(1 << k);
            assert!(gap >= nominal.mul_f64(0.75), "gap {k} = {gap:?}");
            assert!(gap <= nominal.mul_f64(1.25), "gap {k} = {gap:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_rotates_without_spending_budget() {
        let gemini = breaker("gemini");
        let chain = FallbackChain::new(vec![tier("gemini", "flash", 3, &gemini)]).expect("chain");
        let limited = ProviderOutcome::RateLimited { retry_after: None };
        let script = Script::new(vec![limited.clone(), limited], text("done"));

        let executor = RetryExecutor::new(RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        });
        let completion = run(&executor, &chain, &script).await.expect("success");
        assert_eq!(completion.result, ProviderResult::Text("done".to_string()));
        assert_eq!(completion.attempts.len(), 3);

        let keys: Vec<String> = script.calls().into_iter().map(|(id, _, _)| id).collect();
        assert_eq!(
            keys,
            vec!["gemini/flash#1", "gemini/flash#2", "gemini/flash#3"]
        );
        assert_eq!(gemini.snapshot().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_tier_falls_back() {
        let gemini = breaker("gemini");
        let openrouter = breaker("openrouter");
        let chain = FallbackChain::new(vec![
            tier("gemini", "pro", 1, &gemini),
            tier("gemini", "flash", 1, &gemini),
            tier("openrouter", "gateway", 1, &openrouter),
        ])
        .expect("chain");
        let script = Script::new(
            vec![
                ProviderOutcome::QuotaExhausted,
                ProviderOutcome::QuotaExhausted,
            ],
            text("from gateway"),
        );

        let completion = run(&RetryExecutor::default(), &chain, &script)
            .await
            .expect("success");
        assert_eq!(completion.model.provider, "openrouter");
        let classes: Vec<String> = script.calls().into_iter().map(|(_, c, _)| c).collect();
        assert_eq!(classes, vec!["pro", "flash", "gateway"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_aborts_immediately() {
        let gemini = breaker("gemini");
        let chain = FallbackChain::new(vec![tier("gemini", "flash", 2, &gemini)]).expect("chain");
        let script = Script::new(
            vec![ProviderOutcome::Rejected {
                reason: "prompt blocked: SAFETY".to_string(),
            }],
            text("unreachable"),
        );

        let error = run(&RetryExecutor::default(), &chain, &script)
            .await
            .expect_err("rejected");
        assert_eq!(
            error,
            DispatchError::RequestRejected {
                reason: "prompt blocked: SAFETY".to_string()
            }
        );
        assert_eq!(script.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_keys_exhausted_reports_earliest_recovery() {
        let gemini = breaker("gemini");
        let chain = FallbackChain::new(vec![
            tier("gemini", "pro", 1, &gemini),
            tier("gemini", "flash", 1, &gemini),
        ])
        .expect("chain");
        let script = Script::new(
            vec![
                ProviderOutcome::RateLimited {
                    retry_after: Some(Duration::from_secs(40)),
                },
                ProviderOutcome::RateLimited {
                    retry_after: Some(Duration::from_secs(15)),
                },
            ],
            text("unreachable"),
        );

        let error = run(&RetryExecutor::default(), &chain, &script)
            .await
            .expect_err("exhausted");
        assert_eq!(
            error,
            DispatchError::AllKeysExhausted {
                retry_after: Duration::from_secs(15)
            }
        );
        assert_eq!(script.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_chain_reports_soonest_tier() {
        let gemini = breaker("gemini");
        let openrouter = breaker("openrouter");
        let chain = FallbackChain::new(vec![
            tier("gemini", "pro", 1, &gemini),
            tier("gemini", "flash", 1, &gemini),
            tier("openrouter", "gateway", 1, &openrouter),
        ])
        .expect("chain");
        let script = Script::new(
            vec![
                ProviderOutcome::RateLimited {
                    retry_after: Some(Duration::from_secs(10)),
                },
                ProviderOutcome::RateLimited {
                    retry_after: Some(Duration::from_secs(20)),
                },
                ProviderOutcome::RateLimited {
                    retry_after: Some(Duration::from_secs(300)),
                },
            ],
            text("unreachable"),
        );

        let error = run(&RetryExecutor::default(), &chain, &script)
            .await
            .expect_err("exhausted");
        assert_eq!(
            error,
            DispatchError::AllKeysExhausted {
                retry_after: Duration::from_secs(10)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_skips_provider() {
        let gemini = Arc::new(CircuitBreaker::new(
            "gemini",
            CircuitBreakerConfig::new().with_failure_threshold(1),
        ));
        let openrouter = breaker("openrouter");
        let permit = gemini.allow().expect("closed");
        gemini.record_result(permit, false);

        let chain = FallbackChain::new(vec![
            tier("gemini", "flash", 1, &gemini),
            tier("openrouter", "gateway", 1, &openrouter),
        ])
        .expect("chain");
        let script = Script::new(Vec::new(), text("gateway"));
        let completion = run(&RetryExecutor::default(), &chain, &script)
            .await
            .expect("success");
        assert_eq!(completion.model.provider, "openrouter");

        let only_gemini = FallbackChain::new(vec![tier("gemini", "flash", 1, &gemini)]).expect("chain");
        let error = run(&RetryExecutor::default(), &only_gemini, &script)
            .await
            .expect_err("breaker open");
        assert_eq!(
            error,
            DispatchError::DependencyUnavailable {
                dependency: "gemini".to_string(),
                retry_after: Some(Duration::from_secs(30)),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opening_mid_request_moves_to_next_provider() {
        let gemini = Arc::new(CircuitBreaker::new(
            "gemini",
            CircuitBreakerConfig::new().with_failure_threshold(2),
        ));
        let openrouter = breaker("openrouter");
        let chain = FallbackChain::new(vec![
            tier("gemini", "flash", 2, &gemini),
            tier("openrouter", "gateway", 1, &openrouter),
        ])
        .expect("chain");
        let script = Script::new(
            vec![dependency_error(), dependency_error()],
            text("gateway"),
        );

        let completion = run(&RetryExecutor::default(), &chain, &script)
            .await
            .expect("one budget slot left for the gateway");
        assert_eq!(completion.model.provider, "openrouter");
        assert_eq!(gemini.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_hint_rate_limits_terminate() {
        let gemini = breaker("gemini");
        let chain = FallbackChain::new(vec![tier("gemini", "flash", 2, &gemini)]).expect("chain");
        let script = Script::new(
            Vec::new(),
            ProviderOutcome::RateLimited {
                retry_after: Some(Duration::ZERO),
            },
        );

        let error = run(&RetryExecutor::default(), &chain, &script)
            .await
            .expect_err("gives up");
        assert!(matches!(error, DispatchError::AllKeysExhausted { .. }));
        // Two free rotations, then three counted attempts.
        assert_eq!(script.calls().len(), 5);
    }
}
