//! Multi-key credential pool
//!
//! Rotates round-robin over the API keys of one (provider, model class) pair
//! and tracks per-key health. Keys that hit a rate limit cool down for a
//! while; keys that run out of daily quota sleep until the provider's reset
//! instant. Expired cooldowns are re-activated lazily on the next `acquire`
//! (or by [`KeyPool::sweep`] from the maintenance task).
//!
//! A key handed out by `acquire` is leased: no other caller receives it until
//! the lease is settled through one of the `report_*` methods or dropped.
//! The pool mutex is held only while selecting, never across the provider call.

use super::reset::ResetSchedule;
use chrono::Utc;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default cooldown when a provider rate-limits without a `Retry-After` hint
pub const DEFAULT_KEY_COOLDOWN: Duration = Duration::from_secs(60);

/// Health of a single credential
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStatus {
    /// Usable
    Active,
    /// Rate-limited, usable again after `cooldown_until`
    Cooling,
    /// Daily quota spent, usable again after the next reset instant
    ExhaustedToday,
}

/// One provider access token
#[derive(Clone)]
pub struct Credential {
    id: Arc<str>,
    provider: Arc<str>,
    model_class: Arc<str>,
    secret: Arc<str>,
}

impl Credential {
    /// Create a credential. `id` is what shows up in logs, never `secret`.
    #[must_use]
    pub fn new(id: &str, provider: &str, model_class: &str, secret: &str) -> Self {
        Self {
            id: Arc::from(id),
            provider: Arc::from(provider),
            model_class: Arc::from(model_class),
            secret: Arc::from(secret),
        }
    }

    /// Log-safe identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Provider name
    #[must_use]
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Model class (tier) this key belongs to
    #[must_use]
    pub fn model_class(&self) -> &str {
        &self.model_class
    }

    /// Raw API key
    #[must_use]
    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("model_class", &self.model_class)
            .finish_non_exhaustive()
    }
}

/// Pool tuning
#[derive(Debug, Clone)]
pub struct KeyPoolConfig {
    /// Cooldown used when the provider gives no `Retry-After`
    pub default_cooldown: Duration,
}

impl Default for KeyPoolConfig {
    fn default() -> Self {
        Self {
            default_cooldown: DEFAULT_KEY_COOLDOWN,
        }
    }
}

/// Per-credential view for status displays
#[derive(Debug, Clone)]
pub struct CredentialSnapshot {
    /// Credential id
    pub id: String,
    /// Current status
    pub status: CredentialStatus,
    /// Errors since the last success
    pub consecutive_errors: u32,
    /// Time until the key is usable again, if it is not active
    pub available_in: Option<Duration>,
    /// Whether a caller currently holds the key
    pub leased: bool,
}

/// Result of a non-blocking acquire
#[derive(Debug)]
pub enum Acquire {
    /// A key was leased
    Granted(KeyLease),
    /// Every key is active but leased to another caller
    Busy,
    /// No key is active; the earliest one comes back after `retry_after`
    Exhausted {
        /// Time until the first key re-activates
        retry_after: Duration,
    },
}

/// Returned by [`KeyPool::acquire`] when no key is active
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolExhausted {
    /// Time until the first key re-activates
    pub retry_after: Duration,
}

#[derive(Debug)]
struct Slot {
    credential: Credential,
    status: CredentialStatus,
    consecutive_errors: u32,
    cooldown_until: Option<Instant>,
    exhausted_until: Option<Instant>,
    leased: bool,
}

impl Slot {
    fn available_at(&self) -> Option<Instant> {
        match self.status {
            CredentialStatus::Active => None,
            CredentialStatus::Cooling => self.cooldown_until,
            CredentialStatus::ExhaustedToday => self.exhausted_until,
        }
    }
}

#[derive(Debug)]
struct PoolState {
    slots: Vec<Slot>,
    cursor: usize,
}

enum Settlement {
    Success,
    RateLimited(Option<Duration>),
    QuotaExhausted,
    Failure,
    Abandoned,
}

struct PoolShared {
    provider: String,
    model_class: String,
    config: KeyPoolConfig,
    schedule: Arc<dyn ResetSchedule>,
    state: Mutex<PoolState>,
    released: Notify,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Re-activates every key whose cooldown or exhaustion window has elapsed.
    fn refresh(&self, state: &mut PoolState, now: Instant) -> usize {
        let mut reactivated = 0;
        for slot in &mut state.slots {
            let elapsed = slot.available_at().is_some_and(|at| at <= now);
            if elapsed {
                info!(
                    provider = %self.provider,
                    model_class = %self.model_class,
                    credential = slot.credential.id(),
                    previous = ?slot.status,
                    "Credential reactivated"
                );
                slot.status = CredentialStatus::Active;
                slot.cooldown_until = None;
                slot.exhausted_until = None;
                reactivated += 1;
            }
        }
        reactivated
    }

    fn settle(&self, index: usize, settlement: Settlement) {
        let now = Instant::now();
        {
            let mut state = self.lock();
            let Some(slot) = state.slots.get_mut(index) else {
                return;
            };
            slot.leased = false;
            match settlement {
                Settlement::Success => {
                    slot.consecutive_errors = 0;
                }
                Settlement::RateLimited(hint) => {
                    let cooldown = hint.unwrap_or(self.config.default_cooldown);
                    slot.consecutive_errors = slot.consecutive_errors.saturating_add(1);
                    slot.status = CredentialStatus::Cooling;
                    slot.cooldown_until = Some(now + cooldown);
                    warn!(
                        provider = %self.provider,
                        model_class = %self.model_class,
                        credential = slot.credential.id(),
                        cooldown_secs = cooldown.as_secs(),
                        "Credential rate limited, rotating"
                    );
                }
                Settlement::QuotaExhausted => {
                    let until_reset = self.schedule.until_next_reset(Utc::now());
                    slot.consecutive_errors = slot.consecutive_errors.saturating_add(1);
                    slot.status = CredentialStatus::ExhaustedToday;
                    slot.exhausted_until = Some(now + until_reset);
                    warn!(
                        provider = %self.provider,
                        model_class = %self.model_class,
                        credential = slot.credential.id(),
                        reset_in_secs = until_reset.as_secs(),
                        "Credential quota exhausted until reset"
                    );
                }
                Settlement::Failure => {
                    slot.consecutive_errors = slot.consecutive_errors.saturating_add(1);
                }
                Settlement::Abandoned => {
                    debug!(
                        credential = slot.credential.id(),
                        "Lease dropped without outcome"
                    );
                }
            }
        }
        self.released.notify_waiters();
    }
}

/// A leased credential; settle it with one of the `KeyPool::report_*` methods.
///
/// Dropping an unsettled lease returns the key to the pool unchanged.
pub struct KeyLease {
    pool: Arc<PoolShared>,
    index: usize,
    credential: Credential,
    settled: bool,
}

impl KeyLease {
    /// The leased credential
    #[must_use]
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    fn settle(mut self, settlement: Settlement) {
        self.settled = true;
        self.pool.settle(self.index, settlement);
    }
}

impl fmt::Debug for KeyLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyLease")
            .field("credential", &self.credential)
            .finish_non_exhaustive()
    }
}

impl Drop for KeyLease {
    fn drop(&mut self) {
        if !self.settled {
            self.pool.settle(self.index, Settlement::Abandoned);
        }
    }
}

/// Ordered set of credentials for one provider and model class
#[derive(Clone)]
pub struct KeyPool {
    shared: Arc<PoolShared>,
}

impl fmt::Debug for KeyPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPool")
            .field("provider", &self.shared.provider)
            .field("model_class", &self.shared.model_class)
            .field("size", &self.len())
            .finish()
    }
}

impl KeyPool {
    /// Build a pool from raw API keys. Ids are `<provider>/<class>#<n>`.
    #[must_use]
    pub fn new(
        provider: &str,
        model_class: &str,
        secrets: &[String],
        config: KeyPoolConfig,
        schedule: Arc<dyn ResetSchedule>,
    ) -> Self {
        let slots = secrets
            .iter()
            .enumerate()
            .map(|(i, secret)| Slot {
                credential: Credential::new(
                    &format!("{provider}/{model_class}#{}", i + 1),
                    provider,
                    model_class,
                    secret,
                ),
                status: CredentialStatus::Active,
                consecutive_errors: 0,
                cooldown_until: None,
                exhausted_until: None,
                leased: false,
            })
            .collect();

        Self {
            shared: Arc::new(PoolShared {
                provider: provider.to_string(),
                model_class: model_class.to_string(),
                config,
                schedule,
                state: Mutex::new(PoolState { slots, cursor: 0 }),
                released: Notify::new(),
            }),
        }
    }

    /// Provider name
    #[must_use]
    pub fn provider(&self) -> &str {
        &self.shared.provider
    }

    /// Model class
    #[must_use]
    pub fn model_class(&self) -> &str {
        &self.shared.model_class
    }

    /// Number of credentials
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.lock().slots.len()
    }

    /// Whether the pool holds no credentials at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether both handles refer to the same pool
    #[must_use]
    pub fn same_pool(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Lease the next active, unleased key without waiting.
    #[must_use]
    pub fn try_acquire(&self) -> Acquire {
        let now = Instant::now();
        let mut state = self.shared.lock();
        self.shared.refresh(&mut state, now);

        let len = state.slots.len();
        let mut any_active = false;
        for offset in 0..len {
            let index = (state.cursor + offset) % len;
            let slot = &mut state.slots[index];
            if slot.status != CredentialStatus::Active {
                continue;
            }
            any_active = true;
            if slot.leased {
                continue;
            }
            slot.leased = true;
            let credential = slot.credential.clone();
            state.cursor = (index + 1) % len;
            debug!(credential = credential.id(), "Credential leased");
            return Acquire::Granted(KeyLease {
                pool: Arc::clone(&self.shared),
                index,
                credential,
                settled: false,
            });
        }

        if any_active {
            return Acquire::Busy;
        }

        let retry_after = state
            .slots
            .iter()
            .filter_map(Slot::available_at)
            .min()
            .map_or(self.shared.config.default_cooldown, |at| {
                at.saturating_duration_since(now)
            });
        Acquire::Exhausted { retry_after }
    }

    /// Lease the next active key, waiting while all active keys are leased.
    ///
    /// # Errors
    ///
    /// Returns `PoolExhausted` when no key is active.
    pub async fn acquire(&self) -> Result<KeyLease, PoolExhausted> {
        loop {
            let released = self.shared.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            match self.try_acquire() {
                Acquire::Granted(lease) => return Ok(lease),
                Acquire::Exhausted { retry_after } => return Err(PoolExhausted { retry_after }),
                Acquire::Busy => released.await,
            }
        }
    }

    /// Whether an unleased active key exists right now
    #[must_use]
    pub fn has_available(&self) -> bool {
        let mut state = self.shared.lock();
        self.shared.refresh(&mut state, Instant::now());
        state
            .slots
            .iter()
            .any(|s| s.status == CredentialStatus::Active && !s.leased)
    }

    /// Time until some key becomes active again; `None` while any key is
    /// active (leased or not).
    #[must_use]
    pub fn next_available_in(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut state = self.shared.lock();
        self.shared.refresh(&mut state, now);
        if state
            .slots
            .iter()
            .any(|s| s.status == CredentialStatus::Active)
        {
            return None;
        }
        Some(
            state
                .slots
                .iter()
                .filter_map(Slot::available_at)
                .min()
                .map_or(self.shared.config.default_cooldown, |at| {
                    at.saturating_duration_since(now)
                }),
        )
    }

    /// Call succeeded; resets the key's error count.
    pub fn report_success(&self, lease: KeyLease) {
        self.check_owner(&lease);
        lease.settle(Settlement::Success);
    }

    /// Key hit a rate limit; cools down for `retry_after` or the default.
    pub fn report_rate_limited(&self, lease: KeyLease, retry_after: Option<Duration>) {
        self.check_owner(&lease);
        lease.settle(Settlement::RateLimited(retry_after));
    }

    /// Key spent its daily quota; sleeps until the next reset instant.
    pub fn report_quota_exhausted(&self, lease: KeyLease) {
        self.check_owner(&lease);
        lease.settle(Settlement::QuotaExhausted);
    }

    /// Dependency-level failure; the key stays active.
    pub fn report_failure(&self, lease: KeyLease) {
        self.check_owner(&lease);
        lease.settle(Settlement::Failure);
    }

    /// Re-activate elapsed keys now. Returns how many came back.
    pub fn sweep(&self) -> usize {
        let mut state = self.shared.lock();
        self.shared.refresh(&mut state, Instant::now())
    }

    /// Point-in-time view of every credential
    #[must_use]
    pub fn snapshot(&self) -> Vec<CredentialSnapshot> {
        let now = Instant::now();
        let state = self.shared.lock();
        state
            .slots
            .iter()
            .map(|slot| CredentialSnapshot {
                id: slot.credential.id().to_string(),
                status: slot.status,
                consecutive_errors: slot.consecutive_errors,
                available_in: slot
                    .available_at()
                    .map(|at| at.saturating_duration_since(now)),
                leased: slot.leased,
            })
            .collect()
    }

    fn check_owner(&self, lease: &KeyLease) {
        if !Arc::ptr_eq(&self.shared, &lease.pool) {
            warn!(
                credential = lease.credential.id(),
                pool = %self.shared.provider,
                "Lease reported to a foreign pool"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::reset::RollingWindow;

    fn pool(size: usize) -> KeyPool {
        let secrets: Vec<String> = (1..=size).map(|i| format!("secret-{i}")).collect();
        KeyPool::new(
            "gemini",
            "flash",
            &secrets,
            KeyPoolConfig::default(),
            Arc::new(RollingWindow(Duration::from_secs(3600))),
        )
    }

    fn granted(pool: &KeyPool) -> KeyLease {
        match pool.try_acquire() {
            Acquire::Granted(lease) => lease,
            other => panic!("expected a lease, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_robin_rotation() {
        let pool = pool(3);
        let mut seen = Vec::new();
        for _ in 0..4 {
            let lease = granted(&pool);
            seen.push(lease.credential().id().to_string());
            pool.report_success(lease);
        }
        assert_eq!(
            seen,
            vec![
                "gemini/flash#1",
                "gemini/flash#2",
                "gemini/flash#3",
                "gemini/flash#1"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_keys_drive_pool_to_exhausted() {
        let pool = pool(2);
        let first = granted(&pool);
        let second = granted(&pool);
        pool.report_rate_limited(first, Some(Duration::from_secs(10)));
        pool.report_rate_limited(second, None);

        let Acquire::Exhausted { retry_after } = pool.try_acquire() else {
            panic!("pool should be exhausted");
        };
        assert_eq!(retry_after, Duration::from_secs(10));

        assert_eq!(pool.next_available_in(), Some(Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(pool.next_available_in(), None);
        let lease = granted(&pool);
        assert_eq!(lease.credential().id(), "gemini/flash#1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_leased_key_is_not_shared() {
        let pool = pool(1);
        let lease = granted(&pool);
        assert!(matches!(pool.try_acquire(), Acquire::Busy));
        assert!(!pool.has_available());
        drop(lease);
        assert!(pool.has_available());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_release() {
        let pool = pool(1);
        let lease = granted(&pool);

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|l| l.credential().id().to_string()) })
        };
        tokio::task::yield_now().await;
        pool.report_success(lease);

        let id = waiter.await.expect("join").expect("lease");
        assert_eq!(id, "gemini/flash#1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_reports_exhaustion_when_leased_key_cools() {
        let pool = pool(1);
        let lease = granted(&pool);

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        pool.report_rate_limited(lease, None);

        let result = waiter.await.expect("join");
        assert_eq!(
            result,
            Err(PoolExhausted {
                retry_after: DEFAULT_KEY_COOLDOWN
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_exhaustion_uses_reset_schedule() {
        let pool = pool(1);
        let lease = granted(&pool);
        pool.report_quota_exhausted(lease);

        let snapshot = pool.snapshot();
        assert_eq!(snapshot[0].status, CredentialStatus::ExhaustedToday);
        assert_eq!(snapshot[0].available_in, Some(Duration::from_secs(3600)));

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(pool.sweep(), 1);
        assert_eq!(pool.snapshot()[0].status, CredentialStatus::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_error_count() {
        let pool = pool(1);
        pool.report_failure(granted(&pool));
        pool.report_failure(granted(&pool));
        assert_eq!(pool.snapshot()[0].consecutive_errors, 2);
        pool.report_success(granted(&pool));
        assert_eq!(pool.snapshot()[0].consecutive_errors, 0);
    }

    #[test]
    fn test_debug_hides_secret() {
        let credential = Credential::new("gemini/pro#1", "gemini", "pro", "AIzaSECRET");
        let rendered = format!("{credential:?}");
        assert!(!rendered.contains("AIzaSECRET"));
        assert!(rendered.contains("gemini/pro#1"));
    }

    #[test]
    fn test_empty_pool_is_exhausted() {
        let pool = pool(0);
        assert!(pool.is_empty());
        assert!(matches!(pool.try_acquire(), Acquire::Exhausted { .. }));
    }
}
