use super::{Adapters, CommandRunner, Orchestrator, Route};
use crate::config::DispatchSettings;
use crate::error::DispatchError;
use crate::llm::providers::{GeminiProvider, OpenRouterProvider, GEMINI, OPENROUTER};
use crate::llm::{CommandType, ProviderAdapter};
use crate::queue::{PartitionPolicy, QueueDispatcher, RequestQueue, RetentionPolicy};
use crate::resilience::rate_limiter::{RateLimiter, RateLimiterConfig};
use crate::resilience::reset::ResetSchedule;
use crate::resilience::retry::{FallbackChain, RetryExecutor, RetryPolicy, Tier};
use crate::resilience::{CircuitBreaker, KeyPool};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Assembles an [`Orchestrator`] from components
///
/// Pools and breakers are shared between routes whenever two tiers hand in
/// the same instance; [`Self::from_settings`] does this for every tier with
/// the same provider and model class.
pub struct OrchestratorBuilder {
    limiter: RateLimiterConfig,
    policy: RetryPolicy,
    retention: RetentionPolicy,
    default_timeout: Option<Duration>,
    adapters: Adapters,
    routes: Vec<(CommandType, Vec<Tier>, PartitionPolicy)>,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorBuilder {
    /// Empty builder with default limiter, retry and retention settings
    #[must_use]
    pub fn new() -> Self {
        Self {
            limiter: RateLimiterConfig::default(),
            policy: RetryPolicy::default(),
            retention: RetentionPolicy::default(),
            default_timeout: None,
            adapters: HashMap::new(),
            routes: Vec::new(),
        }
    }

    /// Per-caller admission ceiling
    #[must_use]
    pub fn with_rate_limiter(mut self, config: RateLimiterConfig) -> Self {
        self.limiter = config;
        self
    }

    /// Retry budget and backoff
    #[must_use]
    pub const fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Terminal entry retention
    #[must_use]
    pub const fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Deadline applied by [`Orchestrator::submit`]
    #[must_use]
    pub const fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Register the adapter serving tiers whose provider is `name`
    #[must_use]
    pub fn register_provider(mut self, name: &str, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.insert(name.to_string(), adapter);
        self
    }

    /// Route `command` through `tiers` (primary first)
    #[must_use]
    pub fn route(mut self, command: CommandType, tiers: Vec<Tier>, partition: PartitionPolicy) -> Self {
        self.routes.push((command, tiers, partition));
        self
    }

    /// Builder populated from settings: adapters for every provider with
    /// keys, one pool per (provider, class), one breaker per provider.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for invalid settings or a chain naming an
    /// unknown provider.
    pub fn from_settings(settings: &DispatchSettings) -> Result<Self, DispatchError> {
        settings.validate()?;

        let timeout = settings.llm_http_timeout();
        let mut keys: HashMap<&str, Vec<String>> = HashMap::new();
        keys.insert(GEMINI, settings.gemini_keys());
        keys.insert(OPENROUTER, settings.openrouter_keys());

        let mut builder = Self::new()
            .with_rate_limiter(settings.rate_limiter_config())
            .with_retry_policy(settings.retry_policy())
            .with_retention(settings.retention_policy())
            .with_default_timeout(settings.request_timeout());

        if keys.get(GEMINI).is_some_and(|k| !k.is_empty()) {
            builder = builder.register_provider(GEMINI, Arc::new(GeminiProvider::new(timeout)));
        }
        if keys.get(OPENROUTER).is_some_and(|k| !k.is_empty()) {
            builder = builder.register_provider(
                OPENROUTER,
                Arc::new(OpenRouterProvider::new(
                    settings.openrouter_site_url.clone(),
                    settings.openrouter_site_name.clone(),
                    timeout,
                )),
            );
        }

        let schedule: Arc<dyn ResetSchedule> = Arc::new(settings.reset_schedule());
        let mut pools: HashMap<(String, String), KeyPool> = HashMap::new();
        let mut breakers: HashMap<String, Arc<CircuitBreaker>> = HashMap::new();

        for command in CommandType::ALL {
            let mut tiers = Vec::new();
            for model in settings.model_chain(command)? {
                let Some(secrets) = keys.get(model.provider.as_str()) else {
                    return Err(DispatchError::Configuration(format!(
                        "{command}: unknown provider '{}'",
                        model.provider
                    )));
                };
                if secrets.is_empty() {
                    debug!(command = %command, model = %model, "No keys for tier, skipping");
                    continue;
                }
                let pool = pools
                    .entry((model.provider.clone(), model.model_class.clone()))
                    .or_insert_with(|| {
                        KeyPool::new(
                            &model.provider,
                            &model.model_class,
                            secrets,
                            settings.key_pool_config(),
                            Arc::clone(&schedule),
                        )
                    })
                    .clone();
                let breaker = Arc::clone(breakers.entry(model.provider.clone()).or_insert_with(|| {
                    Arc::new(CircuitBreaker::new(&model.provider, settings.breaker_config()))
                }));
                tiers.push(Tier {
                    model,
                    pool,
                    breaker,
                });
            }

            if tiers.is_empty() {
                warn!(command = %command, "No API keys for any model in the chain, command disabled");
                continue;
            }
            builder = builder.route(command, tiers, settings.partition_policy(command)?);
        }
        Ok(builder)
    }

    /// Validate the routes and start the dispatcher.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` when the retry policy is invalid, a route has
    /// no tier or a tier's provider has no registered adapter.
    pub fn build(self) -> Result<Orchestrator, DispatchError> {
        self.policy.validate()?;

        let mut routes = HashMap::new();
        let mut pools: Vec<KeyPool> = Vec::new();
        let mut breakers: Vec<Arc<CircuitBreaker>> = Vec::new();

        for (command, tiers, partition) in self.routes {
            for tier in &tiers {
                if !self.adapters.contains_key(&tier.model.provider) {
                    return Err(DispatchError::Configuration(format!(
                        "{command}: no adapter registered for provider '{}'",
                        tier.model.provider
                    )));
                }
                if !pools.iter().any(|p| p.same_pool(&tier.pool)) {
                    pools.push(tier.pool.clone());
                }
                if !breakers.iter().any(|b| Arc::ptr_eq(b, &tier.breaker)) {
                    breakers.push(Arc::clone(&tier.breaker));
                }
            }
            let chain = FallbackChain::new(tiers)?;
            info!(command = %command, chain = %chain, partition = ?partition, "Route configured");
            routes.insert(command, Route { chain, partition });
        }

        let routes = Arc::new(routes);
        let runner = Arc::new(CommandRunner {
            executor: RetryExecutor::new(self.policy),
            routes: Arc::clone(&routes),
            adapters: Arc::new(self.adapters),
        });
        let queue = Arc::new(RequestQueue::new(self.retention));

        Ok(Orchestrator {
            limiter: RateLimiter::new(self.limiter),
            routes,
            dispatcher: QueueDispatcher::new(queue, runner),
            pools: Arc::new(pools),
            breakers: Arc::new(breakers),
            default_timeout: self.default_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> DispatchSettings {
        DispatchSettings {
            gemini_api_keys: Some("AIza-one, AIza-two".to_string()),
            ..DispatchSettings::default()
        }
    }

    #[test]
    fn test_from_settings_shares_pools_and_breakers() {
        let orchestrator = OrchestratorBuilder::from_settings(&settings())
            .and_then(OrchestratorBuilder::build)
            .expect("valid settings");
        let health = orchestrator.health();

        // One breaker per provider; no OpenRouter keys, so no OpenRouter tier.
        assert_eq!(health.breakers.len(), 1);
        assert_eq!(health.breakers[0].dependency, GEMINI);
        assert!(health.pools.iter().all(|p| p.provider == GEMINI));
        assert!(health.pools.iter().all(|p| p.credentials.len() == 2));

        let classes: Vec<&str> = health.pools.iter().map(|p| p.model_class.as_str()).collect();
        let mut unique = classes.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(classes.len(), unique.len(), "pools are shared per class");

        let analysis = orchestrator
            .route(CommandType::Analysis)
            .expect("analysis route");
        assert!(analysis.chain.tiers().iter().all(|t| t.model.provider == GEMINI));
        assert_eq!(analysis.partition, PartitionPolicy::PerChat);
    }

    #[test]
    fn test_no_keys_disables_every_command() {
        let orchestrator = OrchestratorBuilder::from_settings(&DispatchSettings::default())
            .and_then(OrchestratorBuilder::build)
            .expect("valid settings");
        assert!(orchestrator.commands().is_empty());
        assert!(orchestrator.health().pools.is_empty());
    }

    #[test]
    fn test_unknown_provider_is_rejected() {
        let settings = DispatchSettings {
            chat_models: Some("anthropic:claude:sonnet".to_string()),
            ..settings()
        };
        assert!(matches!(
            OrchestratorBuilder::from_settings(&settings),
            Err(DispatchError::Configuration(_))
        ));
    }

    #[test]
    fn test_missing_adapter_is_rejected() {
        let tier = Tier {
            model: crate::llm::ModelSpec::new(GEMINI, "gemini-2.5-flash", "flash"),
            pool: KeyPool::new(
                GEMINI,
                "flash",
                &["k".to_string()],
                crate::resilience::KeyPoolConfig::default(),
                Arc::new(crate::resilience::DailyReset::pacific_midnight()),
            ),
            breaker: Arc::new(CircuitBreaker::new(
                GEMINI,
                crate::resilience::CircuitBreakerConfig::new(),
            )),
        };
        let result = OrchestratorBuilder::new()
            .route(CommandType::Chat, vec![tier], PartitionPolicy::Direct)
            .build();
        assert!(matches!(result, Err(DispatchError::Configuration(_))));
    }
}
