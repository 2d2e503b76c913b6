//! Orchestrator facade
//!
//! The only entry point the rest of the application calls. A request flows
//! through the per-caller rate limiter, is queued under its partition, and
//! once dequeued is driven by the retry executor along the command's
//! fallback chain.

mod builder;

pub use builder::OrchestratorBuilder;

use crate::config::DispatchSettings;
use crate::error::DispatchError;
use crate::llm::{CommandPayload, CommandType, ProviderAdapter, ProviderOutcome, ProviderResult};
use crate::queue::{
    CancelOutcome, EntryRunner, PartitionKey, PartitionPolicy, QueueDispatcher, QueueEntry,
    QueueStats, RequestHandle, RequestId, RequestStatus,
};
use crate::resilience::circuit_breaker::BreakerSnapshot;
use crate::resilience::key_pool::CredentialSnapshot;
use crate::resilience::rate_limiter::{Admission, CallerId, RateLimiter};
use crate::resilience::retry::{AttemptContext, FallbackChain, RetryExecutor};
use crate::resilience::{CircuitBreaker, KeyPool};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Fallback chain and partition policy of one command type
#[derive(Debug, Clone)]
pub struct Route {
    /// Tiers tried in order
    pub chain: FallbackChain,
    /// How requests are serialized
    pub partition: PartitionPolicy,
}

impl Route {
    /// Partition for a request submitted without an explicit key.
    ///
    /// # Errors
    ///
    /// Returns `RequestRejected` when the policy is per chat and the payload
    /// names no chat.
    pub fn partition_key(
        &self,
        request_id: RequestId,
        payload: &CommandPayload,
    ) -> Result<PartitionKey, DispatchError> {
        Ok(match self.partition {
            PartitionPolicy::Direct => PartitionKey::Direct(request_id),
            PartitionPolicy::PerChat => {
                let chat_id = payload.chat_id().ok_or_else(|| DispatchError::RequestRejected {
                    reason: format!(
                        "{} requests are serialized per chat and need a chat id",
                        payload.command_type()
                    ),
                })?;
                PartitionKey::Chat(chat_id)
            }
            PartitionPolicy::PerModel => {
                PartitionKey::Model(self.chain.primary().model.model_id.clone())
            }
            PartitionPolicy::Global => PartitionKey::Global,
        })
    }
}

/// Queued unit of work
#[derive(Debug)]
struct Job {
    command: CommandType,
    payload: CommandPayload,
}

type Adapters = HashMap<String, Arc<dyn ProviderAdapter>>;

/// Runs dequeued jobs through the retry executor
struct CommandRunner {
    executor: RetryExecutor,
    routes: Arc<HashMap<CommandType, Route>>,
    adapters: Arc<Adapters>,
}

#[async_trait]
impl EntryRunner<Job> for CommandRunner {
    async fn run(&self, entry: QueueEntry<Job>) -> Result<ProviderResult, DispatchError> {
        let job = entry.payload;
        let route = self.routes.get(&job.command).ok_or_else(|| {
            DispatchError::Configuration(format!("no route for {}", job.command))
        })?;
        let queued_for = entry.enqueued_at.elapsed();
        debug!(
            request_id = %entry.request_id,
            command = %job.command,
            queued_ms = u64::try_from(queued_for.as_millis()).unwrap_or(u64::MAX),
            "Request started"
        );

        let adapters = &self.adapters;
        let payload = &job.payload;
        let completion = self
            .executor
            .execute(&route.chain, |ctx: AttemptContext| {
                let adapter = adapters.get(&ctx.model.provider).cloned();
                async move {
                    match adapter {
                        Some(adapter) => adapter.invoke(&ctx.credential, &ctx.model, payload).await,
                        None => ProviderOutcome::Rejected {
                            reason: format!("no adapter for provider {}", ctx.model.provider),
                        },
                    }
                }
            })
            .await?;
        Ok(completion.result)
    }
}

/// Point-in-time view of a request for polling callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    /// Current status
    pub status: RequestStatus,
    /// Place in line while pending or processing
    pub position: Option<usize>,
    /// Result once completed
    pub result: Option<ProviderResult>,
    /// Error once failed
    pub error: Option<DispatchError>,
}

impl From<RequestStatus> for StatusReport {
    fn from(status: RequestStatus) -> Self {
        let (position, result, error) = match &status {
            RequestStatus::Pending { position } => (Some(*position), None, None),
            RequestStatus::Processing => (Some(1), None, None),
            RequestStatus::Completed(result) => (None, Some(result.clone()), None),
            RequestStatus::Failed(error) => (None, None, Some(error.clone())),
        };
        Self {
            status,
            position,
            result,
            error,
        }
    }
}

/// Key pool state for operators
#[derive(Debug, Clone)]
pub struct PoolHealth {
    /// Provider name
    pub provider: String,
    /// Model class
    pub model_class: String,
    /// Per-key state
    pub credentials: Vec<CredentialSnapshot>,
}

/// Snapshot of every pool, breaker and the queue
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Key pools
    pub pools: Vec<PoolHealth>,
    /// Circuit breakers
    pub breakers: Vec<BreakerSnapshot>,
    /// Queue counters
    pub queue: QueueStats,
}

/// Resilient request dispatcher
///
/// Cheap to clone; clones share pools, breakers, limiter and queue.
#[derive(Clone)]
pub struct Orchestrator {
    limiter: RateLimiter,
    routes: Arc<HashMap<CommandType, Route>>,
    dispatcher: QueueDispatcher<Job>,
    pools: Arc<Vec<KeyPool>>,
    breakers: Arc<Vec<Arc<CircuitBreaker>>>,
    default_timeout: Option<Duration>,
}

impl Orchestrator {
    /// Build pools, breakers, adapters and routes from settings.
    ///
    /// Tiers whose provider has no keys are left out of their chain; a
    /// command with no remaining tier is disabled.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for invalid settings or unknown providers.
    pub fn from_settings(settings: &DispatchSettings) -> Result<Self, DispatchError> {
        OrchestratorBuilder::from_settings(settings)?.build()
    }

    /// Submit a request with the default deadline.
    ///
    /// `partition` overrides the command's partition policy.
    ///
    /// # Errors
    ///
    /// - `Denied` when the caller is over the rate limit;
    /// - `Configuration` when the command has no route;
    /// - `RequestRejected` when the payload does not belong to `command`, or
    ///   when a per-chat command names no chat and `partition` is `None`.
    pub async fn submit(
        &self,
        command: CommandType,
        payload: CommandPayload,
        caller: CallerId,
        partition: Option<PartitionKey>,
    ) -> Result<RequestHandle, DispatchError> {
        self.submit_with_timeout(command, payload, caller, partition, self.default_timeout)
            .await
    }

    /// [`Self::submit`] with an explicit deadline, measured from now.
    ///
    /// # Errors
    ///
    /// Same as [`Self::submit`].
    #[instrument(skip_all, fields(command = %command, caller = caller))]
    pub async fn submit_with_timeout(
        &self,
        command: CommandType,
        payload: CommandPayload,
        caller: CallerId,
        partition: Option<PartitionKey>,
        timeout: Option<Duration>,
    ) -> Result<RequestHandle, DispatchError> {
        if payload.command_type() != command {
            return Err(DispatchError::RequestRejected {
                reason: format!("{} payload sent as {command}", payload.command_type()),
            });
        }
        let route = self
            .routes
            .get(&command)
            .ok_or_else(|| DispatchError::Configuration(format!("{command} is not configured")))?;

        let request_id = RequestId::new();
        let key = match partition {
            Some(key) => key,
            None => route.partition_key(request_id, &payload)?,
        };

        if let Admission::Denied { retry_after_secs } = self.limiter.try_admit(caller).await {
            info!(retry_after_secs, "Caller rate limited");
            return Err(DispatchError::Denied { retry_after_secs });
        }

        let handle = self.dispatcher.submit_as(
            request_id,
            key.clone(),
            Job { command, payload },
            timeout,
        );
        info!(
            request_id = %request_id,
            partition = %key,
            position = handle.position,
            "Request accepted"
        );
        Ok(handle)
    }

    /// Status of a request, or `None` if unknown or purged
    #[must_use]
    pub fn poll_status(&self, request_id: RequestId) -> Option<StatusReport> {
        self.dispatcher
            .queue()
            .status(request_id)
            .map(StatusReport::from)
    }

    /// Withdraw a pending request
    pub fn cancel(&self, request_id: RequestId) -> CancelOutcome {
        self.dispatcher.queue().cancel(request_id)
    }

    /// Re-activate elapsed keys and purge expired terminal entries.
    ///
    /// Returns (keys re-activated, entries purged).
    pub fn run_maintenance(&self) -> (usize, usize) {
        let recovered: usize = self.pools.iter().map(KeyPool::sweep).sum();
        let purged = self.dispatcher.queue().purge_expired();
        if recovered > 0 || purged > 0 {
            info!(recovered, purged, "Maintenance sweep");
        }
        (recovered, purged)
    }

    /// Run [`Self::run_maintenance`] every `interval` until `token` is cancelled.
    pub fn spawn_maintenance(
        &self,
        interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        debug!("Maintenance stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        this.run_maintenance();
                    }
                }
            }
        })
    }

    /// Fail every pending request so no caller waits forever. Returns how many.
    pub fn shutdown(&self) -> usize {
        let failed = self
            .dispatcher
            .queue()
            .fail_all_pending("dispatcher shutting down");
        if failed > 0 {
            warn!(failed, "Pending requests failed on shutdown");
        }
        failed
    }

    /// Pools, breakers and queue counters
    #[must_use]
    pub fn health(&self) -> HealthReport {
        HealthReport {
            pools: self
                .pools
                .iter()
                .map(|pool| PoolHealth {
                    provider: pool.provider().to_string(),
                    model_class: pool.model_class().to_string(),
                    credentials: pool.snapshot(),
                })
                .collect(),
            breakers: self.breakers.iter().map(|b| b.snapshot()).collect(),
            queue: self.dispatcher.queue().stats(),
        }
    }

    /// Commands that have a route
    #[must_use]
    pub fn commands(&self) -> Vec<CommandType> {
        CommandType::ALL
            .into_iter()
            .filter(|c| self.routes.contains_key(c))
            .collect()
    }

    /// Route of `command`, if configured
    #[must_use]
    pub fn route(&self, command: CommandType) -> Option<&Route> {
        self.routes.get(&command)
    }
}
