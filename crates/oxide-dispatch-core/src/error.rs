//! Terminal error taxonomy
//!
//! Every failure that escapes the dispatch core is one of these variants.
//! Transient provider conditions (per-key 429s, single 5xx responses) are
//! absorbed by the retry executor and never surface here directly.

use std::time::Duration;
use thiserror::Error;

/// Waits this long or longer mean the daily quota is spent, not a short cooldown
const QUOTA_WAIT: Duration = Duration::from_secs(3600);

/// Terminal failure of a dispatched request
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// Caller exceeded the per-user admission window
    #[error("Rate limit exceeded, retry in {retry_after_secs}s")]
    Denied {
        /// Seconds until the oldest request in the window expires
        retry_after_secs: u64,
    },
    /// Circuit breaker open or dependency kept failing after all retries
    #[error("Dependency unavailable: {dependency}")]
    DependencyUnavailable {
        /// Provider that could not be reached
        dependency: String,
        /// Remaining breaker cooldown, if the breaker is open
        retry_after: Option<Duration>,
    },
    /// Every credential of every fallback tier is cooling down or out of quota
    #[error("All API keys exhausted (retry in {}s)", retry_after.as_secs())]
    AllKeysExhausted {
        /// Estimated time until the first credential becomes usable again
        retry_after: Duration,
    },
    /// Payload refused by the provider, not retriable
    #[error("Request rejected: {reason}")]
    RequestRejected {
        /// Provider-supplied or local reason
        reason: String,
    },
    /// Caller-imposed deadline exceeded
    #[error("Request timed out")]
    Timeout,
    /// Queued entry was lost (worker crash or shutdown)
    #[error("Queue failure: {reason}")]
    InternalQueueFailure {
        /// What happened to the entry
        reason: String,
    },
    /// Caller withdrew the request before it started
    #[error("Request cancelled")]
    Cancelled,
    /// Invalid route, pool or policy configuration
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl DispatchError {
    /// Retry hint to show the user, when one is known.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Denied { retry_after_secs } => Some(Duration::from_secs(*retry_after_secs)),
            Self::DependencyUnavailable { retry_after, .. } => *retry_after,
            Self::AllKeysExhausted { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Whether resubmitting the same request can succeed later.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        !matches!(
            self,
            Self::RequestRejected { .. } | Self::Cancelled | Self::Configuration(_)
        )
    }

    /// Short message suitable for sending back to the chat.
    ///
    /// Each variant renders differently so the user can tell "wait a minute"
    /// apart from "wait until tomorrow" and "your input was refused".
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Denied { retry_after_secs } => {
                format!("⏳ Too many requests. Try again in {retry_after_secs} s.")
            }
            Self::DependencyUnavailable {
                dependency,
                retry_after: Some(wait),
            } => format!(
                "🔌 {dependency} is temporarily unavailable. Try again in {} s.",
                wait.as_secs().max(1)
            ),
            Self::DependencyUnavailable { dependency, .. } => {
                format!("🔌 {dependency} is temporarily unavailable. Try again later.")
            }
            Self::AllKeysExhausted { retry_after } if *retry_after >= QUOTA_WAIT => format!(
                "🔑 Daily limits reached. Service resumes in about {}.",
                format_wait(*retry_after)
            ),
            Self::AllKeysExhausted { retry_after } => format!(
                "🔑 All API keys are busy. Try again in about {}.",
                format_wait(*retry_after)
            ),
            Self::RequestRejected { reason } => format!("🚫 Request rejected: {reason}"),
            Self::Timeout => "⌛ The request took too long. Please resend it.".to_string(),
            Self::InternalQueueFailure { .. } => {
                "♻️ The request was lost during a restart. Please resend it.".to_string()
            }
            Self::Cancelled => "✖️ Request cancelled.".to_string(),
            Self::Configuration(_) => "⚙️ This command is not configured.".to_string(),
        }
    }
}

fn format_wait(wait: Duration) -> String {
    let secs = wait.as_secs();
    if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m", secs.div_ceil(60))
    } else {
        format!("{}s", secs.max(1))
    }
}
