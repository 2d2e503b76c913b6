//! Provider adapters
//!
//! Every external AI vendor is reached through [`ProviderAdapter`], which
//! reports the result of one call as a [`ProviderOutcome`]. The adapter never
//! retries or rotates keys itself; it only classifies what happened so the
//! retry executor can decide what to do next.

mod http_utils;
/// Implementations of specific providers
pub mod providers;

use crate::resilience::key_pool::Credential;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Command families the bot forwards to providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandType {
    /// Conversational completion
    Chat,
    /// Text translation
    Translation,
    /// Long-form analysis of a chat or document
    Analysis,
    /// Text-to-speech
    Speech,
    /// Image generation
    Image,
}

impl CommandType {
    /// All command types, in display order
    pub const ALL: [Self; 5] = [
        Self::Chat,
        Self::Translation,
        Self::Analysis,
        Self::Speech,
        Self::Image,
    ];

    /// Lowercase name used in configuration keys
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Translation => "translation",
            Self::Analysis => "analysis",
            Self::Speech => "speech",
            Self::Image => "image",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown command type: {s}"))
    }
}

/// A message in a conversation history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the sender (user, assistant)
    pub role: String,
    /// Text content
    pub content: String,
}

impl Message {
    /// Create a new user message
    #[must_use]
    pub fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
        }
    }

    /// Create a new assistant message
    #[must_use]
    pub fn assistant(content: &str) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.to_string(),
        }
    }
}

/// Typed request body for one command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandPayload {
    /// Chat completion
    Chat {
        /// System prompt
        system_prompt: String,
        /// Previous turns
        history: Vec<Message>,
        /// New user message
        message: String,
    },
    /// Translate `text` into `target_language`
    Translate {
        /// Source text
        text: String,
        /// Target language name or code
        target_language: String,
    },
    /// Analyse `content` following `instruction`
    Analyze {
        /// Chat the material comes from
        chat_id: i64,
        /// What to do with the content
        instruction: String,
        /// Material to analyse (e.g. recent chat log)
        content: String,
    },
    /// Synthesize speech
    Speech {
        /// Text to speak
        text: String,
        /// Provider voice name
        voice: String,
    },
    /// Generate an image
    Image {
        /// Image description
        prompt: String,
    },
}

impl CommandPayload {
    /// Command family this payload belongs to
    #[must_use]
    pub const fn command_type(&self) -> CommandType {
        match self {
            Self::Chat { .. } => CommandType::Chat,
            Self::Translate { .. } => CommandType::Translation,
            Self::Analyze { .. } => CommandType::Analysis,
            Self::Speech { .. } => CommandType::Speech,
            Self::Image { .. } => CommandType::Image,
        }
    }

    /// Chat this payload is about, if it names one
    #[must_use]
    pub const fn chat_id(&self) -> Option<i64> {
        match self {
            Self::Analyze { chat_id, .. } => Some(*chat_id),
            _ => None,
        }
    }
}

/// Successful provider output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderResult {
    /// Generated text
    Text(String),
    /// Synthesized audio
    Audio {
        /// MIME type reported by the provider
        mime_type: String,
        /// Raw audio bytes
        data: Bytes,
    },
    /// Generated image
    Image {
        /// MIME type reported by the provider
        mime_type: String,
        /// Raw image bytes
        data: Bytes,
    },
}

/// One model tier in a fallback chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Provider name (`gemini`, `openrouter`)
    pub provider: String,
    /// Provider model identifier
    pub model_id: String,
    /// Quota class; keys are pooled per (provider, class)
    pub model_class: String,
    /// Maximum output tokens for text generation
    pub max_tokens: u32,
}

impl ModelSpec {
    /// Create a model spec with the default token budget
    #[must_use]
    pub fn new(provider: &str, model_id: &str, model_class: &str) -> Self {
        Self {
            provider: provider.to_string(),
            model_id: model_id.to_string(),
            model_class: model_class.to_string(),
            max_tokens: crate::config::DEFAULT_MAX_TOKENS,
        }
    }
}

impl fmt::Display for ModelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.model_id)
    }
}

impl FromStr for ModelSpec {
    type Err = String;

    /// Parses `provider:model_id:class`. The class defaults to the model id.
    ///
    /// Model ids may contain `/` (OpenRouter) but not `:`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split(':').map(str::trim);
        let provider = parts.next().filter(|p| !p.is_empty());
        let model_id = parts.next().filter(|m| !m.is_empty());
        let (Some(provider), Some(model_id)) = (provider, model_id) else {
            return Err(format!("expected provider:model[:class], got '{s}'"));
        };
        let model_class = parts.next().filter(|c| !c.is_empty()).unwrap_or(model_id);
        if parts.next().is_some() {
            return Err(format!("too many ':' separated fields in '{s}'"));
        }
        Ok(Self::new(
            &provider.to_ascii_lowercase(),
            model_id,
            model_class,
        ))
    }
}

/// Classified result of one provider call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderOutcome {
    /// Call succeeded
    Ok(ProviderResult),
    /// This key is being throttled; another key may work
    RateLimited {
        /// Provider hint, if any
        retry_after: Option<Duration>,
    },
    /// This key's daily quota is spent
    QuotaExhausted,
    /// Provider-side failure (timeout, 5xx, connection)
    DependencyError {
        /// Short description for logs
        reason: String,
    },
    /// Payload refused; retrying will not help
    Rejected {
        /// Provider-supplied reason
        reason: String,
    },
}

/// Uniform interface to one external provider
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Perform one call with `credential` against `model`.
    async fn invoke(
        &self,
        credential: &Credential,
        model: &ModelSpec,
        payload: &CommandPayload,
    ) -> ProviderOutcome;
}
