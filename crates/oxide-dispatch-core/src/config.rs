//! Configuration and settings management
//!
//! Loads dispatch settings from config files and environment variables and
//! defines provider constants and default model chains.

use crate::error::DispatchError;
use crate::llm::{CommandType, ModelSpec};
use crate::queue::{PartitionPolicy, RetentionPolicy};
use crate::resilience::circuit_breaker::CircuitBreakerConfig;
use crate::resilience::key_pool::KeyPoolConfig;
use crate::resilience::rate_limiter::RateLimiterConfig;
use crate::resilience::reset::DailyReset;
use crate::resilience::retry::RetryPolicy;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Gemini REST endpoint
pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
/// `OpenRouter` REST endpoint
pub const OPENROUTER_API_BASE: &str = "https://openrouter.ai/api/v1";

/// Output token budget for text models unless overridden
pub const DEFAULT_MAX_TOKENS: u32 = 8192;
/// Temperature for Gemini text generation
pub const GEMINI_CHAT_TEMPERATURE: f32 = 0.7;
/// Temperature for Gemini image generation
pub const GEMINI_IMAGE_TEMPERATURE: f32 = 1.0;
/// Temperature for `OpenRouter` text generation
pub const OPENROUTER_CHAT_TEMPERATURE: f32 = 0.7;

/// System prompt for translation; `{language}` is replaced with the target
pub const TRANSLATION_SYSTEM_PROMPT: &str = "You are a professional translator. \
Translate the user's text into {language}. Preserve formatting, names and tone. \
Reply with the translation only.";

/// System prompt for analysis requests
pub const ANALYSIS_SYSTEM_PROMPT: &str = "You analyse chat logs and documents. \
Follow the instruction in the first paragraph of the user's message and answer \
concisely in the language of that instruction.";

/// Default fallback chain for chat
pub const DEFAULT_CHAT_MODELS: &str = "gemini:gemini-2.5-flash:flash,\
gemini:gemini-2.5-flash-lite:lite,openrouter:google/gemini-2.5-flash:gateway";
/// Default fallback chain for translation
pub const DEFAULT_TRANSLATION_MODELS: &str =
    "gemini:gemini-2.5-flash-lite:lite,openrouter:google/gemini-2.5-flash-lite:gateway";
/// Default fallback chain for analysis
pub const DEFAULT_ANALYSIS_MODELS: &str = "gemini:gemini-2.5-pro:pro,\
gemini:gemini-2.5-flash:flash,openrouter:google/gemini-2.5-pro:gateway";
/// Default fallback chain for speech
pub const DEFAULT_SPEECH_MODELS: &str = "gemini:gemini-2.5-flash-preview-tts:tts";
/// Default fallback chain for image generation
pub const DEFAULT_IMAGE_MODELS: &str = "gemini:gemini-2.0-flash-preview-image-generation:image,\
openrouter:google/gemini-2.5-flash-image-preview:gateway";

/// Dispatch settings loaded from files and environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct DispatchSettings {
    /// Gemini API keys (comma, semicolon or whitespace separated)
    pub gemini_api_keys: Option<String>,
    /// Single Gemini API key, merged into `gemini_api_keys`
    pub gemini_api_key: Option<String>,
    /// `OpenRouter` API keys (comma, semicolon or whitespace separated)
    pub openrouter_api_keys: Option<String>,
    /// Single `OpenRouter` API key, merged into `openrouter_api_keys`
    pub openrouter_api_key: Option<String>,
    /// Site URL for `OpenRouter` identification
    pub openrouter_site_url: String,
    /// Site name for `OpenRouter` identification
    pub openrouter_site_name: String,

    /// Requests per caller per window
    pub rate_limit_max_requests: usize,
    /// Caller window length in seconds
    pub rate_limit_window_secs: u64,

    /// Dependency failures that open a breaker
    pub breaker_failure_threshold: u32,
    /// Rolling failure window in seconds
    pub breaker_window_secs: u64,
    /// Open-state duration in seconds
    pub breaker_cooldown_secs: u64,

    /// Attempts per request counted against the retry budget
    pub retry_max_attempts: u32,
    /// First backoff delay in milliseconds
    pub retry_base_delay_ms: u64,
    /// Backoff multiplier
    pub retry_multiplier: f64,
    /// Relative jitter applied to each delay (0.25 = ±25%)
    pub retry_jitter: f64,

    /// Cooldown for rate-limited keys without a provider hint, in seconds
    pub key_cooldown_secs: u64,
    /// Local hour at which daily quotas reset
    pub quota_reset_hour: u32,
    /// UTC offset of the quota reset clock, in hours
    pub quota_reset_utc_offset_hours: i32,

    /// How long terminal queue entries stay pollable, in seconds
    pub queue_retention_secs: u64,
    /// Maximum number of retained terminal entries
    pub queue_retention_capacity: usize,

    /// Default caller deadline in seconds, if any
    pub request_timeout_secs: Option<u64>,
    /// HTTP timeout for provider calls in seconds
    pub llm_http_timeout_secs: u64,

    /// Chat fallback chain (`provider:model[:class]`, comma separated)
    pub chat_models: Option<String>,
    /// Translation fallback chain
    pub translation_models: Option<String>,
    /// Analysis fallback chain
    pub analysis_models: Option<String>,
    /// Speech fallback chain
    pub speech_models: Option<String>,
    /// Image fallback chain
    pub image_models: Option<String>,

    /// Chat partition policy (`direct`, `chat`, `model`, `global`)
    pub chat_partition: Option<String>,
    /// Translation partition policy
    pub translation_partition: Option<String>,
    /// Analysis partition policy
    pub analysis_partition: Option<String>,
    /// Speech partition policy
    pub speech_partition: Option<String>,
    /// Image partition policy
    pub image_partition: Option<String>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            gemini_api_keys: None,
            gemini_api_key: None,
            openrouter_api_keys: None,
            openrouter_api_key: None,
            openrouter_site_url: String::new(),
            openrouter_site_name: "Another Chat TG Bot".to_string(),
            rate_limit_max_requests: 10,
            rate_limit_window_secs: 60,
            breaker_failure_threshold: 5,
            breaker_window_secs: 60,
            breaker_cooldown_secs: 30,
            retry_max_attempts: 3,
            retry_base_delay_ms: 1000,
            retry_multiplier: 2.0,
            retry_jitter: 0.25,
            key_cooldown_secs: 60,
            quota_reset_hour: 0,
            quota_reset_utc_offset_hours: -8,
            queue_retention_secs: 300,
            queue_retention_capacity: 1000,
            request_timeout_secs: None,
            llm_http_timeout_secs: 30,
            chat_models: None,
            translation_models: None,
            analysis_models: None,
            speech_models: None,
            image_models: None,
            chat_partition: None,
            translation_partition: None,
            analysis_partition: None,
            speech_partition: None,
            image_partition: None,
        }
    }
}

/// Splits a list on commas, semicolons and whitespace.
fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .filter(|token| !token.is_empty())
}

fn merged_keys(list: Option<&String>, single: Option<&String>) -> Vec<String> {
    let mut keys: Vec<String> = list
        .into_iter()
        .chain(single)
        .flat_map(|raw| split_list(raw))
        .map(ToString::to_string)
        .collect();
    let mut seen = std::collections::HashSet::new();
    keys.retain(|key| seen.insert(key.clone()));
    keys
}

fn invalid(message: impl Into<String>) -> DispatchError {
    DispatchError::Configuration(message.into())
}

impl DispatchSettings {
    /// Load settings from config files and the environment.
    ///
    /// Sources, later ones winning: `config/default`, `config/{RUN_MODE}`,
    /// `config/local`, `APP__`-prefixed variables, plain variables.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if a source cannot be read or a value has the
    /// wrong type.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            // Not checked into git
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("APP").separator("__"))
            // UPPER_SNAKE_CASE maps to snake_case; empty values count as unset
            .add_source(Environment::default().ignore_empty(true))
            .build()?;

        s.try_deserialize()
    }

    /// All configured Gemini keys, de-duplicated, in order
    #[must_use]
    pub fn gemini_keys(&self) -> Vec<String> {
        merged_keys(self.gemini_api_keys.as_ref(), self.gemini_api_key.as_ref())
    }

    /// All configured `OpenRouter` keys, de-duplicated, in order
    #[must_use]
    pub fn openrouter_keys(&self) -> Vec<String> {
        merged_keys(
            self.openrouter_api_keys.as_ref(),
            self.openrouter_api_key.as_ref(),
        )
    }

    /// Fallback chain for `command`, primary tier first.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if an entry does not parse or the chain is empty.
    pub fn model_chain(&self, command: CommandType) -> Result<Vec<ModelSpec>, DispatchError> {
        let (custom, default) = match command {
            CommandType::Chat => (&self.chat_models, DEFAULT_CHAT_MODELS),
            CommandType::Translation => (&self.translation_models, DEFAULT_TRANSLATION_MODELS),
            CommandType::Analysis => (&self.analysis_models, DEFAULT_ANALYSIS_MODELS),
            CommandType::Speech => (&self.speech_models, DEFAULT_SPEECH_MODELS),
            CommandType::Image => (&self.image_models, DEFAULT_IMAGE_MODELS),
        };
        let raw = custom.as_deref().unwrap_or(default);
        let chain = split_list(raw)
            .map(|entry| entry.parse::<ModelSpec>().map_err(invalid))
            .collect::<Result<Vec<_>, _>>()?;
        if chain.is_empty() {
            return Err(invalid(format!("{command}: model chain is empty")));
        }
        Ok(chain)
    }

    /// Queue partition policy for `command`.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for an unknown policy name.
    pub fn partition_policy(&self, command: CommandType) -> Result<PartitionPolicy, DispatchError> {
        let custom = match command {
            CommandType::Chat => &self.chat_partition,
            CommandType::Translation => &self.translation_partition,
            CommandType::Analysis => &self.analysis_partition,
            CommandType::Speech => &self.speech_partition,
            CommandType::Image => &self.image_partition,
        };
        custom.as_deref().map_or_else(
            || Ok(PartitionPolicy::default_for(command)),
            |raw| raw.parse().map_err(invalid),
        )
    }

    /// Rate limiter ceiling
    #[must_use]
    pub const fn rate_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            max_requests: self.rate_limit_max_requests,
            window: Duration::from_secs(self.rate_limit_window_secs),
        }
    }

    /// Circuit breaker thresholds
    #[must_use]
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new()
            .with_failure_threshold(self.breaker_failure_threshold)
            .with_window(Duration::from_secs(self.breaker_window_secs))
            .with_cooldown(Duration::from_secs(self.breaker_cooldown_secs))
    }

    /// Retry budget and backoff
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            multiplier: self.retry_multiplier,
            jitter: self.retry_jitter,
        }
    }

    /// Key pool tuning
    #[must_use]
    pub const fn key_pool_config(&self) -> KeyPoolConfig {
        KeyPoolConfig {
            default_cooldown: Duration::from_secs(self.key_cooldown_secs),
        }
    }

    /// Daily quota reset clock
    #[must_use]
    pub fn reset_schedule(&self) -> DailyReset {
        DailyReset::new(self.quota_reset_hour, self.quota_reset_utc_offset_hours)
    }

    /// Terminal entry retention
    #[must_use]
    pub const fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            ttl: Duration::from_secs(self.queue_retention_secs),
            capacity: self.queue_retention_capacity,
        }
    }

    /// Default caller deadline
    #[must_use]
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    /// Provider HTTP timeout
    #[must_use]
    pub const fn llm_http_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_http_timeout_secs)
    }

    /// Reject values the components cannot work with.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` naming the first offending setting.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.rate_limit_max_requests == 0 {
            return Err(invalid("rate_limit_max_requests must be at least 1"));
        }
        if self.rate_limit_window_secs == 0 {
            return Err(invalid("rate_limit_window_secs must be at least 1"));
        }
        if self.breaker_failure_threshold == 0 {
            return Err(invalid("breaker_failure_threshold must be at least 1"));
        }
        if self.breaker_window_secs == 0 {
            return Err(invalid("breaker_window_secs must be at least 1"));
        }
        if self.queue_retention_capacity == 0 {
            return Err(invalid("queue_retention_capacity must be at least 1"));
        }
        if self.llm_http_timeout_secs == 0 {
            return Err(invalid("llm_http_timeout_secs must be at least 1"));
        }
        self.retry_policy().validate()?;
        for command in CommandType::ALL {
            self.model_chain(command)?;
            self.partition_policy(command)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn from_toml(toml: &str) -> DispatchSettings {
        Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .and_then(Config::try_deserialize)
            .expect("valid settings")
    }

    #[test]
    fn test_defaults_are_valid() {
        let settings = DispatchSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.rate_limiter_config().max_requests, 10);
        assert_eq!(settings.retry_policy().max_attempts, 3);
        assert_eq!(settings.breaker_config().cooldown, Duration::from_secs(30));
        assert_eq!(
            settings.partition_policy(CommandType::Speech),
            Ok(PartitionPolicy::Global)
        );
    }

    #[test]
    fn test_key_list_parsing() {
        let settings = DispatchSettings {
            gemini_api_keys: Some("k1,k2; k3 k4".to_string()),
            gemini_api_key: Some("k2".to_string()),
            ..DispatchSettings::default()
        };
        assert_eq!(settings.gemini_keys(), vec!["k1", "k2", "k3", "k4"]);
        assert!(settings.openrouter_keys().is_empty());
    }

    #[test]
    fn test_file_values_override_defaults() {
        let settings = from_toml(
            r#"
            rate_limit_max_requests = 3
            retry_max_attempts = 5
            analysis_models = "gemini:gemini-2.5-pro:pro"
            image_partition = "global"
            "#,
        );
        assert_eq!(settings.rate_limit_max_requests, 3);
        assert_eq!(settings.retry_max_attempts, 5);
        assert_eq!(settings.breaker_failure_threshold, 5);
        assert_eq!(
            settings
                .model_chain(CommandType::Analysis)
                .expect("chain")
                .len(),
            1
        );
        assert_eq!(
            settings.partition_policy(CommandType::Image),
            Ok(PartitionPolicy::Global)
        );
    }

    #[test]
    fn test_default_chains_parse() {
        let settings = DispatchSettings::default();
        let analysis = settings
            .model_chain(CommandType::Analysis)
            .expect("default chain");
        assert_eq!(analysis[0].model_class, "pro");
        assert_eq!(analysis[2].provider, "openrouter");
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        let settings = DispatchSettings {
            retry_max_attempts: 0,
            ..DispatchSettings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(DispatchError::Configuration(_))
        ));

        let settings = DispatchSettings {
            queue_retention_capacity: 0,
            ..DispatchSettings::default()
        };
        assert!(settings.validate().is_err());

        let settings = DispatchSettings {
            chat_models: Some(" , ".to_string()),
            ..DispatchSettings::default()
        };
        assert!(settings.validate().is_err());

        let settings = DispatchSettings {
            speech_partition: Some("per-user".to_string()),
            ..DispatchSettings::default()
        };
        assert!(settings.validate().is_err());
    }
}
