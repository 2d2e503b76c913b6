use super::text_prompt;
use crate::config::{OPENROUTER_API_BASE, OPENROUTER_CHAT_TEMPERATURE};
use crate::llm::http_utils::{create_http_client, extract_text_content, send_json_request};
use crate::llm::{CommandPayload, ModelSpec, ProviderAdapter, ProviderOutcome, ProviderResult};
use crate::resilience::key_pool::Credential;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use reqwest::Client as HttpClient;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

/// `OpenRouter` adapter (gateway fallback)
pub struct OpenRouterProvider {
    http_client: HttpClient,
    api_base: String,
    site_url: String,
    site_name: String,
}

impl OpenRouterProvider {
    /// Create a new `OpenRouter` provider instance
    #[must_use]
    pub fn new(site_url: String, site_name: String, timeout: Duration) -> Self {
        Self {
            http_client: create_http_client(timeout),
            api_base: OPENROUTER_API_BASE.to_string(),
            site_url,
            site_name,
        }
    }

    /// Point the adapter at another endpoint (proxies, tests).
    #[must_use]
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl ProviderAdapter for OpenRouterProvider {
    async fn invoke(
        &self,
        credential: &Credential,
        model: &ModelSpec,
        payload: &CommandPayload,
    ) -> ProviderOutcome {
        let Some(body) = build_request(model, payload) else {
            return ProviderOutcome::Rejected {
                reason: format!("{} is not supported by OpenRouter", payload.command_type()),
            };
        };
        debug!(
            model = %model,
            credential = credential.id(),
            command = %payload.command_type(),
            "OpenRouter request"
        );

        let url = format!("{}/chat/completions", self.api_base);
        let auth = format!("Bearer {}", credential.secret());
        let mut headers = vec![("Authorization", auth.as_str())];
        if !self.site_url.is_empty() {
            headers.push(("HTTP-Referer", self.site_url.as_str()));
        }
        if !self.site_name.is_empty() {
            headers.push(("X-Title", self.site_name.as_str()));
        }

        match send_json_request(&self.http_client, &url, &body, &headers).await {
            Ok(response) => parse_response(&response, payload),
            Err(outcome) => outcome,
        }
    }
}

fn build_request(model: &ModelSpec, payload: &CommandPayload) -> Option<Value> {
    if let Some(prompt) = text_prompt(payload) {
        let mut messages = vec![json!({"role": "system", "content": prompt.system})];
        for msg in prompt.history {
            messages.push(json!({"role": msg.role, "content": msg.content}));
        }
        messages.push(json!({"role": "user", "content": prompt.user}));

        return Some(json!({
            "model": model.model_id,
            "messages": messages,
            "max_tokens": model.max_tokens,
            "temperature": OPENROUTER_CHAT_TEMPERATURE
        }));
    }

    match payload {
        CommandPayload::Image { prompt } => Some(json!({
            "model": model.model_id,
            "messages": [{"role": "user", "content": prompt}],
            "modalities": ["image", "text"]
        })),
        _ => None,
    }
}

fn parse_response(response: &Value, payload: &CommandPayload) -> ProviderOutcome {
    // OpenRouter reports upstream failures inside a 200 body.
    if let Some(error) = response.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown upstream error");
        return ProviderOutcome::DependencyError {
            reason: format!("upstream error: {message}"),
        };
    }

    let finish_reason = response
        .pointer("/choices/0/finish_reason")
        .and_then(Value::as_str);
    if finish_reason == Some("content_filter") {
        return ProviderOutcome::Rejected {
            reason: "response blocked by content filter".to_string(),
        };
    }

    if let CommandPayload::Image { .. } = payload {
        return match response
            .pointer("/choices/0/message/images/0/image_url/url")
            .and_then(Value::as_str)
        {
            Some(url) => decode_data_url(url),
            None => ProviderOutcome::Rejected {
                reason: extract_text_content(response, &["choices", "0", "message", "content"])
                    .unwrap_or_else(|_| "model returned no image".to_string()),
            },
        };
    }

    match extract_text_content(response, &["choices", "0", "message", "content"]) {
        Ok(text) => ProviderOutcome::Ok(ProviderResult::Text(text)),
        Err(outcome) => outcome,
    }
}

/// Decodes `data:<mime>;base64,<payload>`.
fn decode_data_url(url: &str) -> ProviderOutcome {
    let decoded = url.strip_prefix("data:").and_then(|rest| {
        let (meta, encoded) = rest.split_once(',')?;
        let mime_type = meta.strip_suffix(";base64")?;
        let data = BASE64.decode(encoded).ok()?;
        Some((mime_type.to_string(), Bytes::from(data)))
    });

    match decoded {
        Some((mime_type, data)) => ProviderOutcome::Ok(ProviderResult::Image { mime_type, data }),
        None => ProviderOutcome::DependencyError {
            reason: "image is not a base64 data URL".to_string(),
        },
    }
}
