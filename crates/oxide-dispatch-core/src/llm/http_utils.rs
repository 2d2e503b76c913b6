//! HTTP utilities for providers
//!
//! Sends JSON requests and turns HTTP failures into [`ProviderOutcome`]
//! classes: which responses mean "rotate the key", which mean "the key is
//! done for today", which mean "the provider is down" and which mean "the
//! request itself is bad".

use crate::llm::ProviderOutcome;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client as HttpClient, StatusCode};
use serde_json::Value;
use std::time::Duration;

/// Longest error body excerpt carried into logs
const MAX_ERROR_EXCERPT: usize = 500;

/// Creates an HTTP client with the given request timeout.
#[must_use]
pub fn create_http_client(timeout: Duration) -> HttpClient {
    HttpClient::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| HttpClient::new())
}

/// Sends a POST with a JSON body and returns the parsed JSON response.
///
/// # Errors
///
/// Returns the classified [`ProviderOutcome`] for transport failures and
/// non-success status codes.
pub async fn send_json_request(
    client: &HttpClient,
    url: &str,
    body: &Value,
    headers: &[(&str, &str)],
) -> Result<Value, ProviderOutcome> {
    let mut request = client.post(url).json(body);
    for (key, value) in headers {
        request = request.header(*key, *value);
    }

    let response = request.send().await.map_err(classify_transport)?;

    let status = response.status();
    if !status.is_success() {
        let retry_after = parse_retry_after(response.headers());
        let error_text = response.text().await.unwrap_or_default();
        return Err(classify_status(status, retry_after, &error_text));
    }

    response
        .json()
        .await
        .map_err(|e| ProviderOutcome::DependencyError {
            reason: format!("malformed response body: {e}"),
        })
}

fn classify_transport(error: reqwest::Error) -> ProviderOutcome {
    let kind = if error.is_timeout() {
        "timeout"
    } else if error.is_connect() {
        "connection failed"
    } else {
        "transport error"
    };
    // reqwest errors can embed the request URL; drop it so keys in query
    // strings never reach the logs.
    let detail = error.without_url().to_string();
    ProviderOutcome::DependencyError {
        reason: format!("{kind}: {detail}"),
    }
}

/// Maps an HTTP error status (and body) to an outcome class.
pub(crate) fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> ProviderOutcome {
    let summary = summarize_error_body(status, body);
    match status.as_u16() {
        429 if is_daily_quota(body) => ProviderOutcome::QuotaExhausted,
        429 => ProviderOutcome::RateLimited {
            retry_after: retry_after.or_else(|| parse_retry_delay(body)),
        },
        // Out of credits (OpenRouter) or revoked / invalid key: take the key
        // out of rotation until the next reset.
        401 | 402 | 403 => ProviderOutcome::QuotaExhausted,
        408 | 500..=599 => ProviderOutcome::DependencyError { reason: summary },
        _ => ProviderOutcome::Rejected { reason: summary },
    }
}

fn is_daily_quota(body: &str) -> bool {
    let lower = body.to_lowercase();
    ["perday", "per_day", "per day", "daily"]
        .iter()
        .any(|marker| lower.contains(marker))
}

/// `Retry-After` in whole seconds, if present.
pub(crate) fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Gemini puts its hint in `error.details[].retryDelay` as e.g. `"37s"`.
pub(crate) fn parse_retry_delay(body: &str) -> Option<Duration> {
    let json: Value = serde_json::from_str(body).ok()?;
    json.pointer("/error/details")?
        .as_array()?
        .iter()
        .filter_map(|detail| detail.get("retryDelay")?.as_str())
        .find_map(|delay| {
            let secs: f64 = delay.trim().trim_end_matches('s').parse().ok()?;
            (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
        })
}

fn summarize_error_body(status: StatusCode, body: &str) -> String {
    let trimmed = body.trim_start();
    let is_html = trimmed.starts_with("<!DOCTYPE")
        || trimmed.starts_with("<html")
        || trimmed.starts_with("<HTML");
    if is_html {
        return format!("{status} (server returned an HTML error page)");
    }

    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|json| {
            json.pointer("/error/message")
                .and_then(Value::as_str)
                .map(ToString::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string());

    if message.chars().count() > MAX_ERROR_EXCERPT {
        let excerpt: String = message.chars().take(MAX_ERROR_EXCERPT).collect();
        format!("{status} - {excerpt}... (truncated)")
    } else if message.is_empty() {
        status.to_string()
    } else {
        format!("{status} - {message}")
    }
}

/// Extracts a string by navigating a path of keys and array indices.
///
/// # Errors
///
/// Returns `DependencyError` if the path is missing or not a string.
pub fn extract_text_content(response: &Value, path: &[&str]) -> Result<String, ProviderOutcome> {
    let mut current = response;
    for segment in path {
        let next = match segment.parse::<usize>() {
            Ok(index) => current.get(index),
            Err(_) => current.get(*segment),
        };
        current = next.ok_or_else(|| ProviderOutcome::DependencyError {
            reason: format!("unexpected response shape: missing '{segment}'"),
        })?;
    }

    current
        .as_str()
        .map(ToString::to_string)
        .ok_or_else(|| ProviderOutcome::DependencyError {
            reason: "unexpected response shape: expected a string".to_string(),
        })
}
