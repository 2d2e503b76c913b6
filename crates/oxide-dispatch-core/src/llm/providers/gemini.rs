use super::text_prompt;
use crate::config::{GEMINI_API_BASE, GEMINI_CHAT_TEMPERATURE, GEMINI_IMAGE_TEMPERATURE};
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

/// Google Gemini adapter (primary, multi-key, daily quota)
pub struct GeminiProvider {
    http_client: HttpClient,
    api_base: String,
}

impl GeminiProvider {
    /// Create a new Gemini provider instance
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            http_client: create_http_client(timeout),
            api_base: GEMINI_API_BASE.to_string(),
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
impl ProviderAdapter for GeminiProvider {
    async fn invoke(
        &self,
        credential: &Credential,
        model: &ModelSpec,
        payload: &CommandPayload,
    ) -> ProviderOutcome {
        let url = format!("{}/models/{}:generateContent", self.api_base, model.model_id);
        let body = build_request(model, payload);
        debug!(
            model = %model,
            credential = credential.id(),
            command = %payload.command_type(),
            "Gemini request"
        );

        let headers = [("x-goog-api-key", credential.secret())];
        match send_json_request(&self.http_client, &url, &body, &headers).await {
            Ok(response) => parse_response(&response, payload),
            Err(outcome) => outcome,
        }
    }
}

const SAFETY_SETTINGS: [(&str, &str); 4] = [
    ("HARM_CATEGORY_HARASSMENT", "BLOCK_NONE"),
    ("HARM_CATEGORY_HATE_SPEECH", "BLOCK_NONE"),
    ("HARM_CATEGORY_SEXUALLY_EXPLICIT", "BLOCK_NONE"),
    ("HARM_CATEGORY_DANGEROUS_CONTENT", "BLOCK_NONE"),
];

fn safety_settings() -> Value {
    SAFETY_SETTINGS
        .iter()
        .map(|(category, threshold)| json!({"category": category, "threshold": threshold}))
        .collect()
}

fn build_request(model: &ModelSpec, payload: &CommandPayload) -> Value {
    if let Some(prompt) = text_prompt(payload) {
        let mut contents: Vec<Value> = prompt
            .history
            .iter()
            .filter(|msg| msg.role != "system")
            .map(|msg| {
                let role = if msg.role == "user" { "user" } else { "model" };
                json!({"role": role, "parts": [{"text": msg.content}]})
            })
            .collect();
        contents.push(json!({"role": "user", "parts": [{"text": prompt.user}]}));

        return json!({
            "contents": contents,
            "system_instruction": {"parts": [{"text": prompt.system}]},
            "generationConfig": {
                "temperature": GEMINI_CHAT_TEMPERATURE,
                "maxOutputTokens": model.max_tokens
            },
            "safetySettings": safety_settings()
        });
    }

    match payload {
        CommandPayload::Speech { text, voice } => json!({
            "contents": [{"parts": [{"text": text}]}],
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": {"prebuiltVoiceConfig": {"voiceName": voice}}
                }
            }
        }),
        CommandPayload::Image { prompt } => json!({
            "contents": [{"parts": [{"text": prompt}]}],
            "generationConfig": {
                "temperature": GEMINI_IMAGE_TEMPERATURE,
                "responseModalities": ["TEXT", "IMAGE"]
            },
            "safetySettings": safety_settings()
        }),
        // Text payloads were handled above.
        _ => json!({}),
    }
}

fn parse_response(response: &Value, payload: &CommandPayload) -> ProviderOutcome {
    if let Some(reason) = response
        .pointer("/promptFeedback/blockReason")
        .and_then(Value::as_str)
    {
        return ProviderOutcome::Rejected {
            reason: format!("prompt blocked: {reason}"),
        };
    }

    let finish_reason = response
        .pointer("/candidates/0/finishReason")
        .and_then(Value::as_str);
    if let Some(reason @ ("SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST" | "IMAGE_SAFETY")) =
        finish_reason
    {
        return ProviderOutcome::Rejected {
            reason: format!("response blocked: {reason}"),
        };
    }

    match payload {
        CommandPayload::Speech { .. } => match inline_data(response) {
            Ok(Some((mime_type, data))) => {
                ProviderOutcome::Ok(ProviderResult::Audio { mime_type, data })
            }
            Ok(None) => missing("audio"),
            Err(outcome) => outcome,
        },
        CommandPayload::Image { .. } => match inline_data(response) {
            Ok(Some((mime_type, data))) => {
                ProviderOutcome::Ok(ProviderResult::Image { mime_type, data })
            }
            // Image models answer with text when they decline to draw.
            Ok(None) => match first_text(response) {
                Some(text) => ProviderOutcome::Rejected { reason: text },
                None => missing("image"),
            },
            Err(outcome) => outcome,
        },
        _ => match extract_text_content(
            response,
            &["candidates", "0", "content", "parts", "0", "text"],
        ) {
            Ok(text) => ProviderOutcome::Ok(ProviderResult::Text(text)),
            Err(outcome) => outcome,
        },
    }
}

fn parts(response: &Value) -> &[Value] {
    response
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .map_or(&[][..], Vec::as_slice)
}

fn first_text(response: &Value) -> Option<String> {
    parts(response)
        .iter()
        .find_map(|part| part.get("text")?.as_str())
        .map(ToString::to_string)
}

/// First `inlineData` part as (mime type, decoded bytes).
fn inline_data(response: &Value) -> Result<Option<(String, Bytes)>, ProviderOutcome> {
    let Some(inline) = parts(response)
        .iter()
        .find_map(|part| part.get("inlineData").or_else(|| part.get("inline_data")))
    else {
        return Ok(None);
    };

    let mime_type = inline
        .get("mimeType")
        .or_else(|| inline.get("mime_type"))
        .and_then(Value::as_str)
        .unwrap_or("application/octet-stream")
        .to_string();
    let encoded = inline.get("data").and_then(Value::as_str).unwrap_or_default();
    let data = BASE64
        .decode(encoded)
        .map_err(|e| ProviderOutcome::DependencyError {
            reason: format!("invalid base64 in inline data: {e}"),
        })?;
    Ok(Some((mime_type, Bytes::from(data))))
}

fn missing(what: &str) -> ProviderOutcome {
    ProviderOutcome::DependencyError {
        reason: format!("response contained no {what}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Message;

    fn flash() -> ModelSpec {
        ModelSpec::new("gemini", "gemini-2.5-flash", "flash")
    }

    #[test]
    fn test_chat_request_maps_roles() {
        let payload = CommandPayload::Chat {
            system_prompt: "be brief".to_string(),
            history: vec![Message::user("hi"), Message::assistant("hello")],
            message: "how are you".to_string(),
        };
        let body = build_request(&flash(), &payload);
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["contents"][2]["parts"][0]["text"], "how are you");
        assert_eq!(body["system_instruction"]["parts"][0]["text"], "be brief");
        assert_eq!(
            body["generationConfig"]["maxOutputTokens"],
            json!(flash().max_tokens)
        );
    }

    #[test]
    fn test_speech_request_selects_voice() {
        let payload = CommandPayload::Speech {
            text: "hello".to_string(),
            voice: "Kore".to_string(),
        };
        let body = build_request(&flash(), &payload);
        assert_eq!(body["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            body["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                ["voiceName"],
            "Kore"
        );
    }

    #[test]
    fn test_parse_text_response() {
        let response = json!({
            "candidates": [{"content": {"parts": [{"text": "42"}]}, "finishReason": "STOP"}]
        });
        let payload = CommandPayload::Analyze {
            chat_id: 1,
            instruction: "sum".to_string(),
            content: "40 + 2".to_string(),
        };
        assert_eq!(
            parse_response(&response, &payload),
            ProviderOutcome::Ok(ProviderResult::Text("42".to_string()))
        );
    }

    #[test]
    fn test_parse_audio_response() {
        let response = json!({
            "candidates": [{"content": {"parts": [{
                "inlineData": {"mimeType": "audio/L16;codec=pcm;rate=24000", "data": "AAEC"}
            }]}}]
        });
        let payload = CommandPayload::Speech {
            text: "hi".to_string(),
            voice: "Kore".to_string(),
        };
        assert_eq!(
            parse_response(&response, &payload),
            ProviderOutcome::Ok(ProviderResult::Audio {
                mime_type: "audio/L16;codec=pcm;rate=24000".to_string(),
                data: Bytes::from_static(&[0, 1, 2]),
            })
        );
    }

    #[test]
    fn test_image_refusal_is_rejection() {
        let response = json!({
            "candidates": [{"content": {"parts": [{"text": "I can't draw that."}]}}]
        });
        let payload = CommandPayload::Image {
            prompt: "something".to_string(),
        };
        assert!(matches!(
            parse_response(&response, &payload),
            ProviderOutcome::Rejected { .. }
        ));
    }

    #[test]
    fn test_safety_block_is_rejection() {
        let payload = CommandPayload::Chat {
            system_prompt: String::new(),
            history: Vec::new(),
            message: "x".to_string(),
        };
        let blocked_prompt = json!({"promptFeedback": {"blockReason": "SAFETY"}});
        assert!(matches!(
            parse_response(&blocked_prompt, &payload),
            ProviderOutcome::Rejected { .. }
        ));

        let blocked_answer = json!({"candidates": [{"finishReason": "SAFETY"}]});
        assert!(matches!(
            parse_response(&blocked_answer, &payload),
            ProviderOutcome::Rejected { .. }
        ));
    }

    #[test]
    fn test_empty_candidates_is_dependency_error() {
        let payload = CommandPayload::Chat {
            system_prompt: String::new(),
            history: Vec::new(),
            message: "x".to_string(),
        };
        assert!(matches!(
            parse_response(&json!({"candidates": []}), &payload),
            ProviderOutcome::DependencyError { .. }
        ));
    }
}
