//! Testing helpers and mock utilities.
//!
//! Provides convenient constructors for mocked provider adapters and common
//! payloads.

use crate::llm::{CommandPayload, MockProviderAdapter, ProviderOutcome, ProviderResult};

/// Analysis of chat `chat_id` with a fixed instruction and the given `content`.
#[must_use]
pub fn analysis(chat_id: i64, content: &str) -> CommandPayload {
    CommandPayload::Analyze {
        chat_id,
        instruction: "Summarize".to_string(),
        content: content.to_string(),
    }
}

/// Create a mock adapter that echoes text payloads.
///
/// Analysis returns `echo: <content>`, chat `echo: <message>`, translation
/// `echo: <text>`. Speech and image payloads are rejected.
#[must_use]
pub fn echo_adapter() -> MockProviderAdapter {
    let mut mock = MockProviderAdapter::new();
    mock.expect_invoke()
        .returning(|_, _, payload| match payload {
            CommandPayload::Analyze { content, .. } => {
                ProviderOutcome::Ok(ProviderResult::Text(format!("echo: {content}")))
            }
            CommandPayload::Chat { message, .. } => {
                ProviderOutcome::Ok(ProviderResult::Text(format!("echo: {message}")))
            }
            CommandPayload::Translate { text, .. } => {
                ProviderOutcome::Ok(ProviderResult::Text(format!("echo: {text}")))
            }
            CommandPayload::Speech { .. } | CommandPayload::Image { .. } => {
                ProviderOutcome::Rejected {
                    reason: "not supported by echo adapter".to_string(),
                }
            }
        });
    mock
}
