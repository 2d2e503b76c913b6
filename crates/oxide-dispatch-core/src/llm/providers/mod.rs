mod gemini;
mod openrouter;

pub use gemini::GeminiProvider;
pub use openrouter::OpenRouterProvider;

/// Provider name of the primary, quota-tracked vendor
pub const GEMINI: &str = "gemini";
/// Provider name of the gateway fallback
pub const OPENROUTER: &str = "openrouter";

use crate::config::{ANALYSIS_SYSTEM_PROMPT, TRANSLATION_SYSTEM_PROMPT};
use crate::llm::{CommandPayload, Message};

/// Text-generation request shared by chat, translation and analysis
#[derive(Debug, PartialEq, Eq)]
struct TextPrompt<'a> {
    system: String,
    history: &'a [Message],
    user: String,
}

/// Lowers a text command into a system prompt plus user turn.
///
/// Returns `None` for speech and image payloads.
fn text_prompt(payload: &CommandPayload) -> Option<TextPrompt<'_>> {
    match payload {
        CommandPayload::Chat {
            system_prompt,
            history,
            message,
        } => Some(TextPrompt {
            system: system_prompt.clone(),
            history,
            user: message.clone(),
        }),
        CommandPayload::Translate {
            text,
            target_language,
        } => Some(TextPrompt {
            system: TRANSLATION_SYSTEM_PROMPT.replace("{language}", target_language),
            history: &[],
            user: text.clone(),
        }),
        CommandPayload::Analyze {
            instruction,
            content,
            ..
        } => Some(TextPrompt {
            system: ANALYSIS_SYSTEM_PROMPT.to_string(),
            history: &[],
            user: format!("{instruction}\n\n{content}"),
        }),
        CommandPayload::Speech { .. } | CommandPayload::Image { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translation_prompt_names_language() {
        let payload = CommandPayload::Translate {
            text: "Guten Morgen".to_string(),
            target_language: "English".to_string(),
        };
        let prompt = text_prompt(&payload).expect("text command");
        assert!(prompt.system.contains("English"));
        assert!(!prompt.system.contains("{language}"));
        assert_eq!(prompt.user, "Guten Morgen");
        assert!(prompt.history.is_empty());
    }

    #[test]
    fn test_media_commands_have_no_text_prompt() {
        let payload = CommandPayload::Image {
            prompt: "a red fox".to_string(),
        };
        assert_eq!(text_prompt(&payload), None);
    }
}
