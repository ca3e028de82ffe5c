use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use shared::{
    domain::{Contact, ConversationId, PresenceState},
    protocol::ChatMessage,
};

use crate::contacts::mention_tag;

pub const AI_FALLBACK_TEXT: &str =
    "Sorry, I seem to be having trouble connecting. Please try again later.";

/// Text chunks in arrival order.
pub type AiStream = BoxStream<'static, Result<String>>;

#[derive(Debug, Clone)]
pub struct AiRequest {
    pub persona: Contact,
    pub prompt: String,
    pub history: Vec<ChatMessage>,
}

#[async_trait]
pub trait AiResponder: Send + Sync {
    async fn respond(&self, request: AiRequest) -> Result<AiStream>;
}

pub struct MissingAiResponder;

#[async_trait]
impl AiResponder for MissingAiResponder {
    async fn respond(&self, request: AiRequest) -> Result<AiStream> {
        Err(anyhow!(
            "AI backend unavailable for persona {}",
            request.persona.id
        ))
    }
}

pub fn default_personas() -> Vec<Contact> {
    [
        (
            "code-assistant",
            "Code Assistant",
            "You are an expert code assistant. You help users write, debug, and understand code. \
             Provide clear explanations and put code in markdown blocks.",
        ),
        (
            "research-assistant",
            "Research Assistant",
            "You are a meticulous research assistant. Summarize documents, find key information \
             and cite sources when available.",
        ),
        (
            "daily-quotes-assistant",
            "Daily Quotes",
            "Respond to every message with one uplifting quote and its author, nothing else.",
        ),
        (
            "comedian-assistant",
            "Ravi the Relaxer",
            "You are Ravi, a warm comedian. Keep replies brief, light-hearted and relaxing.",
        ),
    ]
    .into_iter()
    .map(|(id, name, instruction)| Contact {
        system_instruction: Some(instruction.to_string()),
        is_ai: true,
        status: PresenceState::Online,
        ..Contact::person(ConversationId::from(id), name)
    })
    .collect()
}

/// Prompt for a persona addressed inside a group chat.
pub fn group_prompt(persona: &Contact, group_name: &str, sender_name: &str, text: &str) -> String {
    let stripped = text.replacen(&mention_tag(persona), "", 1);
    format!(
        "(You are in a group chat named \"{group_name}\". User \"{sender_name}\" is talking to you.)\n\n{}",
        stripped.trim()
    )
}

#[cfg(test)]
#[path = "tests/ai_tests.rs"]
mod tests;
