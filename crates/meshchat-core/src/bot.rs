//! Bridge to an external text-completion service.
//!
//! A message starting with `@bot` carries a prompt. The prompt and recent
//! history go to a [`CompletionService`]; the reply comes back either whole
//! or as a stream of text chunks, and is posted as a message from
//! `bot-<provider>`.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use meshchat_shared::constants::{BOT_SENDER_PREFIX, BOT_TRIGGER};
use meshchat_shared::{Message, MessageId, PeerIdentity};

use crate::error::CompletionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

/// Known completion providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotProvider {
    OpenAi,
    Claude,
    Grok,
    Groq,
}

impl BotProvider {
    pub fn tag(&self) -> &'static str {
        match self {
            BotProvider::OpenAi => "openai",
            BotProvider::Claude => "claude",
            BotProvider::Grok => "grok",
            BotProvider::Groq => "groq",
        }
    }

    /// Sender id used for the provider's replies.
    pub fn sender(&self) -> PeerIdentity {
        PeerIdentity::new(format!("{BOT_SENDER_PREFIX}{}", self.tag()))
    }
}

pub enum Completion {
    Text(String),
    Stream(BoxStream<'static, Result<String, CompletionError>>),
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Completion::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Completion::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[async_trait]
pub trait CompletionService: Send + Sync {
    fn provider(&self) -> BotProvider;

    async fn complete(
        &self,
        prompt: &str,
        history: &[ChatTurn],
    ) -> Result<Completion, CompletionError>;
}

/// `"@bot summarize this"` -> `Some("summarize this")`. The trigger must
/// open the message and be followed by a non-empty prompt.
pub fn extract_prompt(content: &str) -> Option<&str> {
    let rest = content.trim_start().strip_prefix(BOT_TRIGGER)?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let prompt = rest.trim();
    (!prompt.is_empty()).then_some(prompt)
}

/// The last `limit` messages, oldest first, excluding the triggering message.
pub fn build_history(messages: &[Message], exclude: &MessageId, limit: usize) -> Vec<ChatTurn> {
    let relevant: Vec<&Message> = messages.iter().filter(|m| &m.id != exclude).collect();
    let start = relevant.len().saturating_sub(limit);
    relevant[start..]
        .iter()
        .map(|m| ChatTurn {
            role: if m.sender_id.is_bot() {
                Role::Assistant
            } else {
                Role::User
            },
            content: m.content.clone(),
        })
        .collect()
}

/// Drain a completion into one string. A failing stream discards whatever
/// was received before the failure.
pub async fn collect(completion: Completion) -> Result<String, CompletionError> {
    match completion {
        Completion::Text(text) => Ok(text),
        Completion::Stream(mut chunks) => {
            let mut text = String::new();
            while let Some(chunk) = chunks.next().await {
                text.push_str(&chunk?);
            }
            Ok(text)
        }
    }
}
