pub mod ollama;
pub mod openai;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;

use self::ollama::OllamaChatClient;
use self::openai::OpenAIChatClient;
use super::{LlmConfig, LlmType};
use crate::error::{ChatError, ChatResult};

/// One prior exchange handed to the completion source.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChatTurn {
    /// "user" or "assistant".
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Lazy, finite, non-restartable fragment sequence from the upstream source.
pub type ReplyStream = Pin<Box<dyn Stream<Item = ChatResult<String>> + Send>>;

/// Upstream streaming completion source for agent turns.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn stream_reply(
        &self,
        system_prompt: &str,
        history: &[ChatTurn],
        user_text: &str,
    ) -> ChatResult<ReplyStream>;
}

pub fn new_client(config: &LlmConfig) -> ChatResult<Arc<dyn ChatClient>> {
    let client: Arc<dyn ChatClient> = match config.llm_type {
        LlmType::Ollama => Arc::new(OllamaChatClient::from_config(config)?),
        LlmType::OpenAI => Arc::new(OpenAIChatClient::from_config(config)?),
    };
    Ok(client)
}

pub(crate) fn upstream_err(e: impl std::fmt::Display) -> ChatError {
    ChatError::Upstream(e.to_string())
}
