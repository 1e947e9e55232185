use async_trait::async_trait;
use futures::StreamExt;
use log::debug;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{upstream_err, ChatClient, ChatTurn, ReplyStream};
use crate::error::{ChatError, ChatResult};
use crate::llm::LlmConfig;

/// Ollama chat client. The /api/chat endpoint streams newline-delimited
/// JSON objects, one fragment per line.
#[derive(Debug)]
pub struct OllamaChatClient {
    http: HttpClient,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
}

#[derive(Deserialize)]
struct StreamResponse {
    message: Option<StreamMessage>,
    done: bool,
}

#[derive(Deserialize)]
struct StreamMessage {
    content: String,
}

impl OllamaChatClient {
    pub fn new(base_url: Option<String>, model: Option<String>) -> Self {
        let model = model.unwrap_or_else(|| "cogito:3b".to_string());
        let base_url = base_url.unwrap_or_else(|| "http://localhost:11434".to_string());

        Self {
            http: HttpClient::new(),
            base_url,
            model,
        }
    }

    pub fn from_config(config: &LlmConfig) -> ChatResult<Self> {
        Ok(Self::new(config.base_url.clone(), config.model.clone()))
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ChatClient for OllamaChatClient {
    async fn stream_reply(
        &self,
        system_prompt: &str,
        history: &[ChatTurn],
        user_text: &str,
    ) -> ChatResult<ReplyStream> {
        let mut messages = vec![WireMessage {
            role: "system".to_string(),
            content: system_prompt.to_string(),
        }];
        for turn in history {
            messages.push(WireMessage {
                role: turn.role.clone(),
                content: turn.content.clone(),
            });
        }
        messages.push(WireMessage {
            role: "user".to_string(),
            content: user_text.to_string(),
        });

        let req = ChatRequest {
            model: self.model.clone(),
            messages,
            stream: true,
        };

        let url = self.chat_url();
        let client = self.http.clone();
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            let resp = match client.post(&url).json(&req).send().await {
                Ok(r) => r,
                Err(e) => {
                    let _ = tx.send(Err(upstream_err(e))).await;
                    return;
                }
            };

            if !resp.status().is_success() {
                let _ = tx
                    .send(Err(ChatError::Upstream(format!(
                        "ollama returned HTTP {}",
                        resp.status()
                    ))))
                    .await;
                return;
            }

            let mut stream = resp.bytes_stream();
            while let Some(chunk_result) = stream.next().await {
                let chunk = match chunk_result {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(upstream_err(e))).await;
                        return;
                    }
                };
                let Ok(text) = String::from_utf8(chunk.to_vec()) else {
                    continue;
                };

                for line in text.lines() {
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<StreamResponse>(line) {
                        Ok(parsed) => {
                            if let Some(message) = parsed.message {
                                if !message.content.is_empty()
                                    && tx.send(Ok(message.content)).await.is_err()
                                {
                                    return;
                                }
                            }
                            if parsed.done {
                                return;
                            }
                        }
                        Err(e) => {
                            debug!("unparsable NDJSON line skipped: {} ({})", line, e);
                        }
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
