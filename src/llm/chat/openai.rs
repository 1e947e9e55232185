use async_trait::async_trait;
use futures::StreamExt;
use log::debug;
use reqwest::header::AUTHORIZATION;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{upstream_err, ChatClient, ChatTurn, ReplyStream};
use crate::error::{ChatError, ChatResult};
use crate::llm::LlmConfig;

/// OpenAI-compatible chat completion client, consumed as an SSE stream.
pub struct OpenAIChatClient {
    http: HttpClient,
    api_key: String,
    model: String,
    base_url: String,
}

#[derive(Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    temperature: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct StreamResponse {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

impl OpenAIChatClient {
    pub fn new(api_key: String, model: Option<String>, base_url: Option<String>) -> Self {
        Self {
            http: HttpClient::new(),
            api_key,
            model: model.unwrap_or_else(|| "gpt-4o-mini".to_string()),
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
        }
    }

    pub fn from_config(config: &LlmConfig) -> ChatResult<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| ChatError::Validation("OpenAI API key is required".into()))?;
        Ok(Self::new(
            api_key,
            config.model.clone(),
            config.base_url.clone(),
        ))
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ChatClient for OpenAIChatClient {
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

        let req = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: 0.8,
            stream: true,
        };

        let url = self.completions_url();
        let client = self.http.clone();
        let auth_header = format!("Bearer {}", self.api_key);
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            let resp = match client
                .post(&url)
                .header(AUTHORIZATION, auth_header)
                .json(&req)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    let _ = tx.send(Err(upstream_err(e))).await;
                    return;
                }
            };

            if let Err(e) = resp.error_for_status_ref() {
                let _ = tx.send(Err(upstream_err(e))).await;
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
                    if line.is_empty() || line == "data: [DONE]" {
                        continue;
                    }
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    match serde_json::from_str::<StreamResponse>(data) {
                        Ok(parsed) => {
                            for choice in parsed.choices {
                                if let Some(content) = choice.delta.content {
                                    if !content.is_empty() && tx.send(Ok(content)).await.is_err() {
                                        return;
                                    }
                                }
                                if choice.finish_reason.as_deref() == Some("stop") {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            debug!("unparsable SSE line skipped: {} ({})", data, e);
                        }
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
