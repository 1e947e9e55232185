//! The resident AI agent.
//!
//! The agent is an ordinary conversation participant with a fixed user id.
//! When a turn triggers, the orchestrator announces a placeholder message,
//! streams reply fragments from the upstream model into it, then persists the
//! finished text. Upstream failures degrade to a fixed fallback line; they
//! never surface as errors to chat users.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use log::{error, info, warn};
use tokio::sync::Semaphore;

use crate::error::ChatResult;
use crate::fanout::Fanout;
use crate::llm::chat::{ChatClient, ChatTurn};
use crate::mention::AGENT_MENTION;
use crate::models::chat::{
    new_message_id, Conversation, ConversationKind, Message, MessageContent, UserProfile,
};
use crate::models::websocket::ServerEvent;
use crate::store::{ConversationStore, MessageStore, UserDirectory};

#[derive(Clone, Debug)]
pub struct AgentIdentity {
    pub user_id: String,
    pub display_name: String,
}

impl AgentIdentity {
    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.user_id.clone(),
            handle: self.display_name.to_lowercase(),
            display_name: self.display_name.clone(),
            avatar_url: String::new(),
            email: format!("{}@agent.local", self.user_id),
        }
    }
}

pub struct AgentOrchestrator {
    client: Arc<dyn ChatClient>,
    messages: Arc<dyn MessageStore>,
    conversations: Arc<dyn ConversationStore>,
    directory: Arc<dyn UserDirectory>,
    fanout: Arc<Fanout>,
    identity: AgentIdentity,
    system_prompt: String,
    fallback_text: String,
    history_depth: usize,
    /// Bounds concurrent upstream calls across all conversations. A permit is
    /// taken after the placeholder broadcast and held until the turn ends.
    gate: Arc<Semaphore>,
}

impl AgentOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<dyn ChatClient>,
        messages: Arc<dyn MessageStore>,
        conversations: Arc<dyn ConversationStore>,
        directory: Arc<dyn UserDirectory>,
        fanout: Arc<Fanout>,
        identity: AgentIdentity,
        system_prompt: String,
        fallback_text: String,
        history_depth: usize,
        max_concurrent: usize,
    ) -> Self {
        Self {
            client,
            messages,
            conversations,
            directory,
            fanout,
            identity,
            system_prompt,
            fallback_text,
            history_depth,
            gate: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }

    /// Whether a freshly sent message should start an agent turn. A direct
    /// two-party conversation with the agent always does; elsewhere a text
    /// message must address it with the agent token. The agent never
    /// replies to itself.
    pub fn should_trigger(&self, conversation: &Conversation, message: &Message) -> bool {
        if message.sender_id == self.identity.user_id {
            return false;
        }
        if message.message_type == "text" && message.text().contains(AGENT_MENTION) {
            return true;
        }
        conversation.kind == ConversationKind::Direct
            && conversation.participants.len() == 2
            && conversation.is_participant(&self.identity.user_id)
    }

    /// Adds the agent to the conversation if it is not a participant yet.
    async fn ensure_participant(&self, conversation_id: &str) -> ChatResult<()> {
        let mut conversation = self
            .conversations
            .get(conversation_id)
            .await?
            .ok_or_else(|| {
                crate::error::ChatError::NotFound(format!(
                    "conversation {} vanished before agent turn",
                    conversation_id
                ))
            })?;

        let profile = match self.directory.get(&self.identity.user_id).await? {
            Some(p) => p,
            None => self.identity.profile(),
        };

        if conversation.add_participant(&profile, Utc::now()) {
            self.conversations.update(&conversation).await?;
            let event = ServerEvent::ConversationUpdated {
                conversation: conversation.clone(),
            };
            for p in &conversation.participants {
                self.fanout.publish_to_user(&p.user_id, &event);
            }
        }
        Ok(())
    }

    /// Runs one full agent turn for the triggering message. Spawned by the
    /// send pipeline; all failures are logged, none propagate.
    pub async fn run_turn(self: Arc<Self>, trigger: Message) {
        if let Err(e) = self.ensure_participant(&trigger.conversation_id).await {
            error!(
                "agent turn skipped for conversation {}: {}",
                trigger.conversation_id, e
            );
            return;
        }

        let reply_id = new_message_id();
        let placeholder = self.agent_message(&trigger.conversation_id, &reply_id, String::new());
        self.fanout.publish_to_conversation(
            &trigger.conversation_id,
            &ServerEvent::AgentStart {
                message: placeholder,
            },
        );

        let text = self.accumulate_reply(&trigger, &reply_id).await;

        if !text.is_empty() {
            let reply = self.agent_message(&trigger.conversation_id, &reply_id, text.clone());
            if let Err(e) = self.messages.create(&reply).await {
                error!("failed to persist agent reply {}: {}", reply_id, e);
                return;
            }
            if let Err(e) = self.touch_conversation(&trigger.conversation_id, &reply).await {
                warn!(
                    "last-message update failed for {}: {}",
                    trigger.conversation_id, e
                );
            }
        }

        // Empty text still completes, so clients can drop the placeholder.
        self.fanout.publish_to_conversation(
            &trigger.conversation_id,
            &ServerEvent::AgentComplete {
                conversation_id: trigger.conversation_id.clone(),
                message_id: reply_id,
                text,
            },
        );
    }

    /// Streams fragments from the upstream model, broadcasting each one, and
    /// returns the accumulated reply. Any upstream failure swaps the whole
    /// accumulation for the fallback line.
    async fn accumulate_reply(&self, trigger: &Message, reply_id: &str) -> String {
        let _permit = match self.gate.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                warn!("agent gate closed, falling back");
                return self.fallback_text.clone();
            }
        };

        let history = match self.build_history(trigger).await {
            Ok(h) => h,
            Err(e) => {
                warn!("history load failed, replying without context: {}", e);
                Vec::new()
            }
        };
        let prompt = prompt_text(trigger.text());

        let mut stream = match self
            .client
            .stream_reply(&self.system_prompt, &history, &prompt)
            .await
        {
            Ok(s) => s,
            Err(e) => {
                warn!("upstream call failed: {}", e);
                return self.fallback_text.clone();
            }
        };

        let mut accumulated = String::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(fragment) => {
                    accumulated.push_str(&fragment);
                    self.fanout.publish_to_conversation(
                        &trigger.conversation_id,
                        &ServerEvent::AgentChunk {
                            conversation_id: trigger.conversation_id.clone(),
                            message_id: reply_id.to_string(),
                            chunk: fragment,
                        },
                    );
                }
                Err(e) => {
                    warn!("upstream stream failed mid-reply: {}", e);
                    return self.fallback_text.clone();
                }
            }
        }

        info!(
            "agent turn for {} produced {} chars",
            trigger.conversation_id,
            accumulated.len()
        );
        accumulated
    }

    /// Recent non-deleted messages of the conversation as model turns, oldest
    /// first, excluding the triggering message. The agent's own messages map
    /// to the assistant role.
    async fn build_history(&self, trigger: &Message) -> ChatResult<Vec<ChatTurn>> {
        let recent = self
            .messages
            .list(&trigger.conversation_id, self.history_depth, None)
            .await?;

        let turns = recent
            .into_iter()
            .filter(|m| m.id != trigger.id)
            .filter_map(|m| {
                let text = m.text().trim().to_string();
                if text.is_empty() {
                    return None;
                }
                Some(if m.sender_id == self.identity.user_id {
                    ChatTurn::assistant(text)
                } else {
                    ChatTurn::user(format!("{}: {}", m.sender_name, text))
                })
            })
            .collect();
        Ok(turns)
    }

    async fn touch_conversation(&self, conversation_id: &str, reply: &Message) -> ChatResult<()> {
        if let Some(mut conversation) = self.conversations.get(conversation_id).await? {
            conversation.touch(reply.summary());
            self.conversations.update(&conversation).await?;
            let participants: Vec<String> = conversation
                .participants
                .iter()
                .map(|p| p.user_id.clone())
                .collect();
            let event = ServerEvent::ConversationUpdated { conversation };
            for user_id in participants {
                self.fanout.publish_to_user(&user_id, &event);
            }
        }
        Ok(())
    }

    fn agent_message(&self, conversation_id: &str, message_id: &str, text: String) -> Message {
        Message {
            id: message_id.to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: self.identity.user_id.clone(),
            sender_name: self.identity.display_name.clone(),
            sender_avatar: String::new(),
            message_type: "text".to_string(),
            content: MessageContent::text(text),
            reply_to: None,
            timestamp: Utc::now(),
            delivered_to: Vec::new(),
            read_by: Vec::new(),
            reactions: HashMap::new(),
            is_deleted: false,
            deleted_at: None,
        }
    }

}

/// Strips the agent token so the model never sees the trigger syntax. Falls
/// back to the raw text when stripping leaves nothing.
fn prompt_text(raw: &str) -> String {
    let stripped = raw.replace(AGENT_MENTION, " ");
    let cleaned = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.is_empty() {
        raw.to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_text_strips_agent_token() {
        assert_eq!(prompt_text("@@ what is rust"), "what is rust");
        assert_eq!(prompt_text("hey @@ tell me @@ more"), "hey tell me more");
        // Nothing but the token keeps the raw text rather than an empty prompt.
        assert_eq!(prompt_text("@@"), "@@");
    }
}
