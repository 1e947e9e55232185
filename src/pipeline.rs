//! The message send pipeline and conversation lifecycle operations.
//!
//! `ChatService` is the single entry point both transports (WebSocket frames
//! and the HTTP API) dispatch into. Persistence always happens before any
//! broadcast; a send that fails to persist produces no events at all.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info};

use crate::agent::AgentOrchestrator;
use crate::error::{ChatError, ChatResult};
use crate::fanout::Fanout;
use crate::mention::{build_group_name, MentionResolver};
use crate::models::chat::{
    new_conversation_id, new_message_id, Conversation, ConversationKind, Message, MessageContent,
    UserProfile,
};
use crate::models::websocket::{SendMessageRequest, ServerEvent};
use crate::store::{ConversationStore, MessageStore, UserDirectory};

pub struct ChatService {
    messages: Arc<dyn MessageStore>,
    conversations: Arc<dyn ConversationStore>,
    directory: Arc<dyn UserDirectory>,
    fanout: Arc<Fanout>,
    mentions: MentionResolver,
    agent: Arc<AgentOrchestrator>,
    page_limit: usize,
}

impl ChatService {
    pub fn new(
        messages: Arc<dyn MessageStore>,
        conversations: Arc<dyn ConversationStore>,
        directory: Arc<dyn UserDirectory>,
        fanout: Arc<Fanout>,
        agent: Arc<AgentOrchestrator>,
        page_limit: usize,
    ) -> Self {
        let mentions = MentionResolver::new(directory.clone());
        Self {
            messages,
            conversations,
            directory,
            fanout,
            mentions,
            agent,
            page_limit,
        }
    }

    /// The full send pipeline: validate, persist, refresh the conversation
    /// summary, reactivate hidden participants, deliver, resolve mentions,
    /// then maybe start an agent turn. Returns the persisted message for the
    /// caller's ack.
    pub async fn send_message(
        &self,
        sender_id: &str,
        request: SendMessageRequest,
    ) -> ChatResult<Message> {
        let content = content_from_request(&request);
        if content.is_empty() {
            return Err(ChatError::Validation(
                "message needs text or media".to_string(),
            ));
        }

        let mut conversation = self.load_conversation(&request.conversation_id).await?;
        let sender = conversation
            .participant(sender_id)
            .cloned()
            .ok_or_else(|| {
                ChatError::Forbidden(format!(
                    "{} is not a participant of {}",
                    sender_id, request.conversation_id
                ))
            })?;

        let message = Message {
            id: new_message_id(),
            conversation_id: conversation.id.clone(),
            sender_id: sender_id.to_string(),
            sender_name: sender.display_name.clone(),
            sender_avatar: sender.avatar_url.clone(),
            message_type: request
                .message_type
                .clone()
                .unwrap_or_else(|| "text".to_string()),
            content,
            reply_to: request.reply_to.clone(),
            timestamp: Utc::now(),
            delivered_to: Vec::new(),
            read_by: Vec::new(),
            reactions: HashMap::new(),
            is_deleted: false,
            deleted_at: None,
        };
        self.messages.create(&message).await?;

        // A new message reactivates everyone else who had hidden the
        // conversation. The sender's own flag is left alone.
        let reactivated: Vec<String> = conversation
            .participants
            .iter()
            .filter(|p| p.is_hidden && p.user_id != sender_id)
            .map(|p| p.user_id.clone())
            .collect();
        for p in conversation.participants.iter_mut() {
            if p.user_id != sender_id {
                p.is_hidden = false;
            }
        }
        conversation.touch(message.summary());
        self.conversations.update(&conversation).await?;

        for user_id in &reactivated {
            debug!("reactivating hidden participant {}", user_id);
            self.fanout.publish_to_user(
                user_id,
                &ServerEvent::ConversationNew {
                    conversation: conversation.clone(),
                },
            );
        }

        let event = ServerEvent::MessageNew {
            message: message.clone(),
        };
        for p in &conversation.participants {
            self.fanout.publish_to_user(&p.user_id, &event);
        }

        if message.message_type == "text" {
            conversation = self
                .add_mentioned_participants(conversation, sender_id, message.text())
                .await?;
        }

        if self.agent.should_trigger(&conversation, &message) {
            let agent = self.agent.clone();
            let trigger = message.clone();
            tokio::spawn(agent.run_turn(trigger));
        }

        Ok(message)
    }

    /// Pulls users mentioned by `@name` into the conversation. A direct
    /// conversation that gains a third participant is promoted to a group.
    async fn add_mentioned_participants(
        &self,
        mut conversation: Conversation,
        sender_id: &str,
        text: &str,
    ) -> ChatResult<Conversation> {
        let newcomers = self
            .mentions
            .resolve_new_participants(&conversation, sender_id, text)
            .await?;
        if newcomers.is_empty() {
            return Ok(conversation);
        }

        let now = Utc::now();
        let mut added_ids: Vec<String> = Vec::new();
        for user in &newcomers {
            if conversation.add_participant(user, now) {
                added_ids.push(user.id.clone());
            }
        }
        if added_ids.is_empty() {
            return Ok(conversation);
        }

        if conversation.kind == ConversationKind::Direct {
            conversation.kind = ConversationKind::Group;
            if conversation.admin_ids.is_empty() {
                conversation.admin_ids.push(sender_id.to_string());
            }
            if conversation.name.as_deref().map_or(true, str::is_empty) {
                conversation.name = Some(build_group_name(&conversation.participants));
            }
            info!(
                "conversation {} promoted to group '{}'",
                conversation.id,
                conversation.name.as_deref().unwrap_or("")
            );
        }
        conversation.updated_at = now;
        self.conversations.update(&conversation).await?;

        let updated = ServerEvent::ConversationUpdated {
            conversation: conversation.clone(),
        };
        let announced = ServerEvent::ParticipantsAdded {
            conversation_id: conversation.id.clone(),
            user_ids: added_ids.clone(),
        };
        for p in &conversation.participants {
            if added_ids.contains(&p.user_id) {
                self.fanout.publish_to_user(
                    &p.user_id,
                    &ServerEvent::ConversationNew {
                        conversation: conversation.clone(),
                    },
                );
            } else {
                self.fanout.publish_to_user(&p.user_id, &updated);
                self.fanout.publish_to_user(&p.user_id, &announced);
            }
        }
        for user_id in &added_ids {
            self.fanout.join_user(user_id, &conversation.id);
        }

        Ok(conversation)
    }

    /// Finds or creates the direct conversation between two users. Finding an
    /// existing one unhides it for the caller instead of duplicating it.
    pub async fn start_direct(&self, user_id: &str, other_id: &str) -> ChatResult<Conversation> {
        if user_id == other_id {
            return Err(ChatError::Validation(
                "cannot start a conversation with yourself".to_string(),
            ));
        }

        if let Some(existing) = self.conversations.find_direct(user_id, other_id).await? {
            if existing.participant(user_id).is_some_and(|p| p.is_hidden) {
                self.conversations
                    .set_participant_hidden(&existing.id, user_id, false)
                    .await?;
            }
            return self.load_conversation(&existing.id).await;
        }

        let me = self.require_user(user_id).await?;
        let other = self.require_user(other_id).await?;

        let now = Utc::now();
        let mut conversation = Conversation {
            id: new_conversation_id(),
            kind: ConversationKind::Direct,
            participants: Vec::new(),
            admin_ids: Vec::new(),
            name: None,
            last_message: None,
            created_at: now,
            updated_at: now,
        };
        conversation.add_participant(&me, now);
        conversation.add_participant(&other, now);
        self.conversations.create(&conversation).await?;

        let event = ServerEvent::ConversationNew {
            conversation: conversation.clone(),
        };
        self.fanout.publish_to_user(user_id, &event);
        self.fanout.publish_to_user(other_id, &event);
        self.fanout.join_user(user_id, &conversation.id);
        self.fanout.join_user(other_id, &conversation.id);

        Ok(conversation)
    }

    /// Creates a group with the caller as admin. Unknown member ids fail the
    /// whole call; the name falls back to one synthesized from members.
    pub async fn create_group(
        &self,
        creator_id: &str,
        name: Option<String>,
        member_ids: &[String],
    ) -> ChatResult<Conversation> {
        let creator = self.require_user(creator_id).await?;

        let now = Utc::now();
        let mut conversation = Conversation {
            id: new_conversation_id(),
            kind: ConversationKind::Group,
            participants: Vec::new(),
            admin_ids: vec![creator_id.to_string()],
            name: name.filter(|n| !n.trim().is_empty()),
            last_message: None,
            created_at: now,
            updated_at: now,
        };
        conversation.add_participant(&creator, now);
        for member_id in member_ids {
            if member_id == creator_id {
                continue;
            }
            let member = self.require_user(member_id).await?;
            conversation.add_participant(&member, now);
        }
        if conversation.name.is_none() {
            conversation.name = Some(build_group_name(&conversation.participants));
        }
        self.conversations.create(&conversation).await?;

        let event = ServerEvent::ConversationNew {
            conversation: conversation.clone(),
        };
        for p in &conversation.participants {
            self.fanout.publish_to_user(&p.user_id, &event);
            self.fanout.join_user(&p.user_id, &conversation.id);
        }

        Ok(conversation)
    }

    /// Hides the conversation for this user only. The next inbound message
    /// reactivates it.
    pub async fn hide_conversation(&self, user_id: &str, conversation_id: &str) -> ChatResult<()> {
        let conversation = self.load_conversation(conversation_id).await?;
        self.require_member(&conversation, user_id)?;
        self.conversations
            .set_participant_hidden(conversation_id, user_id, true)
            .await
    }

    /// Soft-deletes a message. Allowed for its sender and for conversation
    /// admins. The conversation summary is recomputed when the deleted
    /// message was the most recent one.
    pub async fn delete_message(
        &self,
        user_id: &str,
        conversation_id: &str,
        message_id: &str,
    ) -> ChatResult<()> {
        let mut conversation = self.load_conversation(conversation_id).await?;
        self.require_member(&conversation, user_id)?;

        let message = self
            .messages
            .get(conversation_id, message_id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("message {}", message_id)))?;
        if message.sender_id != user_id && !conversation.is_admin(user_id) {
            return Err(ChatError::Forbidden(
                "only the sender or an admin can delete a message".to_string(),
            ));
        }

        self.messages.soft_delete(conversation_id, message_id).await?;

        let was_latest = conversation
            .last_message
            .as_ref()
            .is_some_and(|lm| lm.timestamp == message.timestamp && lm.sender_id == message.sender_id);
        if was_latest {
            let remaining = self.messages.list(conversation_id, 1, None).await?;
            conversation.last_message = remaining.last().map(Message::summary);
            self.conversations.update(&conversation).await?;
            let updated = ServerEvent::ConversationUpdated {
                conversation: conversation.clone(),
            };
            for p in &conversation.participants {
                self.fanout.publish_to_user(&p.user_id, &updated);
            }
        }

        let event = ServerEvent::MessageDeleted {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
        };
        for p in &conversation.participants {
            self.fanout.publish_to_user(&p.user_id, &event);
        }
        Ok(())
    }

    pub async fn mark_delivered(
        &self,
        user_id: &str,
        conversation_id: &str,
        message_id: &str,
    ) -> ChatResult<()> {
        self.update_receipt(user_id, conversation_id, message_id, ReceiptKind::Delivered)
            .await
    }

    pub async fn mark_read(
        &self,
        user_id: &str,
        conversation_id: &str,
        message_id: &str,
    ) -> ChatResult<()> {
        self.update_receipt(user_id, conversation_id, message_id, ReceiptKind::Read)
            .await
    }

    async fn update_receipt(
        &self,
        user_id: &str,
        conversation_id: &str,
        message_id: &str,
        kind: ReceiptKind,
    ) -> ChatResult<()> {
        let conversation = self.load_conversation(conversation_id).await?;
        self.require_member(&conversation, user_id)?;

        let mut message = self
            .messages
            .get(conversation_id, message_id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("message {}", message_id)))?;

        let set = match kind {
            ReceiptKind::Delivered => &mut message.delivered_to,
            ReceiptKind::Read => &mut message.read_by,
        };
        if set.iter().any(|id| id == user_id) {
            return Ok(());
        }
        set.push(user_id.to_string());
        self.messages.update(&message).await?;

        let event = match kind {
            ReceiptKind::Delivered => ServerEvent::MessageDelivered {
                conversation_id: conversation_id.to_string(),
                message_id: message_id.to_string(),
                user_id: user_id.to_string(),
            },
            ReceiptKind::Read => ServerEvent::MessageRead {
                conversation_id: conversation_id.to_string(),
                message_id: message_id.to_string(),
                user_id: user_id.to_string(),
            },
        };
        self.fanout.publish_to_conversation(conversation_id, &event);
        Ok(())
    }

    /// One reaction per user per message; a new emoji replaces the old one.
    pub async fn add_reaction(
        &self,
        user_id: &str,
        conversation_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> ChatResult<()> {
        if emoji.trim().is_empty() {
            return Err(ChatError::Validation("empty reaction".to_string()));
        }
        let conversation = self.load_conversation(conversation_id).await?;
        self.require_member(&conversation, user_id)?;

        let mut message = self
            .messages
            .get(conversation_id, message_id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("message {}", message_id)))?;
        message
            .reactions
            .insert(user_id.to_string(), emoji.to_string());
        self.messages.update(&message).await?;

        self.fanout.publish_to_conversation(
            conversation_id,
            &ServerEvent::ReactionAdded {
                conversation_id: conversation_id.to_string(),
                message_id: message_id.to_string(),
                user_id: user_id.to_string(),
                emoji: emoji.to_string(),
            },
        );
        Ok(())
    }

    pub async fn remove_reaction(
        &self,
        user_id: &str,
        conversation_id: &str,
        message_id: &str,
    ) -> ChatResult<()> {
        let conversation = self.load_conversation(conversation_id).await?;
        self.require_member(&conversation, user_id)?;

        let mut message = self
            .messages
            .get(conversation_id, message_id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("message {}", message_id)))?;
        if message.reactions.remove(user_id).is_none() {
            return Ok(());
        }
        self.messages.update(&message).await?;

        self.fanout.publish_to_conversation(
            conversation_id,
            &ServerEvent::ReactionRemoved {
                conversation_id: conversation_id.to_string(),
                message_id: message_id.to_string(),
                user_id: user_id.to_string(),
            },
        );
        Ok(())
    }

    /// Ephemeral typing signal, fanned out to the conversation topic only.
    pub async fn set_typing(
        &self,
        user_id: &str,
        conversation_id: &str,
        is_typing: bool,
    ) -> ChatResult<()> {
        let conversation = self.load_conversation(conversation_id).await?;
        let participant = conversation.participant(user_id).ok_or_else(|| {
            ChatError::Forbidden(format!(
                "{} is not a participant of {}",
                user_id, conversation_id
            ))
        })?;

        self.fanout.publish_to_conversation(
            conversation_id,
            &ServerEvent::TypingUpdate {
                conversation_id: conversation_id.to_string(),
                user_id: user_id.to_string(),
                display_name: participant.display_name.clone(),
                is_typing,
            },
        );
        Ok(())
    }

    /// Paginated history, oldest-to-newest, capped at the configured page
    /// size. Membership is checked first.
    pub async fn list_messages(
        &self,
        user_id: &str,
        conversation_id: &str,
        limit: Option<usize>,
        before: Option<DateTime<Utc>>,
    ) -> ChatResult<Vec<Message>> {
        let conversation = self.load_conversation(conversation_id).await?;
        self.require_member(&conversation, user_id)?;

        let limit = limit
            .unwrap_or(self.page_limit)
            .clamp(1, self.page_limit.max(1));
        self.messages.list(conversation_id, limit, before).await
    }

    pub async fn list_conversations(&self, user_id: &str) -> ChatResult<Vec<Conversation>> {
        self.conversations.list_for_user(user_id).await
    }

    /// Visible conversation ids for the user, used to subscribe a fresh
    /// connection to its topics. Hidden conversations rejoin on reactivation.
    pub async fn conversation_ids_for(&self, user_id: &str) -> ChatResult<Vec<String>> {
        let list = self.conversations.list_for_user(user_id).await?;
        Ok(list.into_iter().map(|c| c.id).collect())
    }

    /// Membership gate for topic subscription.
    pub async fn ensure_member(&self, user_id: &str, conversation_id: &str) -> ChatResult<()> {
        let conversation = self.load_conversation(conversation_id).await?;
        self.require_member(&conversation, user_id)
    }

    async fn load_conversation(&self, conversation_id: &str) -> ChatResult<Conversation> {
        self.conversations
            .get(conversation_id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("conversation {}", conversation_id)))
    }

    fn require_member(&self, conversation: &Conversation, user_id: &str) -> ChatResult<()> {
        if conversation.is_participant(user_id) {
            Ok(())
        } else {
            Err(ChatError::Forbidden(format!(
                "{} is not a participant of {}",
                user_id, conversation.id
            )))
        }
    }

    async fn require_user(&self, user_id: &str) -> ChatResult<UserProfile> {
        self.directory
            .get(user_id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("user {}", user_id)))
    }
}

#[derive(Clone, Copy)]
enum ReceiptKind {
    Delivered,
    Read,
}

fn content_from_request(request: &SendMessageRequest) -> MessageContent {
    MessageContent {
        text: request.text.clone(),
        media_url: request.media_url.clone(),
        thumbnail_url: request.thumbnail_url.clone(),
        duration: request.duration,
        file_name: request.file_name.clone(),
        file_size: request.file_size.clone(),
    }
}
