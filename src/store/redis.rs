//! Redis store backends.
//!
//! Layout, all under a configurable key prefix:
//! - `conv:{id}`        conversation aggregate as JSON
//! - `user-convs:{uid}` set of conversation ids per user
//! - `msg-ids:{conv}`   list of message ids in append order
//! - `msgs:{conv}`      hash of message id -> message JSON
//! - `user:{id}`        user profile as JSON
//! - `users`            set of all user ids

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Client};

use crate::cli::Args;
use crate::error::{ChatError, ChatResult};
use crate::models::chat::{Conversation, ConversationKind, Message, UserProfile};
use crate::store::{ConversationStore, MessageStore, UserDirectory};

/// How many ids one backwards pagination step pulls from the order list.
const PAGE_WINDOW: isize = 128;

#[derive(Clone)]
pub struct RedisBackend {
    client: Client,
    prefix: String,
}

impl RedisBackend {
    pub fn new(args: &Args) -> ChatResult<Self> {
        Ok(Self {
            client: Client::open(args.store_redis_url.as_str())?,
            prefix: args.store_redis_prefix.clone(),
        })
    }

    async fn conn(&self) -> ChatResult<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn key(&self, rest: &str) -> String {
        format!("{}{}", self.prefix, rest)
    }
}

pub struct RedisMessageStore {
    backend: RedisBackend,
}

impl RedisMessageStore {
    pub fn new(backend: RedisBackend) -> Self {
        Self { backend }
    }

    fn ids_key(&self, conversation_id: &str) -> String {
        self.backend.key(&format!("msg-ids:{}", conversation_id))
    }

    fn hash_key(&self, conversation_id: &str) -> String {
        self.backend.key(&format!("msgs:{}", conversation_id))
    }
}

#[async_trait]
impl MessageStore for RedisMessageStore {
    async fn create(&self, message: &Message) -> ChatResult<()> {
        let mut conn = self.backend.conn().await?;
        let json = serde_json::to_string(message)?;
        let _: () = conn
            .hset(self.hash_key(&message.conversation_id), &message.id, json)
            .await?;
        let _: () = conn
            .rpush(self.ids_key(&message.conversation_id), &message.id)
            .await?;
        Ok(())
    }

    async fn list(
        &self,
        conversation_id: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> ChatResult<Vec<Message>> {
        let mut conn = self.backend.conn().await?;
        let ids_key = self.ids_key(conversation_id);
        let hash_key = self.hash_key(conversation_id);
        let total: isize = conn.llen(&ids_key).await?;

        // Walk the order list backwards in windows, newest first, until the
        // page fills or the list is exhausted.
        let mut page: Vec<Message> = Vec::new();
        let mut end = total;
        while end > 0 && page.len() < limit {
            let start = (end - PAGE_WINDOW).max(0);
            let ids: Vec<String> = conn.lrange(&ids_key, start, end - 1).await?;
            end = start;

            for id in ids.iter().rev() {
                let raw: Option<String> = conn.hget(&hash_key, id).await?;
                let Some(raw) = raw else { continue };
                let msg: Message = serde_json::from_str(&raw)?;
                if msg.is_deleted {
                    continue;
                }
                if before.map_or(false, |b| msg.timestamp >= b) {
                    continue;
                }
                page.push(msg);
                if page.len() >= limit {
                    break;
                }
            }
        }

        page.reverse();
        Ok(page)
    }

    async fn get(&self, conversation_id: &str, message_id: &str) -> ChatResult<Option<Message>> {
        let mut conn = self.backend.conn().await?;
        let raw: Option<String> = conn.hget(self.hash_key(conversation_id), message_id).await?;
        raw.map(|s| serde_json::from_str(&s).map_err(ChatError::from))
            .transpose()
    }

    async fn update(&self, message: &Message) -> ChatResult<()> {
        let mut conn = self.backend.conn().await?;
        let hash_key = self.hash_key(&message.conversation_id);
        let exists: bool = conn.hexists(&hash_key, &message.id).await?;
        if !exists {
            return Err(ChatError::NotFound(format!("message {}", message.id)));
        }
        let json = serde_json::to_string(message)?;
        let _: () = conn.hset(hash_key, &message.id, json).await?;
        Ok(())
    }

    async fn soft_delete(&self, conversation_id: &str, message_id: &str) -> ChatResult<()> {
        let mut msg = self
            .get(conversation_id, message_id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("message {}", message_id)))?;
        msg.is_deleted = true;
        msg.deleted_at = Some(Utc::now());
        self.update(&msg).await
    }
}

pub struct RedisConversationStore {
    backend: RedisBackend,
}

impl RedisConversationStore {
    pub fn new(backend: RedisBackend) -> Self {
        Self { backend }
    }

    fn conv_key(&self, id: &str) -> String {
        self.backend.key(&format!("conv:{}", id))
    }

    fn user_key(&self, user_id: &str) -> String {
        self.backend.key(&format!("user-convs:{}", user_id))
    }

    async fn write(&self, conversation: &Conversation) -> ChatResult<()> {
        let mut conn = self.backend.conn().await?;
        let json = serde_json::to_string(conversation)?;
        let _: () = conn.set(self.conv_key(&conversation.id), json).await?;
        for p in &conversation.participants {
            let _: () = conn
                .sadd(self.user_key(&p.user_id), &conversation.id)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for RedisConversationStore {
    async fn get(&self, id: &str) -> ChatResult<Option<Conversation>> {
        let mut conn = self.backend.conn().await?;
        let raw: Option<String> = conn.get(self.conv_key(id)).await?;
        raw.map(|s| serde_json::from_str(&s).map_err(ChatError::from))
            .transpose()
    }

    async fn list_for_user(&self, user_id: &str) -> ChatResult<Vec<Conversation>> {
        let mut conn = self.backend.conn().await?;
        let ids: Vec<String> = conn.smembers(self.user_key(user_id)).await?;
        let mut out: Vec<Conversation> = Vec::new();
        for id in ids {
            let raw: Option<String> = conn.get(self.conv_key(&id)).await?;
            let Some(raw) = raw else { continue };
            let conv: Conversation = serde_json::from_str(&raw)?;
            if conv.participant(user_id).map_or(false, |p| !p.is_hidden) {
                out.push(conv);
            }
        }
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }

    async fn find_direct(&self, user_a: &str, user_b: &str) -> ChatResult<Option<Conversation>> {
        // Scans the raw membership set, not the visibility-filtered listing:
        // a hidden direct conversation must still be found and reused.
        let mut conn = self.backend.conn().await?;
        let ids: Vec<String> = conn.smembers(self.user_key(user_a)).await?;
        for id in ids {
            let raw: Option<String> = conn.get(self.conv_key(&id)).await?;
            let Some(raw) = raw else { continue };
            let conv: Conversation = serde_json::from_str(&raw)?;
            if conv.kind == ConversationKind::Direct
                && conv.is_participant(user_a)
                && conv.is_participant(user_b)
            {
                return Ok(Some(conv));
            }
        }
        Ok(None)
    }

    async fn create(&self, conversation: &Conversation) -> ChatResult<()> {
        self.write(conversation).await
    }

    async fn update(&self, conversation: &Conversation) -> ChatResult<()> {
        self.write(conversation).await
    }

    async fn set_participant_hidden(
        &self,
        conversation_id: &str,
        user_id: &str,
        hidden: bool,
    ) -> ChatResult<()> {
        let mut conv = self
            .get(conversation_id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("conversation {}", conversation_id)))?;
        match conv.participant_mut(user_id) {
            Some(p) => p.is_hidden = hidden,
            None => {
                return Err(ChatError::NotFound(format!(
                    "participant {} in conversation {}",
                    user_id, conversation_id
                )))
            }
        }
        self.write(&conv).await
    }
}

pub struct RedisUserDirectory {
    backend: RedisBackend,
}

impl RedisUserDirectory {
    pub fn new(backend: RedisBackend) -> Self {
        Self { backend }
    }

    fn user_key(&self, id: &str) -> String {
        self.backend.key(&format!("user:{}", id))
    }

    fn index_key(&self) -> String {
        self.backend.key("users")
    }
}

#[async_trait]
impl UserDirectory for RedisUserDirectory {
    async fn get(&self, id: &str) -> ChatResult<Option<UserProfile>> {
        let mut conn = self.backend.conn().await?;
        let raw: Option<String> = conn.get(self.user_key(id)).await?;
        raw.map(|s| serde_json::from_str(&s).map_err(ChatError::from))
            .transpose()
    }

    async fn search(
        &self,
        query: &str,
        exclude_user_id: &str,
        limit: usize,
    ) -> ChatResult<Vec<UserProfile>> {
        let mut conn = self.backend.conn().await?;
        let needle = query.to_lowercase();
        let ids: Vec<String> = conn.smembers(self.index_key()).await?;
        let mut matches: Vec<UserProfile> = Vec::new();
        for id in ids {
            if id == exclude_user_id {
                continue;
            }
            let raw: Option<String> = conn.get(self.user_key(&id)).await?;
            let Some(raw) = raw else { continue };
            let user: UserProfile = serde_json::from_str(&raw)?;
            if user.handle.to_lowercase().contains(&needle)
                || user.display_name.to_lowercase().contains(&needle)
            {
                matches.push(user);
            }
        }
        matches.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        matches.truncate(limit);
        Ok(matches)
    }

    async fn upsert(&self, user: &UserProfile) -> ChatResult<()> {
        let mut conn = self.backend.conn().await?;
        let json = serde_json::to_string(user)?;
        let _: () = conn.set(self.user_key(&user.id), json).await?;
        let _: () = conn.sadd(self.index_key(), &user.id).await?;
        Ok(())
    }
}
