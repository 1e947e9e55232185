pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use std::sync::Arc;

use crate::cli::Args;
use crate::error::{ChatError, ChatResult};
use crate::models::chat::{Conversation, Message, UserProfile};

/// Durable message append + bounded pagination per conversation.
///
/// Each operation is independently atomic; the pipeline depends on that, not
/// on cross-call transactions.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create(&self, message: &Message) -> ChatResult<()>;

    /// Oldest-to-newest page of non-deleted messages, at most `limit`,
    /// strictly older than `before` when given.
    async fn list(
        &self,
        conversation_id: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> ChatResult<Vec<Message>>;

    async fn get(&self, conversation_id: &str, message_id: &str) -> ChatResult<Option<Message>>;

    /// Full replace by id (delivery/read-set growth, reactions).
    async fn update(&self, message: &Message) -> ChatResult<()>;

    async fn soft_delete(&self, conversation_id: &str, message_id: &str) -> ChatResult<()>;
}

/// Conversation aggregate store: participants, admins, last-message summary,
/// per-participant hidden flag.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get(&self, id: &str) -> ChatResult<Option<Conversation>>;

    /// Conversations the user participates in and has not hidden, most recent
    /// activity first.
    async fn list_for_user(&self, user_id: &str) -> ChatResult<Vec<Conversation>>;

    /// Looks up the direct conversation between two users. Hidden
    /// conversations count: a hidden direct chat is reused, not duplicated.
    async fn find_direct(&self, user_a: &str, user_b: &str) -> ChatResult<Option<Conversation>>;

    async fn create(&self, conversation: &Conversation) -> ChatResult<()>;

    /// Single-aggregate replace.
    async fn update(&self, conversation: &Conversation) -> ChatResult<()>;

    async fn set_participant_hidden(
        &self,
        conversation_id: &str,
        user_id: &str,
        hidden: bool,
    ) -> ChatResult<()>;
}

/// User lookup and substring search, consumed by the mention resolver and the
/// pipeline for sender profiles. User CRUD itself is out of scope; `upsert`
/// exists for seeding and for the agent identity.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get(&self, id: &str) -> ChatResult<Option<UserProfile>>;

    async fn search(
        &self,
        query: &str,
        exclude_user_id: &str,
        limit: usize,
    ) -> ChatResult<Vec<UserProfile>>;

    async fn upsert(&self, user: &UserProfile) -> ChatResult<()>;
}

pub struct Stores {
    pub messages: Arc<dyn MessageStore>,
    pub conversations: Arc<dyn ConversationStore>,
    pub directory: Arc<dyn UserDirectory>,
}

pub fn create_stores(args: &Args) -> ChatResult<Stores> {
    match args.store_type.to_lowercase().as_str() {
        "memory" => {
            info!("Using in-memory stores (state is lost on restart)");
            Ok(Stores {
                messages: Arc::new(memory::MemoryMessageStore::new()),
                conversations: Arc::new(memory::MemoryConversationStore::new()),
                directory: Arc::new(memory::MemoryUserDirectory::new()),
            })
        }
        "redis" => {
            info!("Using Redis stores at {}", args.store_redis_url);
            let backend = redis::RedisBackend::new(args)?;
            Ok(Stores {
                messages: Arc::new(redis::RedisMessageStore::new(backend.clone())),
                conversations: Arc::new(redis::RedisConversationStore::new(backend.clone())),
                directory: Arc::new(redis::RedisUserDirectory::new(backend)),
            })
        }
        other => Err(ChatError::Validation(format!(
            "Unsupported store type: {}",
            other
        ))),
    }
}
