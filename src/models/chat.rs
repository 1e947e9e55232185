use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub fn new_message_id() -> String {
    format!("msg_{}", Uuid::new_v4())
}

pub fn new_conversation_id() -> String {
    format!("conv_{}", Uuid::new_v4())
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub handle: String,
    pub display_name: String,
    pub avatar_url: String,
    pub email: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Direct,
    Group,
}

/// A user's membership record inside one conversation. Unique by `user_id`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    pub display_name: String,
    pub avatar_url: String,
    #[serde(default)]
    pub is_hidden: bool,
    #[serde(default)]
    pub cleared_at: Option<DateTime<Utc>>,
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    pub fn from_profile(user: &UserProfile, joined_at: DateTime<Utc>) -> Self {
        Self {
            user_id: user.id.clone(),
            display_name: user.display_name.clone(),
            avatar_url: user.avatar_url.clone(),
            is_hidden: false,
            cleared_at: None,
            joined_at,
        }
    }
}

/// Best-effort "most recent write observed by the writer". Not linearizable
/// under concurrent senders; see the concurrency notes in DESIGN.md.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub text: String,
    pub sender_id: String,
    pub sender_name: String,
    pub message_type: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub kind: ConversationKind,
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub admin_ids: Vec<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn participant_mut(&mut self, user_id: &str) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.user_id == user_id)
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.participant(user_id).is_some()
    }

    pub fn is_admin(&self, user_id: &str) -> bool {
        self.admin_ids.iter().any(|id| id == user_id)
    }

    /// Adds the user unless already present. Returns whether anything changed.
    pub fn add_participant(&mut self, user: &UserProfile, joined_at: DateTime<Utc>) -> bool {
        if self.is_participant(&user.id) {
            return false;
        }
        self.participants
            .push(Participant::from_profile(user, joined_at));
        true
    }

    pub fn touch(&mut self, summary: LastMessage) {
        self.updated_at = summary.timestamp;
        self.last_message = Some(summary);
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageContent {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    /// Seconds, for voice/video.
    #[serde(default)]
    pub duration: Option<u32>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<String>,
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.as_deref().map_or(true, |t| t.trim().is_empty())
            && self.media_url.as_deref().map_or(true, |u| u.trim().is_empty())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub sender_avatar: String,
    /// "text", "image", "video", "voice" or "file".
    pub message_type: String,
    pub content: MessageContent,
    #[serde(default)]
    pub reply_to: Option<String>,
    /// Server-assigned; client timestamps are never trusted.
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub delivered_to: Vec<String>,
    #[serde(default)]
    pub read_by: Vec<String>,
    #[serde(default)]
    pub reactions: HashMap<String, String>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn text(&self) -> &str {
        self.content.text.as_deref().unwrap_or("")
    }

    /// Conversation-list preview for the summary row.
    pub fn preview_text(&self) -> String {
        if let Some(text) = self.content.text.as_deref().filter(|t| !t.trim().is_empty()) {
            return text.to_string();
        }
        match self.message_type.as_str() {
            "image" => "[Image]".to_string(),
            "video" => "[Video]".to_string(),
            "voice" => "[Voice]".to_string(),
            "file" => "[File]".to_string(),
            _ => "[Message]".to_string(),
        }
    }

    pub fn summary(&self) -> LastMessage {
        LastMessage {
            text: self.preview_text(),
            sender_id: self.sender_id.clone(),
            sender_name: self.sender_name.clone(),
            message_type: self.message_type.clone(),
            timestamp: self.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str, name: &str) -> UserProfile {
        UserProfile {
            id: id.to_string(),
            handle: name.to_lowercase(),
            display_name: name.to_string(),
            avatar_url: String::new(),
            email: format!("{}@example.com", name.to_lowercase()),
        }
    }

    #[test]
    fn add_participant_is_idempotent() {
        let now = Utc::now();
        let mut conv = Conversation {
            id: new_conversation_id(),
            kind: ConversationKind::Direct,
            participants: vec![],
            admin_ids: vec![],
            name: None,
            last_message: None,
            created_at: now,
            updated_at: now,
        };
        assert!(conv.add_participant(&user("u_alice", "Alice"), now));
        assert!(!conv.add_participant(&user("u_alice", "Alice"), now));
        assert_eq!(conv.participants.len(), 1);
    }

    #[test]
    fn media_preview_text() {
        let msg = Message {
            id: new_message_id(),
            conversation_id: "c".into(),
            sender_id: "u".into(),
            sender_name: "U".into(),
            sender_avatar: String::new(),
            message_type: "image".into(),
            content: MessageContent {
                media_url: Some("https://cdn/img.png".into()),
                ..Default::default()
            },
            reply_to: None,
            timestamp: Utc::now(),
            delivered_to: vec![],
            read_by: vec![],
            reactions: HashMap::new(),
            is_deleted: false,
            deleted_at: None,
        };
        assert_eq!(msg.preview_text(), "[Image]");
    }
}
