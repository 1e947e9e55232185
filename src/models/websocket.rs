use serde::{Deserialize, Serialize};

use super::chat::{Conversation, Message};

/// Frames a client may send over the WebSocket.
#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientFrame {
    #[serde(rename = "send")]
    Send {
        #[serde(flatten)]
        request: SendMessageRequest,
    },
    #[serde(rename = "join")]
    Join { conversation_id: String },
    #[serde(rename = "leave")]
    Leave { conversation_id: String },
    #[serde(rename = "typing")]
    Typing {
        conversation_id: String,
        is_typing: bool,
    },
    #[serde(rename = "delivered")]
    Delivered {
        conversation_id: String,
        message_id: String,
    },
    #[serde(rename = "read")]
    Read {
        conversation_id: String,
        message_id: String,
    },
    #[serde(rename = "react")]
    React {
        conversation_id: String,
        message_id: String,
        emoji: String,
    },
    #[serde(rename = "unreact")]
    Unreact {
        conversation_id: String,
        message_id: String,
    },
    #[serde(rename = "delete")]
    Delete {
        conversation_id: String,
        message_id: String,
    },
}

/// The sendMessage call payload. Timestamps are never accepted from the
/// client; ids and timestamps are assigned server-side.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub conversation_id: String,
    #[serde(default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub duration: Option<u32>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
}

/// Everything the server pushes, over both the per-user channel and the
/// per-conversation channel. The tag doubles as the exposed event name.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ServerEvent {
    #[serde(rename = "message:new")]
    MessageNew { message: Message },
    #[serde(rename = "agent:start")]
    AgentStart { message: Message },
    #[serde(rename = "agent:chunk")]
    AgentChunk {
        conversation_id: String,
        message_id: String,
        chunk: String,
    },
    /// Carries the full final text so a client that missed chunks converges.
    #[serde(rename = "agent:complete")]
    AgentComplete {
        conversation_id: String,
        message_id: String,
        text: String,
    },
    #[serde(rename = "conversation:new")]
    ConversationNew { conversation: Conversation },
    #[serde(rename = "conversation:updated")]
    ConversationUpdated { conversation: Conversation },
    #[serde(rename = "participants:added")]
    ParticipantsAdded {
        conversation_id: String,
        user_ids: Vec<String>,
    },
    #[serde(rename = "message:deleted")]
    MessageDeleted {
        conversation_id: String,
        message_id: String,
    },
    #[serde(rename = "message:delivered")]
    MessageDelivered {
        conversation_id: String,
        message_id: String,
        user_id: String,
    },
    #[serde(rename = "message:read")]
    MessageRead {
        conversation_id: String,
        message_id: String,
        user_id: String,
    },
    #[serde(rename = "reaction:added")]
    ReactionAdded {
        conversation_id: String,
        message_id: String,
        user_id: String,
        emoji: String,
    },
    #[serde(rename = "reaction:removed")]
    ReactionRemoved {
        conversation_id: String,
        message_id: String,
        user_id: String,
    },
    #[serde(rename = "typing:update")]
    TypingUpdate {
        conversation_id: String,
        user_id: String,
        display_name: String,
        is_typing: bool,
    },
    /// Per-connection reply to a `send` frame, carrying the persisted message.
    #[serde(rename = "ack")]
    Ack { message: Message },
    #[serde(rename = "error")]
    Error { code: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_send_frame_parses() {
        let raw = r#"{"type":"send","conversationId":"c1","text":"hello"}"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        match frame {
            ClientFrame::Send { request } => {
                assert_eq!(request.conversation_id, "c1");
                assert_eq!(request.text.as_deref(), Some("hello"));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn server_event_tag_is_event_name() {
        let event = ServerEvent::AgentChunk {
            conversation_id: "c1".into(),
            message_id: "m1".into(),
            chunk: "hi".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event":"agent:chunk""#));
    }
}
