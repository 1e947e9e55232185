//! End-to-end tests of the send pipeline against the in-memory stores, with
//! a scripted completion source standing in for the upstream model.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;

use cozytalk::agent::{AgentIdentity, AgentOrchestrator};
use cozytalk::error::{ChatError, ChatResult};
use cozytalk::fanout::Fanout;
use cozytalk::llm::chat::{ChatClient, ChatTurn, ReplyStream};
use cozytalk::models::chat::UserProfile;
use cozytalk::models::websocket::{SendMessageRequest, ServerEvent};
use cozytalk::pipeline::ChatService;
use cozytalk::store::memory::{MemoryConversationStore, MemoryMessageStore, MemoryUserDirectory};
use cozytalk::store::{ConversationStore, MessageStore, UserDirectory};

const AGENT_ID: &str = "user_ai_wa";
const FALLBACK: &str = "Sorry, I'm having trouble responding right now.";

#[derive(Clone)]
enum Script {
    Chunks(Vec<&'static str>),
    FailAfter(Vec<&'static str>),
}

struct ScriptedClient {
    script: Script,
}

#[async_trait]
impl ChatClient for ScriptedClient {
    async fn stream_reply(
        &self,
        _system_prompt: &str,
        _history: &[ChatTurn],
        _user_text: &str,
    ) -> ChatResult<ReplyStream> {
        let items: Vec<ChatResult<String>> = match &self.script {
            Script::Chunks(chunks) => chunks.iter().map(|c| Ok(c.to_string())).collect(),
            Script::FailAfter(chunks) => chunks
                .iter()
                .map(|c| Ok(c.to_string()))
                .chain(std::iter::once(Err(ChatError::Upstream(
                    "scripted failure".to_string(),
                ))))
                .collect(),
        };
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

struct Harness {
    service: Arc<ChatService>,
    fanout: Arc<Fanout>,
    messages: Arc<dyn MessageStore>,
    conversations: Arc<dyn ConversationStore>,
}

fn user(id: &str, handle: &str, name: &str) -> UserProfile {
    UserProfile {
        id: id.to_string(),
        handle: handle.to_string(),
        display_name: name.to_string(),
        avatar_url: String::new(),
        email: format!("{}@example.com", handle),
    }
}

async fn harness(script: Script) -> Harness {
    let messages: Arc<dyn MessageStore> = Arc::new(MemoryMessageStore::new());
    let conversations: Arc<dyn ConversationStore> = Arc::new(MemoryConversationStore::new());
    let directory: Arc<dyn UserDirectory> = Arc::new(MemoryUserDirectory::new());
    let fanout = Arc::new(Fanout::new());

    let identity = AgentIdentity {
        user_id: AGENT_ID.to_string(),
        display_name: "Wa".to_string(),
    };
    directory.upsert(&identity.profile()).await.unwrap();
    for u in [
        user("user_alice", "alice", "Alice Zhang"),
        user("user_bob", "bob", "Bob Tan"),
        user("user_carol", "carol", "Carol Lim"),
    ] {
        directory.upsert(&u).await.unwrap();
    }

    let orchestrator = Arc::new(AgentOrchestrator::new(
        Arc::new(ScriptedClient { script }),
        messages.clone(),
        conversations.clone(),
        directory.clone(),
        fanout.clone(),
        identity,
        "You are Wa.".to_string(),
        FALLBACK.to_string(),
        10,
        4,
    ));

    let service = Arc::new(ChatService::new(
        messages.clone(),
        conversations.clone(),
        directory,
        fanout.clone(),
        orchestrator,
        50,
    ));

    Harness {
        service,
        fanout,
        messages,
        conversations,
    }
}

fn text_request(conversation_id: &str, text: &str) -> SendMessageRequest {
    SendMessageRequest {
        conversation_id: conversation_id.to_string(),
        text: Some(text.to_string()),
        ..Default::default()
    }
}

fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

/// Receives events until the agent completion arrives, returning everything
/// seen along the way.
async fn collect_until_complete(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut out = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(event)) => {
                let done = matches!(event, ServerEvent::AgentComplete { .. });
                out.push(event);
                if done {
                    return out;
                }
            }
            _ => panic!("timed out waiting for agent completion"),
        }
    }
}

/// Polls until the conversation's persisted message count reaches `expected`.
async fn wait_for_message_count(
    messages: &Arc<dyn MessageStore>,
    conversation_id: &str,
    expected: usize,
) -> Vec<cozytalk::models::chat::Message> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let page = messages.list(conversation_id, 50, None).await.unwrap();
        if page.len() >= expected {
            return page;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "timed out waiting for {} messages, have {}",
                expected,
                page.len()
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn send_persists_once_and_updates_summary() {
    let h = harness(Script::Chunks(vec![])).await;
    let conv = h
        .service
        .start_direct("user_alice", "user_bob")
        .await
        .unwrap();

    let sent = h
        .service
        .send_message("user_alice", text_request(&conv.id, "hello bob"))
        .await
        .unwrap();

    let page = h.messages.list(&conv.id, 50, None).await.unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].id, sent.id);

    let stored = h.conversations.get(&conv.id).await.unwrap().unwrap();
    let last = stored.last_message.unwrap();
    assert_eq!(last.text, "hello bob");
    assert_eq!(last.sender_id, "user_alice");
    assert_eq!(last.timestamp, sent.timestamp);
}

#[tokio::test]
async fn send_reactivates_hidden_participants_exactly_once() {
    let h = harness(Script::Chunks(vec![])).await;
    let conv = h
        .service
        .start_direct("user_alice", "user_bob")
        .await
        .unwrap();
    h.service
        .hide_conversation("user_bob", &conv.id)
        .await
        .unwrap();

    let (_bob, mut bob_rx) = h.fanout.register("user_bob");
    h.service
        .send_message("user_alice", text_request(&conv.id, "you there?"))
        .await
        .unwrap();

    let events = drain(&mut bob_rx);
    let reactivations = events
        .iter()
        .filter(|e| matches!(e, ServerEvent::ConversationNew { .. }))
        .count();
    assert_eq!(reactivations, 1);
    assert!(events
        .iter()
        .any(|e| matches!(e, ServerEvent::MessageNew { .. })));

    let stored = h.conversations.get(&conv.id).await.unwrap().unwrap();
    assert!(!stored.participant("user_bob").unwrap().is_hidden);

    // A second send must not re-announce the conversation.
    h.service
        .send_message("user_alice", text_request(&conv.id, "hello again"))
        .await
        .unwrap();
    let events = drain(&mut bob_rx);
    assert!(!events
        .iter()
        .any(|e| matches!(e, ServerEvent::ConversationNew { .. })));
}

#[tokio::test]
async fn send_leaves_senders_own_hidden_flag_alone() {
    let h = harness(Script::Chunks(vec![])).await;
    let conv = h
        .service
        .start_direct("user_alice", "user_bob")
        .await
        .unwrap();
    h.service
        .hide_conversation("user_alice", &conv.id)
        .await
        .unwrap();
    h.service
        .hide_conversation("user_bob", &conv.id)
        .await
        .unwrap();

    h.service
        .send_message("user_alice", text_request(&conv.id, "still hiding"))
        .await
        .unwrap();

    let stored = h.conversations.get(&conv.id).await.unwrap().unwrap();
    assert!(stored.participant("user_alice").unwrap().is_hidden);
    assert!(!stored.participant("user_bob").unwrap().is_hidden);
}

#[tokio::test]
async fn send_to_missing_conversation_has_no_side_effects() {
    let h = harness(Script::Chunks(vec![])).await;
    let (_alice, mut alice_rx) = h.fanout.register("user_alice");

    let err = h
        .service
        .send_message("user_alice", text_request("conv_missing", "hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::NotFound(_)));

    assert!(drain(&mut alice_rx).is_empty());
    assert!(h
        .messages
        .list("conv_missing", 50, None)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn non_participant_send_is_forbidden() {
    let h = harness(Script::Chunks(vec![])).await;
    let conv = h
        .service
        .start_direct("user_alice", "user_bob")
        .await
        .unwrap();

    let err = h
        .service
        .send_message("user_carol", text_request(&conv.id, "let me in"))
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Forbidden(_)));
    assert_eq!(h.messages.list(&conv.id, 50, None).await.unwrap().len(), 0);
}

#[tokio::test]
async fn empty_message_is_rejected() {
    let h = harness(Script::Chunks(vec![])).await;
    let conv = h
        .service
        .start_direct("user_alice", "user_bob")
        .await
        .unwrap();

    let err = h
        .service
        .send_message("user_alice", text_request(&conv.id, "   "))
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Validation(_)));
}

#[tokio::test]
async fn mention_promotes_direct_to_named_group() {
    let h = harness(Script::Chunks(vec![])).await;
    let conv = h
        .service
        .start_direct("user_alice", "user_bob")
        .await
        .unwrap();

    let (_carol, mut carol_rx) = h.fanout.register("user_carol");
    h.service
        .send_message("user_alice", text_request(&conv.id, "hey @carol join us"))
        .await
        .unwrap();

    let stored = h.conversations.get(&conv.id).await.unwrap().unwrap();
    assert_eq!(
        stored.kind,
        cozytalk::models::chat::ConversationKind::Group
    );
    assert_eq!(stored.participants.len(), 3);
    assert!(stored.is_participant("user_carol"));
    assert!(stored.is_admin("user_alice"));
    assert!(!stored.name.unwrap().is_empty());

    // The pulled-in user learns about the conversation through her channel.
    let events = drain(&mut carol_rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, ServerEvent::ConversationNew { .. })));
}

#[tokio::test]
async fn mention_of_existing_participant_changes_nothing() {
    let h = harness(Script::Chunks(vec![])).await;
    let conv = h
        .service
        .start_direct("user_alice", "user_bob")
        .await
        .unwrap();

    h.service
        .send_message("user_alice", text_request(&conv.id, "right @bob?"))
        .await
        .unwrap();

    let stored = h.conversations.get(&conv.id).await.unwrap().unwrap();
    assert_eq!(
        stored.kind,
        cozytalk::models::chat::ConversationKind::Direct
    );
    assert_eq!(stored.participants.len(), 2);
}

#[tokio::test]
async fn agent_streams_chunks_in_order_and_persists_reply() {
    let h = harness(Script::Chunks(vec!["Hel", "lo ", "there"])).await;
    let conv = h
        .service
        .start_direct("user_alice", AGENT_ID)
        .await
        .unwrap();

    let (alice, mut alice_rx) = h.fanout.register("user_alice");
    h.fanout.join(&alice.id, &conv.id);
    h.service
        .send_message("user_alice", text_request(&conv.id, "hi wa"))
        .await
        .unwrap();

    let events = collect_until_complete(&mut alice_rx).await;

    // Persistence precedes the completion broadcast.
    let page = h.messages.list(&conv.id, 50, None).await.unwrap();
    assert_eq!(page.len(), 2);
    let reply = page.last().unwrap();
    assert_eq!(reply.sender_id, AGENT_ID);
    assert_eq!(reply.text(), "Hello there");
    let start_ids: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::AgentStart { message } => Some(message.id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(start_ids.len(), 1);

    // The start announcement precedes every chunk.
    let start_pos = events
        .iter()
        .position(|e| matches!(e, ServerEvent::AgentStart { .. }))
        .unwrap();
    let first_chunk_pos = events
        .iter()
        .position(|e| matches!(e, ServerEvent::AgentChunk { .. }))
        .unwrap();
    assert!(start_pos < first_chunk_pos);

    let chunks: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::AgentChunk { chunk, .. } => Some(chunk.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(chunks, vec!["Hel", "lo ", "there"]);

    let complete = events
        .iter()
        .find_map(|e| match e {
            ServerEvent::AgentComplete {
                message_id, text, ..
            } => Some((message_id.clone(), text.clone())),
            _ => None,
        })
        .expect("no completion event");
    assert_eq!(complete.0, start_ids[0]);
    assert_eq!(complete.1, "Hello there");
    assert_eq!(complete.0, reply.id);

    let stored = h.conversations.get(&conv.id).await.unwrap().unwrap();
    assert_eq!(stored.last_message.unwrap().sender_id, AGENT_ID);
}

#[tokio::test]
async fn agent_stream_reaches_only_joined_connections() {
    let h = harness(Script::Chunks(vec!["hey"])).await;
    let conv = h
        .service
        .start_direct("user_alice", AGENT_ID)
        .await
        .unwrap();

    let (joined, mut joined_rx) = h.fanout.register("user_alice");
    h.fanout.join(&joined.id, &conv.id);
    let (_detached, mut detached_rx) = h.fanout.register("user_alice");

    h.service
        .send_message("user_alice", text_request(&conv.id, "hi wa"))
        .await
        .unwrap();
    collect_until_complete(&mut joined_rx).await;

    // The connection that never joined the topic sees the per-user message
    // delivery but none of the live stream.
    let events = drain(&mut detached_rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, ServerEvent::MessageNew { .. })));
    assert!(!events.iter().any(|e| matches!(
        e,
        ServerEvent::AgentStart { .. }
            | ServerEvent::AgentChunk { .. }
            | ServerEvent::AgentComplete { .. }
    )));
}

#[tokio::test]
async fn agent_replies_in_group_only_when_addressed() {
    let h = harness(Script::Chunks(vec!["ok"])).await;
    let conv = h
        .service
        .create_group(
            "user_alice",
            None,
            &["user_bob".to_string(), AGENT_ID.to_string()],
        )
        .await
        .unwrap();

    // Plain group chatter does not wake the agent.
    h.service
        .send_message("user_alice", text_request(&conv.id, "morning all"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.messages.list(&conv.id, 50, None).await.unwrap().len(), 1);

    h.service
        .send_message("user_alice", text_request(&conv.id, "@@ summarize this"))
        .await
        .unwrap();
    let page = wait_for_message_count(&h.messages, &conv.id, 3).await;
    assert_eq!(page.last().unwrap().sender_id, AGENT_ID);
}

#[tokio::test]
async fn agent_stays_quiet_in_two_member_group() {
    let h = harness(Script::Chunks(vec!["uninvited"])).await;
    let conv = h
        .service
        .create_group("user_alice", None, &[AGENT_ID.to_string()])
        .await
        .unwrap();

    h.service
        .send_message("user_alice", text_request(&conv.id, "note to self"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let page = h.messages.list(&conv.id, 50, None).await.unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].sender_id, "user_alice");
}

#[tokio::test]
async fn agent_ignores_token_in_media_caption() {
    let h = harness(Script::Chunks(vec!["caption reply"])).await;
    let conv = h
        .service
        .create_group(
            "user_alice",
            None,
            &["user_bob".to_string(), AGENT_ID.to_string()],
        )
        .await
        .unwrap();

    let request = SendMessageRequest {
        conversation_id: conv.id.clone(),
        message_type: Some("image".to_string()),
        text: Some("@@ look at this".to_string()),
        media_url: Some("https://cdn.example.com/pic.png".to_string()),
        ..Default::default()
    };
    h.service.send_message("user_alice", request).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.messages.list(&conv.id, 50, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn agent_mention_pulls_agent_into_conversation() {
    let h = harness(Script::Chunks(vec!["hi"])).await;
    let conv = h
        .service
        .create_group("user_alice", Some("plans".to_string()), &["user_bob".to_string()])
        .await
        .unwrap();
    assert!(!conv.is_participant(AGENT_ID));

    h.service
        .send_message("user_alice", text_request(&conv.id, "@@ any ideas?"))
        .await
        .unwrap();
    wait_for_message_count(&h.messages, &conv.id, 2).await;

    let stored = h.conversations.get(&conv.id).await.unwrap().unwrap();
    assert!(stored.is_participant(AGENT_ID));
}

#[tokio::test]
async fn upstream_failure_produces_single_fallback_message() {
    let h = harness(Script::FailAfter(vec!["par", "tial"])).await;
    let conv = h
        .service
        .start_direct("user_alice", AGENT_ID)
        .await
        .unwrap();

    let (alice, mut alice_rx) = h.fanout.register("user_alice");
    h.fanout.join(&alice.id, &conv.id);
    h.service
        .send_message("user_alice", text_request(&conv.id, "hello?"))
        .await
        .unwrap();

    let events = collect_until_complete(&mut alice_rx).await;

    let page = h.messages.list(&conv.id, 50, None).await.unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page.last().unwrap().text(), FALLBACK);

    // The completion carries the fallback, not the partial accumulation.
    let complete = events
        .iter()
        .find_map(|e| match e {
            ServerEvent::AgentComplete { text, .. } => Some(text.clone()),
            _ => None,
        })
        .expect("no completion event");
    assert_eq!(complete, FALLBACK);
}

#[tokio::test]
async fn delete_by_non_sender_requires_admin() {
    let h = harness(Script::Chunks(vec![])).await;
    let conv = h
        .service
        .create_group("user_alice", None, &["user_bob".to_string(), "user_carol".to_string()])
        .await
        .unwrap();

    let sent = h
        .service
        .send_message("user_bob", text_request(&conv.id, "oops"))
        .await
        .unwrap();

    let err = h
        .service
        .delete_message("user_carol", &conv.id, &sent.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Forbidden(_)));

    // The group creator is admin and may delete.
    h.service
        .delete_message("user_alice", &conv.id, &sent.id)
        .await
        .unwrap();
    assert!(h.messages.list(&conv.id, 50, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn start_direct_is_idempotent() {
    let h = harness(Script::Chunks(vec![])).await;
    let a = h
        .service
        .start_direct("user_alice", "user_bob")
        .await
        .unwrap();
    let b = h
        .service
        .start_direct("user_bob", "user_alice")
        .await
        .unwrap();
    assert_eq!(a.id, b.id);
}

#[tokio::test]
async fn receipts_accumulate_without_duplicates() {
    let h = harness(Script::Chunks(vec![])).await;
    let conv = h
        .service
        .start_direct("user_alice", "user_bob")
        .await
        .unwrap();
    let sent = h
        .service
        .send_message("user_alice", text_request(&conv.id, "read me"))
        .await
        .unwrap();

    h.service
        .mark_read("user_bob", &conv.id, &sent.id)
        .await
        .unwrap();
    h.service
        .mark_read("user_bob", &conv.id, &sent.id)
        .await
        .unwrap();

    let stored = h.messages.get(&conv.id, &sent.id).await.unwrap().unwrap();
    assert_eq!(stored.read_by, vec!["user_bob".to_string()]);
}
