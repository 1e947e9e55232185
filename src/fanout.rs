//! In-process fanout transport.
//!
//! Two addressing modes: per-user (every open connection of a user, wherever
//! it is) and per-conversation (every connection currently subscribed to that
//! conversation's topic). Delivery is at-most-once, best-effort per
//! connection; a closed receiver is pruned on the next publish and the missed
//! events are reconciled through the paginated history API.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use log::{debug, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use crate::models::websocket::ServerEvent;

pub type ConnectionId = String;

/// Per-connection handle: direct replies (acks, errors) go through this
/// sender so the connection keeps a single writer.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub user_id: String,
    sender: UnboundedSender<ServerEvent>,
}

impl ConnectionHandle {
    pub fn send(&self, event: ServerEvent) {
        if self.sender.send(event).is_err() {
            debug!("connection {} gone, dropping direct event", self.id);
        }
    }
}

struct Registered {
    user_id: String,
    sender: UnboundedSender<ServerEvent>,
    topics: HashSet<String>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnectionId, Registered>,
    by_user: HashMap<String, HashSet<ConnectionId>>,
    by_topic: HashMap<String, HashSet<ConnectionId>>,
}

#[derive(Default)]
pub struct Fanout {
    registry: RwLock<Registry>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection for a user. Returns the handle plus the event
    /// receiver the connection's writer task drains.
    pub fn register(&self, user_id: &str) -> (ConnectionHandle, UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4().to_string();

        let mut reg = self.registry.write().unwrap_or_else(|e| e.into_inner());
        reg.connections.insert(
            id.clone(),
            Registered {
                user_id: user_id.to_string(),
                sender: tx.clone(),
                topics: HashSet::new(),
            },
        );
        reg.by_user
            .entry(user_id.to_string())
            .or_default()
            .insert(id.clone());

        (
            ConnectionHandle {
                id,
                user_id: user_id.to_string(),
                sender: tx,
            },
            rx,
        )
    }

    pub fn deregister(&self, connection_id: &str) {
        let mut reg = self.registry.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = reg.connections.remove(connection_id) {
            if let Some(set) = reg.by_user.get_mut(&entry.user_id) {
                set.remove(connection_id);
                if set.is_empty() {
                    reg.by_user.remove(&entry.user_id);
                }
            }
            for topic in entry.topics {
                if let Some(set) = reg.by_topic.get_mut(&topic) {
                    set.remove(connection_id);
                    if set.is_empty() {
                        reg.by_topic.remove(&topic);
                    }
                }
            }
        }
    }

    /// Subscribes a connection to a conversation topic.
    pub fn join(&self, connection_id: &str, conversation_id: &str) {
        let mut reg = self.registry.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = reg.connections.get_mut(connection_id) {
            entry.topics.insert(conversation_id.to_string());
            reg.by_topic
                .entry(conversation_id.to_string())
                .or_default()
                .insert(connection_id.to_string());
        } else {
            warn!("join for unknown connection {}", connection_id);
        }
    }

    pub fn leave(&self, connection_id: &str, conversation_id: &str) {
        let mut reg = self.registry.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = reg.connections.get_mut(connection_id) {
            entry.topics.remove(conversation_id);
        }
        if let Some(set) = reg.by_topic.get_mut(conversation_id) {
            set.remove(connection_id);
            if set.is_empty() {
                reg.by_topic.remove(conversation_id);
            }
        }
    }

    /// Subscribes every open connection of a user to a conversation topic,
    /// used when a user is pulled into a conversation they never joined.
    pub fn join_user(&self, user_id: &str, conversation_id: &str) {
        let ids: Vec<ConnectionId> = {
            let reg = self.registry.read().unwrap_or_else(|e| e.into_inner());
            reg.by_user
                .get(user_id)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default()
        };
        for id in ids {
            self.join(&id, conversation_id);
        }
    }

    /// Delivers to every open connection of the user, regardless of which
    /// conversation topics the connection has joined.
    pub fn publish_to_user(&self, user_id: &str, event: &ServerEvent) {
        let targets = self.collect_user_targets(user_id);
        self.deliver(targets, event);
    }

    /// Delivers to every connection subscribed to the conversation topic.
    pub fn publish_to_conversation(&self, conversation_id: &str, event: &ServerEvent) {
        let targets = self.collect_topic_targets(conversation_id);
        self.deliver(targets, event);
    }

    fn collect_user_targets(
        &self,
        user_id: &str,
    ) -> Vec<(ConnectionId, UnboundedSender<ServerEvent>)> {
        let reg = self.registry.read().unwrap_or_else(|e| e.into_inner());
        reg.by_user
            .get(user_id)
            .into_iter()
            .flatten()
            .filter_map(|id| {
                reg.connections
                    .get(id)
                    .map(|c| (id.clone(), c.sender.clone()))
            })
            .collect()
    }

    fn collect_topic_targets(
        &self,
        conversation_id: &str,
    ) -> Vec<(ConnectionId, UnboundedSender<ServerEvent>)> {
        let reg = self.registry.read().unwrap_or_else(|e| e.into_inner());
        reg.by_topic
            .get(conversation_id)
            .into_iter()
            .flatten()
            .filter_map(|id| {
                reg.connections
                    .get(id)
                    .map(|c| (id.clone(), c.sender.clone()))
            })
            .collect()
    }

    fn deliver(
        &self,
        targets: Vec<(ConnectionId, UnboundedSender<ServerEvent>)>,
        event: &ServerEvent,
    ) {
        let mut dead: Vec<ConnectionId> = Vec::new();
        for (id, sender) in targets {
            if sender.send(event.clone()).is_err() {
                dead.push(id);
            }
        }
        for id in dead {
            debug!("pruning closed connection {}", id);
            self.deregister(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str) -> ServerEvent {
        ServerEvent::AgentChunk {
            conversation_id: "c1".into(),
            message_id: "m1".into(),
            chunk: text.into(),
        }
    }

    #[tokio::test]
    async fn user_addressing_reaches_all_connections_of_that_user_only() {
        let fanout = Fanout::new();
        let (_a1, mut rx_a1) = fanout.register("u_alice");
        let (_a2, mut rx_a2) = fanout.register("u_alice");
        let (_b, mut rx_b) = fanout.register("u_bob");

        fanout.publish_to_user("u_alice", &chunk("x"));

        assert!(rx_a1.try_recv().is_ok());
        assert!(rx_a2.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn conversation_addressing_requires_join() {
        let fanout = Fanout::new();
        let (alice, mut rx_alice) = fanout.register("u_alice");
        let (_bob, mut rx_bob) = fanout.register("u_bob");

        fanout.join(&alice.id, "c1");
        fanout.publish_to_conversation("c1", &chunk("x"));

        assert!(rx_alice.try_recv().is_ok());
        assert!(rx_bob.try_recv().is_err());

        fanout.leave(&alice.id, "c1");
        fanout.publish_to_conversation("c1", &chunk("y"));
        assert!(rx_alice.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_connections_are_pruned_not_retried() {
        let fanout = Fanout::new();
        let (alice, rx) = fanout.register("u_alice");
        fanout.join(&alice.id, "c1");
        drop(rx);

        // At-most-once: nothing buffers for a dead connection.
        fanout.publish_to_conversation("c1", &chunk("x"));
        fanout.publish_to_conversation("c1", &chunk("y"));

        let (_alice2, mut rx2) = fanout.register("u_alice");
        fanout.publish_to_user("u_alice", &chunk("z"));
        assert!(rx2.try_recv().is_ok());
    }
}
