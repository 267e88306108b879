//! Distributed Chat Room
//!
//! Usernames are unique across the cluster. Each node owns the users that
//! joined through it; the roster on every node is rebuilt from the relayed
//! join and leave events, and a node's users vanish when it is removed.
//!
//! Two nodes can admit the same name before either hears of the other. The
//! earliest claim, ordered by `(timestamp_ms, node)`, wins on every node; the
//! losing claim is kept as displaced so its node can tell the user.

use actors::ActorSystem;
use cluster::{ClusterNode, NodeAddress};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use topic_relay::{
    spawn_topic_relay, Delivery, ReconciledView, RelaySettings, TopicEvent, TopicRelayHandle,
};
use tracing::{debug, info, warn};

pub const CHAT_TOPIC: &str = "chat-room";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatEvent {
    UserJoined { username: String },
    UserLeft { username: String },
    Message { username: String, text: String },
}

impl ChatEvent {
    pub fn username(&self) -> &str {
        match self {
            ChatEvent::UserJoined { username }
            | ChatEvent::UserLeft { username }
            | ChatEvent::Message { username, .. } => username,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatUser {
    pub username: String,
    pub node: NodeAddress,
    pub joined_at_ms: i64,
}

impl ChatUser {
    fn from_join(username: &str, event: &TopicEvent<ChatEvent>) -> Self {
        Self {
            username: username.to_string(),
            node: event.origin.clone(),
            joined_at_ms: event.timestamp_ms,
        }
    }

    /// Earlier claims win; the node address breaks ties
    fn precedes(&self, other: &ChatUser) -> bool {
        (self.joined_at_ms, &self.node) < (other.joined_at_ms, &other.node)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterSnapshot {
    pub users: Vec<ChatUser>,
    /// Claims that lost to an earlier join of the same name
    pub displaced: Vec<ChatUser>,
}

/// Cluster-wide roster, username to owning claim
#[derive(Debug, Default)]
pub struct ChatRoster {
    users: BTreeMap<String, ChatUser>,
    displaced: Vec<ChatUser>,
}

impl ChatRoster {
    fn owner(&self, username: &str) -> Option<&NodeAddress> {
        self.users.get(username).map(|user| &user.node)
    }
}

impl ReconciledView<ChatEvent> for ChatRoster {
    type Snapshot = RosterSnapshot;

    fn admit(&self, event: &ChatEvent, origin: &NodeAddress) -> Result<(), String> {
        match event {
            ChatEvent::UserJoined { username } if self.users.contains_key(username) => {
                Err(format!("Username '{}' is already in use", username))
            }
            ChatEvent::UserJoined { .. } => Ok(()),
            ChatEvent::UserLeft { username } | ChatEvent::Message { username, .. } => {
                match self.owner(username) {
                    Some(owner) if owner == origin => Ok(()),
                    _ => Err(format!("User '{}' is not in the room on {}", username, origin)),
                }
            }
        }
    }

    fn apply(&mut self, event: &TopicEvent<ChatEvent>) -> bool {
        match &event.payload {
            ChatEvent::UserJoined { username } => {
                let claim = ChatUser::from_join(username, event);
                let Some(current) = self.users.get(username) else {
                    self.displaced
                        .retain(|user| !(user.username == claim.username && user.node == claim.node));
                    self.users.insert(username.clone(), claim);
                    return true;
                };
                if current == &claim || current.node == claim.node {
                    return false;
                }
                let (winner, loser) = if claim.precedes(current) {
                    (claim, current.clone())
                } else {
                    (current.clone(), claim)
                };
                warn!(
                    username = %username,
                    winner = %winner.node,
                    loser = %loser.node,
                    "Concurrent join of the same username resolved"
                );
                let changed = winner.node != current.node;
                if !self.displaced.contains(&loser) {
                    self.displaced.push(loser);
                }
                self.users.insert(username.clone(), winner);
                changed
            }
            ChatEvent::UserLeft { username } => {
                if self.owner(username) != Some(&event.origin) {
                    return false;
                }
                self.users.remove(username);
                true
            }
            ChatEvent::Message { .. } => false,
        }
    }

    fn snapshot(&self) -> RosterSnapshot {
        RosterSnapshot {
            users: self.users.values().cloned().collect(),
            displaced: self.displaced.clone(),
        }
    }

    fn on_member_removed(&mut self, address: &NodeAddress) -> bool {
        self.displaced.retain(|user| &user.node != address);
        let before = self.users.len();
        self.users.retain(|_, user| &user.node != address);
        let dropped = before - self.users.len();
        if dropped > 0 {
            debug!(node = %address, dropped, "Dropped users of removed node");
        }
        dropped > 0
    }
}

/// Chat room on one node
#[derive(Debug, Clone)]
pub struct ChatRoom {
    relay: TopicRelayHandle<ChatEvent, RosterSnapshot>,
    self_address: NodeAddress,
}

impl ChatRoom {
    pub fn start(
        system: &ActorSystem,
        node: &ClusterNode,
        settings: RelaySettings,
    ) -> topic_relay::Result<Self> {
        let relay = spawn_topic_relay(system, node, "chat", settings, ChatRoster::default)?;
        Ok(Self {
            relay,
            self_address: node.self_address(),
        })
    }

    /// Claim `username` and start receiving the room's events.
    /// Fails with `Rejected` when the name is taken anywhere in the cluster.
    pub async fn join(&self, username: &str) -> topic_relay::Result<mpsc::UnboundedReceiver<Delivery<ChatEvent>>> {
        let joined = ChatEvent::UserJoined {
            username: username.to_string(),
        };
        self.relay.publish_checked(CHAT_TOPIC, joined).await?;
        info!(username, "User joined chat room");
        self.relay.subscribe(CHAT_TOPIC, username)
    }

    pub async fn leave(&self, username: &str) -> topic_relay::Result<()> {
        let left = ChatEvent::UserLeft {
            username: username.to_string(),
        };
        self.relay.publish_checked(CHAT_TOPIC, left).await?;
        info!(username, "User left chat room");
        self.relay.unsubscribe(CHAT_TOPIC, username)
    }

    /// Post as `username`, who must have joined through this node
    pub async fn post(&self, username: &str, text: &str) -> topic_relay::Result<String> {
        let message = ChatEvent::Message {
            username: username.to_string(),
            text: text.to_string(),
        };
        self.relay.publish_checked(CHAT_TOPIC, message).await
    }

    pub async fn users(&self) -> topic_relay::Result<Vec<ChatUser>> {
        Ok(self.relay.view().await?.users)
    }

    /// Users who joined through this node but lost their name to an
    /// earlier join elsewhere
    pub async fn displaced(&self) -> topic_relay::Result<Vec<ChatUser>> {
        let snapshot = self.relay.view().await?;
        Ok(snapshot
            .displaced
            .into_iter()
            .filter(|user| user.node == self.self_address)
            .collect())
    }

    pub fn relay(&self) -> &TopicRelayHandle<ChatEvent, RosterSnapshot> {
        &self.relay
    }

    pub async fn shutdown(&self) {
        self.relay.shutdown().await;
    }
}
