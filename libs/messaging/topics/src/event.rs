//! Topic Events and Deliveries
//!
//! [`TopicEvent`] is what travels between nodes. [`Delivery`] is what a
//! local subscriber receives on its sink.

use cluster::NodeAddress;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Payloads carried by the relay
pub trait TopicPayload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static> TopicPayload for T {}

/// A published fact, sequenced by the node that published it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicEvent<E> {
    pub topic: String,
    pub origin: NodeAddress,
    /// Identifies one run of the origin's relay; sequences restart with it
    pub incarnation: Uuid,
    pub sequence: u64,
    pub payload: E,
    pub timestamp_ms: i64,
}

impl<E> TopicEvent<E> {
    pub fn event_id(&self) -> String {
        format!("{}-{}", self.origin, self.sequence)
    }
}

/// What a local subscriber sees
pub enum Delivery<E> {
    /// Sent once, right after the subscription is registered
    Connected {
        subscriber_id: String,
        topic: String,
        node: NodeAddress,
        /// `{"subscriberId": .., "nodeAddress": ..}`
        data: String,
    },
    Event(Arc<TopicEvent<E>>),
    Heartbeat {
        node: NodeAddress,
        timestamp_ms: i64,
    },
}

impl<E> Delivery<E> {
    pub(crate) fn connected(subscriber_id: &str, topic: &str, node: &NodeAddress) -> Self {
        let data = serde_json::json!({
            "subscriberId": subscriber_id,
            "nodeAddress": node.to_string(),
        })
        .to_string();
        Self::Connected {
            subscriber_id: subscriber_id.to_string(),
            topic: topic.to_string(),
            node: node.clone(),
            data,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Event(_) => "event",
            Self::Heartbeat { .. } => "heartbeat",
        }
    }

    pub fn as_event(&self) -> Option<&TopicEvent<E>> {
        match self {
            Self::Event(event) => Some(event),
            _ => None,
        }
    }
}

impl<E> Clone for Delivery<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Connected {
                subscriber_id,
                topic,
                node,
                data,
            } => Self::Connected {
                subscriber_id: subscriber_id.clone(),
                topic: topic.clone(),
                node: node.clone(),
                data: data.clone(),
            },
            Self::Event(event) => Self::Event(Arc::clone(event)),
            Self::Heartbeat { node, timestamp_ms } => Self::Heartbeat {
                node: node.clone(),
                timestamp_ms: *timestamp_ms,
            },
        }
    }
}

impl<E> fmt::Debug for Delivery<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected {
                subscriber_id, node, ..
            } => f
                .debug_struct("Connected")
                .field("subscriber_id", subscriber_id)
                .field("node", node)
                .finish(),
            Self::Event(event) => f
                .debug_struct("Event")
                .field("topic", &event.topic)
                .field("event_id", &event.event_id())
                .finish(),
            Self::Heartbeat { node, timestamp_ms } => f
                .debug_struct("Heartbeat")
                .field("node", node)
                .field("timestamp_ms", timestamp_ms)
                .finish(),
        }
    }
}

/// Local subscriber count advertised to the other nodes, with the
/// publisher position peers use to notice events they never received
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStats {
    pub node: NodeAddress,
    pub subscribers: usize,
    pub incarnation: Uuid,
    pub last_sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberInfo {
    pub id: String,
    pub topic: String,
    pub node: NodeAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStats {
    pub node: NodeAddress,
    pub local_subscribers: usize,
    pub topics: usize,
    pub published: u64,
    pub received: u64,
    pub duplicates: u64,
    pub gaps: u64,
    /// Own events resent in answer to `Resync`
    pub replayed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStats {
    pub node: NodeAddress,
    pub local_subscribers: usize,
    /// Local count plus the last count advertised by every live peer
    pub total_subscribers: usize,
    pub nodes: usize,
}
