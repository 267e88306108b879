//! Server-Sent Event Bus
//!
//! Relays application events to every subscriber in the cluster. Rendering
//! deliveries as `text/event-stream` frames is left to [`SseMessage`]; the
//! HTTP side is not part of this crate.

use actors::ActorSystem;
use cluster::ClusterNode;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use topic_relay::{
    spawn_topic_relay, ClusterStats, Delivery, RelaySettings, SubscriberInfo, TopicRelayHandle,
};

pub const SSE_TOPIC: &str = "sse-events";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SseEvent {
    pub event_type: String,
    pub data: String,
}

/// One delivery, flattened for an event stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SseMessage {
    pub id: String,
    pub event: String,
    pub data: String,
    pub node: String,
    pub timestamp_ms: i64,
}

impl SseMessage {
    pub fn from_delivery(delivery: &Delivery<SseEvent>) -> Self {
        match delivery {
            Delivery::Connected {
                subscriber_id,
                node,
                data,
                ..
            } => Self {
                id: format!("{}-{}", node, subscriber_id),
                event: delivery.event_type().to_string(),
                data: data.to_string(),
                node: node.to_string(),
                timestamp_ms: 0,
            },
            Delivery::Event(event) => Self {
                id: event.event_id(),
                event: event.payload.event_type.clone(),
                data: event.payload.data.clone(),
                node: event.origin.to_string(),
                timestamp_ms: event.timestamp_ms,
            },
            Delivery::Heartbeat { node, timestamp_ms } => Self {
                id: format!("{}-heartbeat-{}", node, timestamp_ms),
                event: delivery.event_type().to_string(),
                data: "{}".to_string(),
                node: node.to_string(),
                timestamp_ms: *timestamp_ms,
            },
        }
    }

    /// `id`/`event`/`data` lines terminated by a blank line
    pub fn to_frame(&self) -> String {
        let mut frame = format!("id: {}\nevent: {}\n", self.id, self.event);
        for line in self.data.lines() {
            frame.push_str("data: ");
            frame.push_str(line);
            frame.push('\n');
        }
        frame.push('\n');
        frame
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    relay: TopicRelayHandle<SseEvent, ()>,
}

impl EventBus {
    pub fn start(
        system: &ActorSystem,
        node: &ClusterNode,
        settings: RelaySettings,
    ) -> topic_relay::Result<Self> {
        let relay = spawn_topic_relay(system, node, "sse", settings, || ())?;
        Ok(Self { relay })
    }

    /// The first delivery is always `Connected`, then events and heartbeats
    pub fn subscribe(&self, subscriber_id: &str) -> topic_relay::Result<mpsc::UnboundedReceiver<Delivery<SseEvent>>> {
        self.relay.subscribe(SSE_TOPIC, subscriber_id)
    }

    pub fn unsubscribe(&self, subscriber_id: &str) -> topic_relay::Result<()> {
        self.relay.unsubscribe(SSE_TOPIC, subscriber_id)
    }

    pub fn publish(&self, event_type: &str, data: impl Into<String>) -> topic_relay::Result<()> {
        self.relay.publish(
            SSE_TOPIC,
            SseEvent {
                event_type: event_type.to_string(),
                data: data.into(),
            },
        )
    }

    pub async fn subscribers(&self) -> topic_relay::Result<Vec<SubscriberInfo>> {
        self.relay.subscribers().await
    }

    pub async fn cluster_stats(&self) -> topic_relay::Result<ClusterStats> {
        self.relay.cluster_stats().await
    }

    pub fn relay(&self) -> &TopicRelayHandle<SseEvent, ()> {
        &self.relay
    }

    pub async fn shutdown(&self) {
        self.relay.shutdown().await;
    }
}
