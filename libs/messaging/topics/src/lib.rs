//! Distributed Topic Relay
//!
//! Publish/subscribe across the nodes of a cluster. Subscribers are local to
//! the node they registered on; published events are numbered by their origin
//! node and pushed to the relay of the same name on every other Up, reachable
//! node, which applies them to its reconciled view and hands them to its own
//! subscribers. Relays never forward what they receive.
//!
//! # Examples
//!
//! ```rust,no_run
//! use cluster::{InMemoryCluster, NodeAddress};
//! use topic_relay::{spawn_topic_relay, Delivery, RelaySettings};
//!
//! # async fn demo() -> topic_relay::Result<()> {
//! let cluster = InMemoryCluster::new();
//! let node = cluster.join_up(NodeAddress::new("127.0.0.1", 2551), Vec::<String>::new())?;
//! let system = actors::ActorSystem::new("demo");
//! let relay = spawn_topic_relay(&system, &node.cluster_node(), "events", RelaySettings::default(), || ())?;
//!
//! let mut inbox = relay.subscribe("events", "sub-1")?;
//! assert!(matches!(inbox.recv().await, Some(Delivery::Connected { .. })));
//! relay.publish("events", "hello".to_string())?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod event;
pub mod registry;
pub mod relay;
pub mod sequence;
pub mod view;

pub use error::{RelayError, Result};
pub use event::{
    ClusterStats, Delivery, NodeStats, RelayStats, SubscriberInfo, TopicEvent, TopicPayload,
};
pub use registry::{topic_matches, DeliverySink, TopicRegistry};
pub use relay::{
    event_frame, relay_channel, spawn_topic_relay, RelayMsg, RelaySettings, TopicRelayHandle,
};
pub use sequence::{SequenceCheck, SequenceTracker};
pub use view::ReconciledView;
