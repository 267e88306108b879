//! Cluster Coordination
//!
//! Membership, singleton placement and split-brain resolution for actor
//! systems running on several nodes.
//!
//! # Architecture
//!
//! ```text
//!            MembershipOracle ──events──► MembershipView (per service)
//!                  │                             │
//!   ┌──────────────┼───────────────┐             ▼
//!   │ ClusterListener   SplitBrainResolver   SingletonManager ──► instance
//!   └──────────────────────────────┘             │
//!                                         ClusterTransport (frames between nodes)
//! ```
//!
//! The oracle and the transport are collaborators: production deployments
//! plug in gossip and a network transport, tests and the demo node use
//! [`InMemoryCluster`].

pub mod error;
pub mod listener;
pub mod member;
pub mod membership;
pub mod node;
pub mod sbr;
pub mod sim;
pub mod singleton;
pub mod transport;

pub use error::{ClusterError, Result};
pub use listener::{spawn_cluster_listener, ClusterListener, ListenerMsg};
pub use member::{Member, MemberStatus, MembershipEvent, NodeAddress};
pub use membership::{initial_view, membership_events, MembershipOracle, MembershipView};
pub use node::ClusterNode;
pub use sbr::{keep_majority, spawn_split_brain_resolver, SbrDecision, SbrMsg, SplitBrainResolver};
pub use sim::{InMemoryCluster, SimulatedNode};
pub use singleton::{
    ClusterSingleton, SingletonEvent, SingletonLease, SingletonRef, SingletonSettings,
    SingletonState,
};
pub use transport::{decode_frame, encode_frame, ClusterTransport, InboundHandler, WireMessage};
