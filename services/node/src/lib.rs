//! Cluster Node
//!
//! Demo services built on the actor runtime, wired into one node:
//!
//! - [`counter`]: functional, singleton and event-sourced counters
//! - [`chat`]: chat room with cluster-wide unique usernames
//! - [`events`]: server-sent event bus
//! - [`runtime`]: starts the services of a node, or of several in-process nodes

pub mod chat;
pub mod counter;
pub mod events;
pub mod runtime;

pub use chat::{ChatEvent, ChatRoom, ChatRoster, ChatUser, RosterSnapshot, CHAT_TOPIC};
pub use counter::{
    counter_props, singleton_counter_props, spawn_persistent_counter, CounterCommand,
    CounterEvent, CounterRequest, CounterState, PersistentCounter, SingletonCounterCommand,
    SingletonCounterRequest,
};
pub use events::{EventBus, SseEvent, SseMessage, SSE_TOPIC};
pub use runtime::{LocalCluster, NodeRuntime, Tick, GLOBAL_COUNTER};
