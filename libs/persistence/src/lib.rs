//! Event-Sourced Persistence
//!
//! Entities whose state is the fold of an append-only event journal, with
//! periodic snapshots to bound recovery time.
//!
//! - [`Journal`]: per-entity event log with strictly increasing sequence numbers
//! - [`SnapshotStore`]: latest full-state checkpoint per entity
//! - [`EventSourcedEntity`]: command handler plus pure event application
//! - [`spawn_entity`]: runs an entity as a supervised actor that recovers on every start

pub mod codec;
pub mod entity;
pub mod error;
pub mod journal;
pub mod snapshot;

pub use entity::{
    entity_props, persistence_id, replay, spawn_entity, Effect, EntityMessage, EntityRef,
    EntityResult, EventSourcedEntity, Persistence,
};
pub use error::{EntityError, PersistenceError, Result};
pub use journal::{InMemoryJournal, Journal, JournalEntry};
pub use snapshot::{InMemorySnapshotStore, SnapshotEntry, SnapshotPolicy, SnapshotStore};

use std::sync::Arc;

/// Persistence backed by fresh in-memory stores, returned alongside them for inspection
pub fn in_memory() -> (Persistence, Arc<InMemoryJournal>, Arc<InMemorySnapshotStore>) {
    let journal = Arc::new(InMemoryJournal::new());
    let snapshots = Arc::new(InMemorySnapshotStore::new());
    let persistence = Persistence::new(journal.clone(), snapshots.clone());
    (persistence, journal, snapshots)
}
