//! Snapshot Store
//!
//! Full-state checkpoints of an entity, each recording the sequence number of
//! the last event it includes. Recovery loads the latest snapshot and replays
//! only the journal tail after it.

use crate::error::{PersistenceError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

/// Stored snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub entity_id: String,
    pub sequence_nr: u64,
    pub payload: Vec<u8>,
    pub taken_at: DateTime<Utc>,
}

#[async_trait]
pub trait SnapshotStore: Send + Sync + 'static {
    async fn save(&self, entity_id: &str, sequence_nr: u64, payload: Vec<u8>) -> Result<()>;

    async fn load_latest(&self, entity_id: &str) -> Result<Option<SnapshotEntry>>;
}

/// When an entity saves snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotPolicy {
    /// After every event whose sequence number is a multiple of N
    Every(u64),
    Never,
}

impl SnapshotPolicy {
    /// Whether a snapshot is due right after persisting `sequence_nr`
    pub fn is_due(&self, sequence_nr: u64) -> bool {
        match *self {
            SnapshotPolicy::Every(n) if n > 0 => sequence_nr > 0 && sequence_nr % n == 0,
            _ => false,
        }
    }

    /// Policy from a configured cadence, where 0 disables snapshots
    pub fn from_every(n: u64) -> Self {
        if n == 0 {
            SnapshotPolicy::Never
        } else {
            SnapshotPolicy::Every(n)
        }
    }
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        SnapshotPolicy::Every(10)
    }
}

/// Snapshot store kept in process memory; only the latest snapshot per entity is retained
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    latest: RwLock<HashMap<String, SnapshotEntry>>,
    saves: AtomicU64,
    fail_saves: AtomicBool,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total successful saves across entities
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    /// Make every save fail until switched off again
    pub fn set_failing(&self, failing: bool) {
        self.fail_saves.store(failing, Ordering::SeqCst);
    }

    pub fn latest_sequence_nr(&self, entity_id: &str) -> Option<u64> {
        self.latest.read().get(entity_id).map(|s| s.sequence_nr)
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, entity_id: &str, sequence_nr: u64, payload: Vec<u8>) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(PersistenceError::snapshot_store(entity_id, "injected failure"));
        }

        let mut latest = self.latest.write();
        let newer = latest
            .get(entity_id)
            .map(|current| sequence_nr > current.sequence_nr)
            .unwrap_or(true);
        if newer {
            latest.insert(
                entity_id.to_string(),
                SnapshotEntry {
                    entity_id: entity_id.to_string(),
                    sequence_nr,
                    payload,
                    taken_at: Utc::now(),
                },
            );
        }
        self.saves.fetch_add(1, Ordering::Relaxed);
        debug!(entity_id, sequence_nr, "Snapshot saved");
        Ok(())
    }

    async fn load_latest(&self, entity_id: &str) -> Result<Option<SnapshotEntry>> {
        Ok(self.latest.read().get(entity_id).cloned())
    }
}
