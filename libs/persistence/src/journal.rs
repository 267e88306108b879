//! Event Journal
//!
//! Append-only, per-entity log of encoded events. Sequence numbers start at 1
//! and must grow by exactly one per append; anything else is a
//! [`PersistenceError::SequenceConflict`].

use crate::error::{PersistenceError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

/// One persisted event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub entity_id: String,
    pub sequence_nr: u64,
    pub payload: Vec<u8>,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait]
pub trait Journal: Send + Sync + 'static {
    /// Append one event; `sequence_nr` must be the successor of the highest stored
    async fn append(&self, entity_id: &str, sequence_nr: u64, payload: Vec<u8>) -> Result<()>;

    /// Append a batch numbered from `first_sequence_nr`. The default appends one
    /// event at a time; journals that can write a batch atomically override it.
    async fn append_all(
        &self,
        entity_id: &str,
        first_sequence_nr: u64,
        payloads: Vec<Vec<u8>>,
    ) -> Result<()> {
        for (sequence_nr, payload) in (first_sequence_nr..).zip(payloads) {
            self.append(entity_id, sequence_nr, payload).await?;
        }
        Ok(())
    }

    /// Events with a sequence number greater than `after_sequence_nr`, in order
    async fn read_from(
        &self,
        entity_id: &str,
        after_sequence_nr: u64,
    ) -> Result<BoxStream<'static, Result<JournalEntry>>>;

    /// Highest stored sequence number, 0 when the entity has no events
    async fn highest_sequence_nr(&self, entity_id: &str) -> Result<u64>;
}

/// Journal kept in process memory
#[derive(Debug, Default)]
pub struct InMemoryJournal {
    entries: RwLock<HashMap<String, Vec<JournalEntry>>>,
    /// Appends that will fail before the journal accepts writes again
    failing_appends: AtomicUsize,
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` appends fail with a write failure
    pub fn fail_next_appends(&self, count: usize) {
        self.failing_appends.store(count, Ordering::SeqCst);
    }

    /// Number of stored events for an entity
    pub fn len(&self, entity_id: &str) -> usize {
        self.entries
            .read()
            .get(entity_id)
            .map(|events| events.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, entity_id: &str) -> bool {
        self.len(entity_id) == 0
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Journal for InMemoryJournal {
    async fn append(&self, entity_id: &str, sequence_nr: u64, payload: Vec<u8>) -> Result<()> {
        if self.take_injected_failure() {
            warn!(entity_id, sequence_nr, "Injected journal write failure");
            return Err(PersistenceError::journal_write(
                entity_id,
                sequence_nr,
                "injected failure",
            ));
        }

        let mut entries = self.entries.write();
        let events = entries.entry(entity_id.to_string()).or_default();
        let expected = events.last().map(|e| e.sequence_nr).unwrap_or(0) + 1;
        if sequence_nr != expected {
            return Err(PersistenceError::SequenceConflict {
                entity_id: entity_id.to_string(),
                expected,
                actual: sequence_nr,
            });
        }

        events.push(JournalEntry {
            entity_id: entity_id.to_string(),
            sequence_nr,
            payload,
            recorded_at: Utc::now(),
        });
        debug!(entity_id, sequence_nr, "Event appended");
        Ok(())
    }

    /// All or nothing: one injected failure or conflict leaves the log untouched
    async fn append_all(
        &self,
        entity_id: &str,
        first_sequence_nr: u64,
        payloads: Vec<Vec<u8>>,
    ) -> Result<()> {
        if payloads.is_empty() {
            return Ok(());
        }
        if self.take_injected_failure() {
            warn!(entity_id, first_sequence_nr, "Injected journal batch failure");
            return Err(PersistenceError::journal_write(
                entity_id,
                first_sequence_nr,
                "injected failure",
            ));
        }

        let mut entries = self.entries.write();
        let events = entries.entry(entity_id.to_string()).or_default();
        let expected = events.last().map(|e| e.sequence_nr).unwrap_or(0) + 1;
        if first_sequence_nr != expected {
            return Err(PersistenceError::SequenceConflict {
                entity_id: entity_id.to_string(),
                expected,
                actual: first_sequence_nr,
            });
        }

        let count = payloads.len();
        let recorded_at = Utc::now();
        events.extend((first_sequence_nr..).zip(payloads).map(|(sequence_nr, payload)| {
            JournalEntry {
                entity_id: entity_id.to_string(),
                sequence_nr,
                payload,
                recorded_at,
            }
        }));
        debug!(entity_id, first_sequence_nr, count, "Event batch appended");
        Ok(())
    }

    async fn read_from(
        &self,
        entity_id: &str,
        after_sequence_nr: u64,
    ) -> Result<BoxStream<'static, Result<JournalEntry>>> {
        let events: Vec<JournalEntry> = self
            .entries
            .read()
            .get(entity_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.sequence_nr > after_sequence_nr)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(stream::iter(events.into_iter().map(Ok)).boxed())
    }

    async fn highest_sequence_nr(&self, entity_id: &str) -> Result<u64> {
        Ok(self
            .entries
            .read()
            .get(entity_id)
            .and_then(|events| events.last())
            .map(|e| e.sequence_nr)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn test_append_and_read_in_order() {
        let journal = InMemoryJournal::new();
        for seq in 1..=5u64 {
            journal.append("counter-1", seq, vec![seq as u8]).await.unwrap();
        }

        let tail: Vec<JournalEntry> = journal
            .read_from("counter-1", 3)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        let seqs: Vec<u64> = tail.iter().map(|e| e.sequence_nr).collect();
        assert_eq!(seqs, vec![4, 5]);
        assert_eq!(journal.highest_sequence_nr("counter-1").await.unwrap(), 5);
        assert_eq!(journal.highest_sequence_nr("unknown").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sequence_gaps_and_duplicates_are_rejected() {
        let journal = InMemoryJournal::new();
        journal.append("e", 1, vec![]).await.unwrap();

        let dup = journal.append("e", 1, vec![]).await.unwrap_err();
        assert_eq!(
            dup,
            PersistenceError::SequenceConflict {
                entity_id: "e".into(),
                expected: 2,
                actual: 1
            }
        );
        assert!(journal.append("e", 3, vec![]).await.is_err());
        assert_eq!(journal.len("e"), 1);
    }

    #[tokio::test]
    async fn test_batch_append_is_all_or_nothing() {
        let journal = InMemoryJournal::new();
        journal.append("e", 1, vec![1]).await.unwrap();

        journal.fail_next_appends(1);
        assert!(journal.append_all("e", 2, vec![vec![2], vec![3]]).await.is_err());
        assert!(journal.append_all("e", 3, vec![vec![3], vec![4]]).await.is_err());
        assert_eq!(journal.len("e"), 1);

        journal.append_all("e", 2, vec![vec![2], vec![3]]).await.unwrap();
        assert_eq!(journal.highest_sequence_nr("e").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let journal = InMemoryJournal::new();
        journal.fail_next_appends(2);
        assert!(journal.append("e", 1, vec![]).await.is_err());
        assert!(journal.append("e", 1, vec![]).await.is_err());
        assert!(journal.append("e", 1, vec![]).await.is_ok());
        assert!(!journal.is_empty("e"));
    }
}
