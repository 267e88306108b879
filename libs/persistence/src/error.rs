//! Persistence Error Types

use actors::{ActorError, ErrorClass};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures of the journal, the snapshot store, or payload encoding
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("Journal write failed for {entity_id} at sequence {sequence_nr}: {message}")]
    JournalWriteFailure {
        entity_id: String,
        sequence_nr: u64,
        message: String,
    },

    #[error("Journal read failed for {entity_id}: {message}")]
    JournalRead { entity_id: String, message: String },

    /// Appended sequence number is not the successor of the stored one
    #[error("Sequence conflict for {entity_id}: expected {expected}, got {actual}")]
    SequenceConflict {
        entity_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Snapshot store error for {entity_id}: {message}")]
    SnapshotStore { entity_id: String, message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

/// Result type alias for persistence operations
pub type Result<T> = std::result::Result<T, PersistenceError>;

impl PersistenceError {
    pub fn journal_write(
        entity_id: impl Into<String>,
        sequence_nr: u64,
        message: impl Into<String>,
    ) -> Self {
        Self::JournalWriteFailure {
            entity_id: entity_id.into(),
            sequence_nr,
            message: message.into(),
        }
    }

    pub fn journal_read(entity_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::JournalRead {
            entity_id: entity_id.into(),
            message: message.into(),
        }
    }

    pub fn snapshot_store(entity_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SnapshotStore {
            entity_id: entity_id.into(),
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }
}

impl From<bincode::Error> for PersistenceError {
    fn from(error: bincode::Error) -> Self {
        Self::serialization(error.to_string())
    }
}

/// What a caller of an event-sourced entity sees. Serializable so the reply
/// can cross nodes (e.g. when the entity runs as a cluster singleton).
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityError {
    /// Command refused by the entity's business rules; state unchanged
    #[error("Command rejected: {reason}")]
    Rejected { reason: String },

    /// Event could not be persisted; state unchanged, entity restarting
    #[error("Journal write failure: {reason}")]
    JournalWriteFailure { reason: String },

    #[error("Timeout error: entity did not answer within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Entity is stopped, restarting, or could not be reached
    #[error("Entity unavailable: {reason}")]
    Unavailable { reason: String },
}

impl EntityError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Rejected { .. } => ErrorClass::Client,
            Self::JournalWriteFailure { .. } | Self::Timeout { .. } | Self::Unavailable { .. } => {
                ErrorClass::Retryable
            }
        }
    }
}

impl From<ActorError> for EntityError {
    fn from(error: ActorError) -> Self {
        match error {
            ActorError::Timeout { timeout_ms, .. } => Self::Timeout { timeout_ms },
            ActorError::CommandRejected { reason } => Self::Rejected { reason },
            other => Self::Unavailable {
                reason: other.to_string(),
            },
        }
    }
}
