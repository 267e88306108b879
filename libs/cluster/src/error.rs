//! Cluster Error Types

use actors::{ActorError, ErrorClass};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    /// No singleton instance is reachable right now; retry later
    #[error("Singleton '{singleton}' handover in progress")]
    SingletonHandoverInProgress { singleton: String },

    #[error("Name conflict: '{name}' is already registered on this node")]
    NameConflict { name: String },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Codec error: {message}")]
    Codec { message: String },

    #[error("Unknown node: {address}")]
    UnknownNode { address: String },

    #[error("Invalid node address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error(transparent)]
    Actor(#[from] ActorError),
}

pub type Result<T> = std::result::Result<T, ClusterError>;

impl ClusterError {
    pub fn handover_in_progress(singleton: impl Into<String>) -> Self {
        Self::SingletonHandoverInProgress {
            singleton: singleton.into(),
        }
    }

    pub fn name_conflict(name: impl Into<String>) -> Self {
        Self::NameConflict { name: name.into() }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    pub fn unknown_node(address: impl ToString) -> Self {
        Self::UnknownNode {
            address: address.to_string(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::SingletonHandoverInProgress { .. } | Self::Transport { .. } => {
                ErrorClass::Retryable
            }
            Self::NameConflict { .. } | Self::InvalidAddress { .. } => ErrorClass::Client,
            Self::Codec { .. } | Self::UnknownNode { .. } => ErrorClass::Internal,
            Self::Actor(inner) => inner.class(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }
}

impl From<bincode::Error> for ClusterError {
    fn from(error: bincode::Error) -> Self {
        Self::codec(error.to_string())
    }
}

/// Spawning a named manager twice surfaces as a cluster-level conflict
pub(crate) fn spawn_error(error: ActorError) -> ClusterError {
    match error {
        ActorError::NameConflict { name, .. } => ClusterError::NameConflict { name },
        other => ClusterError::Actor(other),
    }
}
