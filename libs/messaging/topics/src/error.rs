//! Topic Relay Error Types

use actors::{ActorError, ErrorClass};
use cluster::ClusterError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// The reconciled view refused a local publish
    #[error("Publish rejected: {reason}")]
    Rejected { reason: String },

    /// Same origin and sequence seen before; recovered locally
    #[error("Duplicate topic event {event_id}")]
    DuplicateTopicEvent { event_id: String },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Codec error: {message}")]
    Codec { message: String },

    #[error(transparent)]
    Actor(#[from] ActorError),
}

pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    pub fn duplicate(event_id: impl Into<String>) -> Self {
        Self::DuplicateTopicEvent {
            event_id: event_id.into(),
        }
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

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Rejected { .. } => ErrorClass::Client,
            Self::Transport { .. } => ErrorClass::Retryable,
            Self::DuplicateTopicEvent { .. } | Self::Codec { .. } => ErrorClass::Internal,
            Self::Actor(inner) => inner.class(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }
}

impl From<ClusterError> for RelayError {
    fn from(error: ClusterError) -> Self {
        match error {
            ClusterError::Codec { message } => Self::Codec { message },
            ClusterError::Actor(inner) => Self::Actor(inner),
            other => Self::transport(other.to_string()),
        }
    }
}

impl From<bincode::Error> for RelayError {
    fn from(error: bincode::Error) -> Self {
        Self::codec(error.to_string())
    }
}
