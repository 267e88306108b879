//! Actor Error Types
//!
//! Failures surfaced by the actor runtime: spawn conflicts, delivery to
//! stopped actors, ask timeouts, rejected commands and handler failures.

use thiserror::Error;

/// How callers outside the actor system should treat an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Caller mistake, maps to a 4xx-style response
    Client,
    /// Transient, the same request may succeed later
    Retryable,
    /// Bug or unrecoverable runtime condition
    Internal,
}

/// Main actor runtime error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActorError {
    /// A live sibling already uses this name
    #[error("Name conflict: '{name}' already exists under {parent}")]
    NameConflict { name: String, parent: String },

    /// Target actor is stopped or stopping
    #[error("Actor stopped: {path}")]
    ActorStopped { path: String },

    /// The actor dropped the reply address without answering
    #[error("No reply from {path}")]
    NoReply { path: String },

    #[error("Timeout error: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Business rule refused the command; actor state is unchanged
    #[error("Command rejected: {reason}")]
    CommandRejected { reason: String },

    #[error("Handler failed: {message}")]
    HandlerFailed { message: String },

    #[error("Actor panicked: {message}")]
    Panicked { message: String },

    /// Failure propagated from a child whose supervisor chose to escalate
    #[error("Child {child} escalated: {cause}")]
    Escalated { child: String, cause: Box<ActorError> },

    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },
}

/// Result type alias for actor operations
pub type Result<T> = std::result::Result<T, ActorError>;

impl ActorError {
    pub fn name_conflict(name: impl Into<String>, parent: impl Into<String>) -> Self {
        Self::NameConflict {
            name: name.into(),
            parent: parent.into(),
        }
    }

    pub fn stopped(path: impl Into<String>) -> Self {
        Self::ActorStopped { path: path.into() }
    }

    pub fn no_reply(path: impl Into<String>) -> Self {
        Self::NoReply { path: path.into() }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::CommandRejected {
            reason: reason.into(),
        }
    }

    /// Wrap any displayable failure raised inside a behavior
    pub fn handler(error: impl std::fmt::Display) -> Self {
        Self::HandlerFailed {
            message: error.to_string(),
        }
    }

    pub fn panicked(message: impl Into<String>) -> Self {
        Self::Panicked {
            message: message.into(),
        }
    }

    pub fn escalated(child: impl Into<String>, cause: ActorError) -> Self {
        Self::Escalated {
            child: child.into(),
            cause: Box::new(cause),
        }
    }

    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NameConflict { .. }
            | Self::CommandRejected { .. }
            | Self::Configuration { .. } => ErrorClass::Client,
            Self::ActorStopped { .. } | Self::NoReply { .. } | Self::Timeout { .. } => {
                ErrorClass::Retryable
            }
            Self::HandlerFailed { .. } | Self::Panicked { .. } => ErrorClass::Internal,
            Self::Escalated { cause, .. } => cause.class(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    /// Get error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            Self::NameConflict { .. } => "name_conflict",
            Self::ActorStopped { .. } => "actor_stopped",
            Self::NoReply { .. } => "no_reply",
            Self::Timeout { .. } => "timeout",
            Self::CommandRejected { .. } => "rejected",
            Self::HandlerFailed { .. } => "handler",
            Self::Panicked { .. } => "panic",
            Self::Escalated { .. } => "escalated",
            Self::Configuration { .. } => "configuration",
        }
    }
}
