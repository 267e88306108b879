//! Actor Message Types
//!
//! The [`Message`] marker, reply addresses used by the ask pattern, and the
//! [`Request`] envelope for actors whose commands carry an optional reply.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Anything that can be sent to an actor mailbox
pub trait Message: Send + 'static {}

impl<T: Send + 'static> Message for T {}

/// Correlates a reply with the ask that is waiting for it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

enum ReplyTarget<R> {
    Local(oneshot::Sender<R>),
    Forward(Box<dyn FnOnce(R) + Send>),
}

/// One-shot reply address carried inside a command
pub struct ReplyTo<R> {
    correlation_id: CorrelationId,
    target: ReplyTarget<R>,
}

impl<R: Send + 'static> ReplyTo<R> {
    /// Reply address backed by a local oneshot channel
    pub fn channel() -> (Self, oneshot::Receiver<R>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                correlation_id: CorrelationId::new(),
                target: ReplyTarget::Local(tx),
            },
            rx,
        )
    }

    /// Reply address that hands the value to a closure, e.g. to encode it
    /// for another node or to adapt it into a different reply type
    pub fn forward<F>(correlation_id: CorrelationId, f: F) -> Self
    where
        F: FnOnce(R) + Send + 'static,
    {
        Self {
            correlation_id,
            target: ReplyTarget::Forward(Box::new(f)),
        }
    }

    /// Reply address that converts the value before passing it on
    pub fn map<T, F>(self, f: F) -> ReplyTo<T>
    where
        T: Send + 'static,
        F: FnOnce(T) -> R + Send + 'static,
    {
        let correlation_id = self.correlation_id;
        ReplyTo::forward(correlation_id, move |value| {
            self.send(f(value));
        })
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Deliver the reply; returns false when the asker is gone
    pub fn send(self, value: R) -> bool {
        match self.target {
            ReplyTarget::Local(tx) => tx.send(value).is_ok(),
            ReplyTarget::Forward(f) => {
                f(value);
                true
            }
        }
    }

    /// True when nobody can observe the reply anymore
    pub fn is_closed(&self) -> bool {
        match &self.target {
            ReplyTarget::Local(tx) => tx.is_closed(),
            ReplyTarget::Forward(_) => false,
        }
    }
}

impl<R> fmt::Debug for ReplyTo<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.target {
            ReplyTarget::Local(_) => "local",
            ReplyTarget::Forward(_) => "forward",
        };
        f.debug_struct("ReplyTo")
            .field("correlation_id", &self.correlation_id)
            .field("kind", &kind)
            .finish()
    }
}

/// Command envelope with an optional reply address
#[derive(Debug)]
pub struct Request<C, R> {
    pub command: C,
    pub reply_to: Option<ReplyTo<R>>,
}

impl<C, R: Send + 'static> Request<C, R> {
    /// Fire-and-forget request
    pub fn tell(command: C) -> Self {
        Self {
            command,
            reply_to: None,
        }
    }

    pub fn ask(command: C, reply_to: ReplyTo<R>) -> Self {
        Self {
            command,
            reply_to: Some(reply_to),
        }
    }
}

/// Reply if the sender asked for one
pub fn respond<R: Send + 'static>(reply_to: Option<ReplyTo<R>>, value: R) {
    if let Some(reply_to) = reply_to {
        if !reply_to.send(value) {
            tracing::debug!("Reply dropped: asker no longer waiting");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_local_reply() {
        let (reply_to, rx) = ReplyTo::<u32>::channel();
        assert!(!reply_to.is_closed());
        assert!(reply_to.send(7));
        assert_eq!(rx.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_closed_local_reply() {
        let (reply_to, rx) = ReplyTo::<u32>::channel();
        drop(rx);
        assert!(reply_to.is_closed());
        assert!(!reply_to.send(1));
    }

    #[test]
    fn test_forward_and_map() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = CorrelationId::new();
        let reply_to = ReplyTo::forward(id, move |v: String| sink.lock().unwrap().push(v));
        let mapped: ReplyTo<u64> = reply_to.map(|n: u64| format!("value={}", n));
        assert_eq!(mapped.correlation_id(), id);
        assert!(mapped.send(3));
        assert_eq!(seen.lock().unwrap().as_slice(), ["value=3".to_string()]);
    }
}
