//! Reconciled Views
//!
//! A relay can carry a local picture of cluster-wide state (chat users,
//! subscriber directories) built by folding every topic event, local or
//! remote, into it. Folding must be idempotent: the same event applied twice
//! leaves the view as it was after the first time.

use crate::event::TopicEvent;
use cluster::NodeAddress;

pub trait ReconciledView<E>: Send + 'static {
    type Snapshot: Send + 'static;

    /// Vet a local publish before it gets a sequence number
    fn admit(&self, _payload: &E, _origin: &NodeAddress) -> std::result::Result<(), String> {
        Ok(())
    }

    /// Fold one event in; returns whether the view changed
    fn apply(&mut self, event: &TopicEvent<E>) -> bool;

    fn snapshot(&self) -> Self::Snapshot;

    /// A node left the cluster; drop whatever it contributed
    fn on_member_removed(&mut self, _node: &NodeAddress) -> bool {
        false
    }
}

/// Plain fan-out relay with no reconciled state
impl<E: Send + 'static> ReconciledView<E> for () {
    type Snapshot = ();

    fn apply(&mut self, _event: &TopicEvent<E>) -> bool {
        false
    }

    fn snapshot(&self) {}
}
