//! Membership Oracle and Local View
//!
//! The oracle is whatever tells a node who is in the cluster (gossip, a
//! coordinator, or the in-memory simulation). [`MembershipView`] folds its
//! events into a local picture that tolerates duplicates and reordering.

use crate::error::Result;
use crate::member::{Member, MemberStatus, MembershipEvent, NodeAddress};
use async_trait::async_trait;
use futures::Stream;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

#[async_trait]
pub trait MembershipOracle: Send + Sync + 'static {
    fn self_address(&self) -> NodeAddress;

    async fn current_members(&self) -> Vec<Member>;

    /// Members this node currently cannot reach
    async fn unreachable(&self) -> Vec<NodeAddress>;

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent>;

    /// Ask a member to leave gracefully
    async fn leave(&self, address: &NodeAddress) -> Result<()>;

    /// Declare a member dead
    async fn down(&self, address: &NodeAddress) -> Result<()>;
}

/// Turn a broadcast subscription into a stream; lagged gaps are logged and skipped
pub fn membership_events(
    receiver: broadcast::Receiver<MembershipEvent>,
) -> impl Stream<Item = MembershipEvent> + Send + 'static {
    futures::stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => return Some((event, receiver)),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Membership subscriber lagged, events skipped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
}

/// Subscribe first, then read the current state, so nothing falls in between
pub async fn initial_view(oracle: &dyn MembershipOracle) -> (MembershipView, broadcast::Receiver<MembershipEvent>) {
    let receiver = oracle.subscribe();
    let view = MembershipView::from_members(
        oracle.self_address(),
        oracle.current_members().await,
        oracle.unreachable().await,
    );
    (view, receiver)
}

/// Eventually consistent local reconciliation of membership events
#[derive(Debug, Clone)]
pub struct MembershipView {
    self_address: NodeAddress,
    members: BTreeMap<NodeAddress, Member>,
    unreachable: BTreeSet<NodeAddress>,
}

impl MembershipView {
    pub fn new(self_address: NodeAddress) -> Self {
        Self {
            self_address,
            members: BTreeMap::new(),
            unreachable: BTreeSet::new(),
        }
    }

    pub fn from_members(
        self_address: NodeAddress,
        members: impl IntoIterator<Item = Member>,
        unreachable: impl IntoIterator<Item = NodeAddress>,
    ) -> Self {
        let mut view = Self::new(self_address);
        for member in members {
            view.merge(member);
        }
        view.unreachable = unreachable
            .into_iter()
            .filter(|addr| view.members.contains_key(addr))
            .collect();
        view
    }

    /// Fold one event in; returns whether anything changed
    pub fn apply(&mut self, event: &MembershipEvent) -> bool {
        let member = event.member();
        match event {
            MembershipEvent::UnreachableMember(_) => {
                if self.status_of(&member.address).is_none() {
                    self.merge(member.clone());
                }
                let is_terminal = self
                    .status_of(&member.address)
                    .map(|s| s == MemberStatus::Removed)
                    .unwrap_or(false);
                !is_terminal && self.unreachable.insert(member.address.clone())
            }
            MembershipEvent::ReachableMember(_) => self.unreachable.remove(&member.address),
            _ => {
                let Some(status) = event.status() else {
                    return false;
                };
                let mut member = member.clone();
                member.status = status;
                let changed = self.merge(member);
                if status == MemberStatus::Removed {
                    self.unreachable.remove(&event.member().address);
                }
                changed
            }
        }
    }

    /// Monotonic upsert; a transition backwards is ignored
    fn merge(&mut self, incoming: Member) -> bool {
        match self.members.get_mut(&incoming.address) {
            Some(current) => {
                if incoming.status < current.status {
                    debug!(
                        member = %incoming.address,
                        current = ?current.status,
                        incoming = ?incoming.status,
                        "Ignoring stale membership transition"
                    );
                    return false;
                }
                let up_number = if current.up_number == 0 {
                    incoming.up_number
                } else {
                    current.up_number
                };
                let changed = incoming.status != current.status || up_number != current.up_number;
                current.status = incoming.status;
                current.up_number = up_number;
                if !incoming.roles.is_empty() {
                    current.roles = incoming.roles;
                }
                changed
            }
            None => {
                self.members.insert(incoming.address.clone(), incoming);
                true
            }
        }
    }

    pub fn self_address(&self) -> &NodeAddress {
        &self.self_address
    }

    pub fn member(&self, address: &NodeAddress) -> Option<&Member> {
        self.members.get(address)
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn status_of(&self, address: &NodeAddress) -> Option<MemberStatus> {
        self.members.get(address).map(|m| m.status)
    }

    pub fn is_unreachable(&self, address: &NodeAddress) -> bool {
        self.unreachable.contains(address)
    }

    pub fn unreachable(&self) -> &BTreeSet<NodeAddress> {
        &self.unreachable
    }

    /// Oldest Up or Leaving member with the role; unreachable members still count
    pub fn oldest(&self, role: Option<&str>) -> Option<&Member> {
        self.members
            .values()
            .filter(|m| matches!(m.status, MemberStatus::Up | MemberStatus::Leaving))
            .filter(|m| m.has_role(role))
            .min_by(|a, b| a.age_cmp(b))
    }

    /// Oldest member that is Up, i.e. the next owner once a leaving member has handed over
    pub fn oldest_up(&self, role: Option<&str>) -> Option<&Member> {
        self.members
            .values()
            .filter(|m| m.status == MemberStatus::Up)
            .filter(|m| m.has_role(role))
            .min_by(|a, b| a.age_cmp(b))
    }

    /// Members that take part in the cluster: Up or Leaving
    pub fn active_members(&self) -> impl Iterator<Item = &Member> {
        self.members
            .values()
            .filter(|m| matches!(m.status, MemberStatus::Up | MemberStatus::Leaving))
    }

    /// Up members other than this node that are currently reachable
    pub fn reachable_up_except_self(&self) -> Vec<NodeAddress> {
        self.members
            .values()
            .filter(|m| m.status == MemberStatus::Up)
            .filter(|m| m.address != self.self_address)
            .filter(|m| !self.unreachable.contains(&m.address))
            .map(|m| m.address.clone())
            .collect()
    }

    /// Every member that may still be running, other than this node
    pub fn peers(&self) -> Vec<NodeAddress> {
        self.members
            .values()
            .filter(|m| !m.status.is_terminal())
            .filter(|m| m.address != self.self_address)
            .map(|m| m.address.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn addr(port: u16) -> NodeAddress {
        NodeAddress::new("127.0.0.1", port)
    }

    fn up(port: u16, up_number: u64) -> Member {
        Member::new(addr(port), MemberStatus::Up).with_up_number(up_number)
    }

    #[test]
    fn test_status_is_monotonic() {
        let mut view = MembershipView::new(addr(1));
        assert!(view.apply(&MembershipEvent::MemberUp(up(2, 1))));
        assert!(view.apply(&MembershipEvent::MemberLeft(up(2, 1))));
        assert!(!view.apply(&MembershipEvent::MemberUp(up(2, 1))));
        assert_eq!(view.status_of(&addr(2)), Some(MemberStatus::Leaving));
    }

    #[test]
    fn test_duplicates_are_idempotent() {
        let mut view = MembershipView::new(addr(1));
        let event = MembershipEvent::MemberUp(up(2, 1));
        assert!(view.apply(&event));
        assert!(!view.apply(&event));
        assert!(view.apply(&MembershipEvent::UnreachableMember(up(2, 1))));
        assert!(!view.apply(&MembershipEvent::UnreachableMember(up(2, 1))));
    }

    #[test]
    fn test_oldest_by_up_number_then_address() {
        let mut view = MembershipView::new(addr(1));
        view.apply(&MembershipEvent::MemberUp(up(3, 2)));
        view.apply(&MembershipEvent::MemberUp(up(2, 2)));
        view.apply(&MembershipEvent::MemberUp(up(4, 5)));
        assert_eq!(view.oldest(None).unwrap().address, addr(2));

        // unreachable members keep their seniority
        view.apply(&MembershipEvent::UnreachableMember(up(2, 2)));
        assert_eq!(view.oldest(None).unwrap().address, addr(2));

        view.apply(&MembershipEvent::MemberDowned(up(2, 2)));
        assert_eq!(view.oldest(None).unwrap().address, addr(3));
    }

    #[test]
    fn test_oldest_with_role_and_leaving() {
        let mut view = MembershipView::new(addr(1));
        view.apply(&MembershipEvent::MemberUp(up(2, 1)));
        view.apply(&MembershipEvent::MemberUp(up(3, 2).with_roles(["backend"])));
        assert_eq!(view.oldest(Some("backend")).unwrap().address, addr(3));
        assert!(view.oldest(Some("frontend")).is_none());

        view.apply(&MembershipEvent::MemberLeft(up(2, 1)));
        assert_eq!(view.oldest(None).unwrap().address, addr(2));
        assert_eq!(view.oldest_up(None).unwrap().address, addr(3));
    }

    #[test]
    fn test_removed_member_is_not_reachable_peer() {
        let mut view = MembershipView::new(addr(1));
        view.apply(&MembershipEvent::MemberUp(up(1, 1)));
        view.apply(&MembershipEvent::MemberUp(up(2, 2)));
        view.apply(&MembershipEvent::MemberUp(up(3, 3)));
        view.apply(&MembershipEvent::UnreachableMember(up(3, 3)));
        assert_eq!(view.reachable_up_except_self(), vec![addr(2)]);

        view.apply(&MembershipEvent::MemberRemoved(up(3, 3)));
        assert!(!view.is_unreachable(&addr(3)));
        assert_eq!(view.peers(), vec![addr(2)]);
    }

    fn event_strategy() -> impl Strategy<Value = MembershipEvent> {
        (1u16..5, 1u64..5, 0usize..7).prop_map(|(port, up_number, kind)| {
            let member = up(port, up_number);
            match kind {
                0 => MembershipEvent::MemberJoined(member),
                1 => MembershipEvent::MemberUp(member),
                2 => MembershipEvent::MemberLeft(member),
                3 => MembershipEvent::MemberDowned(member),
                4 => MembershipEvent::MemberRemoved(member),
                5 => MembershipEvent::UnreachableMember(member),
                _ => MembershipEvent::ReachableMember(member),
            }
        })
    }

    proptest! {
        #[test]
        fn status_never_moves_backwards(events in prop::collection::vec(event_strategy(), 0..40)) {
            let mut view = MembershipView::new(addr(1));
            let mut seen: BTreeMap<NodeAddress, MemberStatus> = BTreeMap::new();
            for event in &events {
                view.apply(event);
                for member in view.members() {
                    if let Some(previous) = seen.insert(member.address.clone(), member.status) {
                        prop_assert!(member.status >= previous);
                    }
                }
            }
        }
    }
}
