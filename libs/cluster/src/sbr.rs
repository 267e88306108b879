//! Split-Brain Resolver
//!
//! Once the set of unreachable members has been stable for `stable_after`,
//! the side holding a strict majority of the Up/Leaving members downs the
//! other side. On an even split the side containing the lowest address
//! survives. A minority side downs itself so it stops hosting singletons.

use crate::error::{spawn_error, Result};
use crate::member::{MembershipEvent, NodeAddress};
use crate::membership::{initial_view, membership_events, MembershipView};
use crate::node::ClusterNode;
use actors::{async_trait, ActorBehavior, ActorContext, ActorRef, ActorSystem, Next, Props};
use node_config::{SplitBrainConfig, SplitBrainStrategyKind};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, warn};

const STABLE_TIMER: &str = "sbr-stable";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SbrDecision {
    /// Nothing unreachable
    NoAction,
    /// This side survives; down the listed unreachable members
    DownUnreachable(Vec<NodeAddress>),
    /// This side loses; down every member of it, this node included
    DownOwnSide(Vec<NodeAddress>),
}

/// Keep-majority decision for the current view
pub fn keep_majority(view: &MembershipView) -> SbrDecision {
    let active: BTreeSet<NodeAddress> = view.active_members().map(|m| m.address.clone()).collect();
    let unreachable: Vec<NodeAddress> = active
        .iter()
        .filter(|addr| view.is_unreachable(addr))
        .cloned()
        .collect();
    if unreachable.is_empty() {
        return SbrDecision::NoAction;
    }
    let reachable: Vec<NodeAddress> = active
        .iter()
        .filter(|addr| !view.is_unreachable(addr))
        .cloned()
        .collect();

    let survives = match (reachable.len() * 2).cmp(&active.len()) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        // BTreeSet iterates in address order, so the first active member is the lowest
        std::cmp::Ordering::Equal => active
            .iter()
            .next()
            .map(|lowest| !view.is_unreachable(lowest))
            .unwrap_or(false),
    };

    if survives {
        SbrDecision::DownUnreachable(unreachable)
    } else {
        SbrDecision::DownOwnSide(reachable)
    }
}

#[derive(Debug, Clone)]
pub enum SbrMsg {
    Membership(MembershipEvent),
    Stable,
}

pub struct SplitBrainResolver {
    node: ClusterNode,
    stable_after: Duration,
    view: Option<MembershipView>,
}

impl SplitBrainResolver {
    pub fn new(node: ClusterNode, stable_after: Duration) -> Self {
        Self {
            node,
            stable_after,
            view: None,
        }
    }

    fn schedule(&self, ctx: &mut ActorContext<SbrMsg>) {
        let unstable = self
            .view
            .as_ref()
            .map(|view| !view.unreachable().is_empty())
            .unwrap_or(false);
        if unstable {
            debug!(stable_after_ms = self.stable_after.as_millis() as u64, "Unreachability changed, waiting for stability");
            ctx.start_single_timer(STABLE_TIMER, self.stable_after, SbrMsg::Stable);
        } else {
            ctx.cancel_timer(STABLE_TIMER);
        }
    }

    async fn resolve(&self) {
        let Some(view) = self.view.as_ref() else {
            return;
        };
        let decision = keep_majority(view);
        let targets = match &decision {
            SbrDecision::NoAction => return,
            SbrDecision::DownUnreachable(targets) => {
                warn!(node = %view.self_address(), targets = ?targets, "Split brain: keeping majority, downing unreachable members");
                targets
            }
            SbrDecision::DownOwnSide(targets) => {
                warn!(node = %view.self_address(), targets = ?targets, "Split brain: in minority, downing own side");
                targets
            }
        };
        for target in targets {
            if let Err(e) = self.node.oracle().down(target).await {
                warn!(target = %target, error = %e, "Failed to down member");
            }
        }
    }
}

#[async_trait]
impl ActorBehavior for SplitBrainResolver {
    type Message = SbrMsg;

    async fn on_start(&mut self, ctx: &mut ActorContext<SbrMsg>) -> actors::Result<()> {
        let (view, receiver) = initial_view(self.node.oracle().as_ref()).await;
        self.view = Some(view);
        ctx.forward_stream(membership_events(receiver), SbrMsg::Membership);
        info!(
            node = %self.node.self_address(),
            stable_after_ms = self.stable_after.as_millis() as u64,
            "Split-brain resolver started"
        );
        self.schedule(ctx);
        Ok(())
    }

    async fn handle(&mut self, ctx: &mut ActorContext<SbrMsg>, msg: SbrMsg) -> actors::Result<Next<SbrMsg>> {
        match msg {
            SbrMsg::Membership(event) => {
                let reachability = matches!(
                    event,
                    MembershipEvent::UnreachableMember(_)
                        | MembershipEvent::ReachableMember(_)
                        | MembershipEvent::MemberDowned(_)
                        | MembershipEvent::MemberRemoved(_)
                );
                let changed = self
                    .view
                    .as_mut()
                    .map(|view| view.apply(&event))
                    .unwrap_or(false);
                if changed && reachability {
                    self.schedule(ctx);
                }
            }
            SbrMsg::Stable => self.resolve().await,
        }
        Ok(Next::Same)
    }
}

/// Spawn `/user/split-brain-resolver`; `None` when the strategy is off
pub fn spawn_split_brain_resolver(
    system: &ActorSystem,
    node: &ClusterNode,
    config: &SplitBrainConfig,
) -> Result<Option<ActorRef<SbrMsg>>> {
    match config.strategy {
        SplitBrainStrategyKind::Off => Ok(None),
        SplitBrainStrategyKind::KeepMajority => {
            let node = node.clone();
            let stable_after = Duration::from_millis(config.stable_after_ms);
            let props = Props::new(move || SplitBrainResolver::new(node.clone(), stable_after));
            system
                .spawn("split-brain-resolver", props)
                .map(Some)
                .map_err(spawn_error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::{Member, MemberStatus};

    fn addr(port: u16) -> NodeAddress {
        NodeAddress::new("10.0.0.1", port)
    }

    fn view_with(self_port: u16, ports: &[u16], unreachable: &[u16]) -> MembershipView {
        let members = ports.iter().enumerate().map(|(i, port)| {
            Member::new(addr(*port), MemberStatus::Up).with_up_number(i as u64 + 1)
        });
        MembershipView::from_members(
            addr(self_port),
            members,
            unreachable.iter().map(|p| addr(*p)),
        )
    }

    #[test]
    fn test_no_unreachable_no_action() {
        let view = view_with(1, &[1, 2, 3], &[]);
        assert_eq!(keep_majority(&view), SbrDecision::NoAction);
    }

    #[test]
    fn test_majority_downs_unreachable() {
        let view = view_with(1, &[1, 2, 3], &[3]);
        assert_eq!(keep_majority(&view), SbrDecision::DownUnreachable(vec![addr(3)]));
    }

    #[test]
    fn test_minority_downs_itself() {
        let view = view_with(3, &[1, 2, 3], &[1, 2]);
        assert_eq!(keep_majority(&view), SbrDecision::DownOwnSide(vec![addr(3)]));
    }

    #[test]
    fn test_even_split_lowest_address_wins() {
        let with_lowest = view_with(1, &[1, 2, 3, 4], &[3, 4]);
        assert_eq!(
            keep_majority(&with_lowest),
            SbrDecision::DownUnreachable(vec![addr(3), addr(4)])
        );

        let without_lowest = view_with(3, &[1, 2, 3, 4], &[1, 2]);
        assert_eq!(
            keep_majority(&without_lowest),
            SbrDecision::DownOwnSide(vec![addr(3), addr(4)])
        );
    }

    #[test]
    fn test_downed_members_do_not_count() {
        let mut view = view_with(1, &[1, 2, 3, 4, 5], &[4, 5]);
        view.apply(&MembershipEvent::MemberDowned(
            Member::new(addr(2), MemberStatus::Up).with_up_number(2),
        ));
        // 2 of 4 remaining reachable, tie broken by lowest address 1
        assert_eq!(
            keep_majority(&view),
            SbrDecision::DownUnreachable(vec![addr(4), addr(5)])
        );
    }
}
