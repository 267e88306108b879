//! Cluster Listener
//!
//! Logs every membership change seen by this node and keeps a view that
//! can be queried.

use crate::error::{spawn_error, Result};
use crate::member::{Member, MembershipEvent};
use crate::membership::{initial_view, membership_events, MembershipView};
use crate::node::ClusterNode;
use actors::{async_trait, ActorBehavior, ActorContext, ActorRef, ActorSystem, Next, Props, ReplyTo};
use tracing::{debug, info, warn};

pub enum ListenerMsg {
    Event(MembershipEvent),
    Members(ReplyTo<Vec<Member>>),
}

pub struct ClusterListener {
    node: ClusterNode,
    view: Option<MembershipView>,
}

impl ClusterListener {
    pub fn new(node: ClusterNode) -> Self {
        Self { node, view: None }
    }

    pub fn props(node: ClusterNode) -> Props<ListenerMsg> {
        Props::new(move || ClusterListener::new(node.clone()))
    }

    fn log_event(event: &MembershipEvent) {
        let member = event.member();
        match event {
            MembershipEvent::MemberUp(m) => {
                info!(member = %m.address, roles = ?m.roles, up_number = m.up_number, "Member is Up")
            }
            MembershipEvent::MemberRemoved(m) => info!(member = %m.address, "Member is Removed"),
            MembershipEvent::UnreachableMember(m) => {
                warn!(member = %m.address, "Member detected as unreachable")
            }
            MembershipEvent::ReachableMember(m) => {
                info!(member = %m.address, "Member is reachable again")
            }
            other => debug!(member = %member.address, event = other.kind(), "Cluster event"),
        }
    }
}

#[async_trait]
impl ActorBehavior for ClusterListener {
    type Message = ListenerMsg;

    async fn on_start(&mut self, ctx: &mut ActorContext<ListenerMsg>) -> actors::Result<()> {
        let (view, receiver) = initial_view(self.node.oracle().as_ref()).await;
        info!(
            node = %self.node.self_address(),
            members = view.members().count(),
            "ClusterListener started"
        );
        self.view = Some(view);
        ctx.forward_stream(membership_events(receiver), ListenerMsg::Event);
        Ok(())
    }

    async fn handle(
        &mut self,
        _ctx: &mut ActorContext<ListenerMsg>,
        msg: ListenerMsg,
    ) -> actors::Result<Next<ListenerMsg>> {
        match msg {
            ListenerMsg::Event(event) => {
                let changed = self
                    .view
                    .as_mut()
                    .map(|view| view.apply(&event))
                    .unwrap_or(false);
                if changed {
                    Self::log_event(&event);
                }
            }
            ListenerMsg::Members(reply_to) => {
                let members = self
                    .view
                    .as_ref()
                    .map(|view| view.members().cloned().collect())
                    .unwrap_or_default();
                reply_to.send(members);
            }
        }
        Ok(Next::Same)
    }
}

/// Spawn the listener as `/user/cluster-listener`
pub fn spawn_cluster_listener(system: &ActorSystem, node: &ClusterNode) -> Result<ActorRef<ListenerMsg>> {
    system
        .spawn("cluster-listener", ClusterListener::props(node.clone()))
        .map_err(spawn_error)
}
