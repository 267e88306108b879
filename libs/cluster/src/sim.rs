//! In-Process Cluster
//!
//! A whole cluster living in one process: it assigns up-numbers, publishes
//! membership events to every live node, and carries transport frames
//! between nodes. Crashes and partitions are injected explicitly so
//! failover paths can be exercised deterministically.

use crate::error::{ClusterError, Result};
use crate::member::{Member, MemberStatus, MembershipEvent, NodeAddress};
use crate::membership::MembershipOracle;
use crate::node::ClusterNode;
use crate::transport::{ClusterTransport, InboundHandler};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

struct NodeSlot {
    member: Member,
    alive: bool,
    events: broadcast::Sender<MembershipEvent>,
    handlers: HashMap<String, InboundHandler>,
    /// Members this node observes as unreachable
    unreachable: BTreeSet<NodeAddress>,
}

#[derive(Default)]
struct ClusterState {
    nodes: BTreeMap<NodeAddress, NodeSlot>,
    next_up_number: u64,
    /// Directed pairs that cannot exchange frames
    blocked: HashSet<(NodeAddress, NodeAddress)>,
}

impl ClusterState {
    fn publish_to_live(&self, event: &MembershipEvent) {
        for slot in self.nodes.values().filter(|slot| slot.alive) {
            let _ = slot.events.send(event.clone());
        }
    }

    fn slot_mut(&mut self, address: &NodeAddress) -> Result<&mut NodeSlot> {
        self.nodes
            .get_mut(address)
            .ok_or_else(|| ClusterError::unknown_node(address))
    }

    /// Mark `target` unreachable for every live observer in `observers`
    fn mark_unreachable(&mut self, observers: &[NodeAddress], target: &NodeAddress) {
        let Some(member) = self.nodes.get(target).map(|slot| slot.member.clone()) else {
            return;
        };
        for observer in observers {
            if observer == target {
                continue;
            }
            if let Some(slot) = self.nodes.get_mut(observer).filter(|slot| slot.alive) {
                if slot.unreachable.insert(target.clone()) {
                    let _ = slot
                        .events
                        .send(MembershipEvent::UnreachableMember(member.clone()));
                }
            }
        }
    }
}

/// Shared handle to the simulated cluster
#[derive(Clone, Default)]
pub struct InMemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a Joining member and return its node handle
    pub fn join<I, S>(&self, address: NodeAddress, roles: I) -> Result<Arc<SimulatedNode>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state.lock();
        if state.nodes.contains_key(&address) {
            return Err(ClusterError::name_conflict(address.to_string()));
        }
        let member = Member::new(address.clone(), MemberStatus::Joining).with_roles(roles);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        state.nodes.insert(
            address.clone(),
            NodeSlot {
                member: member.clone(),
                alive: true,
                events,
                handlers: HashMap::new(),
                unreachable: BTreeSet::new(),
            },
        );
        state.publish_to_live(&MembershipEvent::MemberJoined(member));
        info!(node = %address, "Node joined cluster");

        Ok(Arc::new(SimulatedNode {
            cluster: self.clone(),
            address,
        }))
    }

    /// Promote a Joining member to Up, assigning the next up-number
    pub fn up(&self, address: &NodeAddress) -> Result<()> {
        let mut state = self.state.lock();
        state.next_up_number += 1;
        let up_number = state.next_up_number;
        let slot = state.slot_mut(address)?;
        if slot.member.status != MemberStatus::Joining {
            return Ok(());
        }
        slot.member.status = MemberStatus::Up;
        slot.member.up_number = up_number;
        let member = slot.member.clone();
        state.publish_to_live(&MembershipEvent::MemberUp(member));
        info!(node = %address, up_number, "Member is Up");
        Ok(())
    }

    pub fn join_up<I, S>(&self, address: NodeAddress, roles: I) -> Result<Arc<SimulatedNode>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let node = self.join(address.clone(), roles)?;
        self.up(&address)?;
        Ok(node)
    }

    /// Graceful leave: the member becomes Leaving and stays reachable
    pub fn leave(&self, address: &NodeAddress) -> Result<()> {
        let mut state = self.state.lock();
        let slot = state.slot_mut(address)?;
        if slot.member.status >= MemberStatus::Leaving {
            return Ok(());
        }
        slot.member.status = MemberStatus::Leaving;
        let member = slot.member.clone();
        state.publish_to_live(&MembershipEvent::MemberLeft(member));
        info!(node = %address, "Member is Leaving");
        Ok(())
    }

    /// Finish a leave (or a down): the member is Removed and stops participating
    pub fn remove(&self, address: &NodeAddress) -> Result<()> {
        let mut state = self.state.lock();
        let slot = state.slot_mut(address)?;
        if slot.member.status == MemberStatus::Removed {
            return Ok(());
        }
        slot.member.status = MemberStatus::Removed;
        let member = slot.member.clone();
        state.publish_to_live(&MembershipEvent::MemberRemoved(member));
        if let Some(slot) = state.nodes.get_mut(address) {
            slot.alive = false;
            slot.handlers.clear();
        }
        for slot in state.nodes.values_mut() {
            slot.unreachable.remove(address);
        }
        info!(node = %address, "Member removed");
        Ok(())
    }

    /// The node stops sending and receiving; everyone else observes it unreachable
    pub fn crash(&self, address: &NodeAddress) -> Result<()> {
        let mut state = self.state.lock();
        let slot = state.slot_mut(address)?;
        slot.alive = false;
        slot.handlers.clear();
        let observers: Vec<NodeAddress> = state.nodes.keys().cloned().collect();
        state.mark_unreachable(&observers, address);
        warn!(node = %address, "Node crashed");
        Ok(())
    }

    /// Declare a member dead; it is then removed
    pub fn down(&self, address: &NodeAddress) -> Result<()> {
        {
            let mut state = self.state.lock();
            let slot = state.slot_mut(address)?;
            if slot.member.status.is_terminal() {
                return Ok(());
            }
            slot.member.status = MemberStatus::Down;
            let member = slot.member.clone();
            state.publish_to_live(&MembershipEvent::MemberDowned(member));
        }
        warn!(node = %address, "Member downed");
        self.remove(address)
    }

    /// Cut every link between the two sides
    pub fn partition(&self, side_a: &[NodeAddress], side_b: &[NodeAddress]) {
        let mut state = self.state.lock();
        for a in side_a {
            for b in side_b {
                state.blocked.insert((a.clone(), b.clone()));
                state.blocked.insert((b.clone(), a.clone()));
            }
        }
        for b in side_b {
            state.mark_unreachable(side_a, b);
        }
        for a in side_a {
            state.mark_unreachable(side_b, a);
        }
        warn!(side_a = ?side_a, side_b = ?side_b, "Network partition injected");
    }

    /// Restore every link between live nodes
    pub fn heal(&self) {
        let mut state = self.state.lock();
        state.blocked.clear();
        let live: BTreeMap<NodeAddress, Member> = state
            .nodes
            .iter()
            .filter(|(_, slot)| slot.alive)
            .map(|(addr, slot)| (addr.clone(), slot.member.clone()))
            .collect();
        for slot in state.nodes.values_mut().filter(|slot| slot.alive) {
            let recovered: Vec<NodeAddress> = slot
                .unreachable
                .iter()
                .filter(|addr| live.contains_key(*addr))
                .cloned()
                .collect();
            for addr in recovered {
                slot.unreachable.remove(&addr);
                if let Some(member) = live.get(&addr) {
                    let _ = slot
                        .events
                        .send(MembershipEvent::ReachableMember(member.clone()));
                }
            }
        }
        info!("Network partition healed");
    }

    pub fn members(&self) -> Vec<Member> {
        self.state
            .lock()
            .nodes
            .values()
            .map(|slot| slot.member.clone())
            .collect()
    }

    fn deliver(&self, from: &NodeAddress, to: &NodeAddress, channel: &str, frame: Vec<u8>) -> Result<()> {
        let handler = {
            let state = self.state.lock();
            let target = state
                .nodes
                .get(to)
                .ok_or_else(|| ClusterError::unknown_node(to))?;
            let sender_alive = state.nodes.get(from).map(|slot| slot.alive).unwrap_or(false);
            if !sender_alive || !target.alive || state.blocked.contains(&(from.clone(), to.clone())) {
                debug!(from = %from, to = %to, channel, "Frame dropped: link down");
                return Ok(());
            }
            match target.handlers.get(channel) {
                Some(handler) => Arc::clone(handler),
                None => {
                    debug!(from = %from, to = %to, channel, "Frame dropped: no handler");
                    return Ok(());
                }
            }
        };
        handler(from.clone(), frame);
        Ok(())
    }
}

/// One node's view of the simulated cluster: membership oracle and transport
pub struct SimulatedNode {
    cluster: InMemoryCluster,
    address: NodeAddress,
}

impl SimulatedNode {
    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn cluster(&self) -> &InMemoryCluster {
        &self.cluster
    }

    /// Oracle and transport bundled for the cluster services
    pub fn cluster_node(self: &Arc<Self>) -> ClusterNode {
        ClusterNode::new(self.clone(), self.clone())
    }
}

#[async_trait]
impl MembershipOracle for SimulatedNode {
    fn self_address(&self) -> NodeAddress {
        self.address.clone()
    }

    async fn current_members(&self) -> Vec<Member> {
        self.cluster.members()
    }

    async fn unreachable(&self) -> Vec<NodeAddress> {
        self.cluster
            .state
            .lock()
            .nodes
            .get(&self.address)
            .map(|slot| slot.unreachable.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        let state = self.cluster.state.lock();
        match state.nodes.get(&self.address) {
            Some(slot) => slot.events.subscribe(),
            // closed receiver: the stream ends immediately
            None => broadcast::channel(1).1,
        }
    }

    async fn leave(&self, address: &NodeAddress) -> Result<()> {
        self.cluster.leave(address)
    }

    async fn down(&self, address: &NodeAddress) -> Result<()> {
        self.cluster.down(address)
    }
}

impl ClusterTransport for SimulatedNode {
    fn register(&self, channel: &str, handler: InboundHandler) -> Result<()> {
        let mut state = self.cluster.state.lock();
        let slot = state.slot_mut(&self.address)?;
        if slot.handlers.contains_key(channel) {
            return Err(ClusterError::name_conflict(channel));
        }
        slot.handlers.insert(channel.to_string(), handler);
        Ok(())
    }

    fn unregister(&self, channel: &str) {
        if let Some(slot) = self.cluster.state.lock().nodes.get_mut(&self.address) {
            slot.handlers.remove(channel);
        }
    }

    fn send(&self, to: &NodeAddress, channel: &str, frame: Vec<u8>) -> Result<()> {
        self.cluster.deliver(&self.address, to, channel, frame)
    }
}
