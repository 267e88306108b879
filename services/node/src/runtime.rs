//! Node Runtime
//!
//! Everything one node runs, started from a [`NodeConfig`]:
//!
//! ```text
//! /user
//!   ├── cluster-listener
//!   ├── split-brain-resolver        (unless the strategy is off)
//!   ├── singleton-global-counter    manager; hosts the instance on the oldest node
//!   ├── topic-relay-chat            ChatRoom
//!   ├── topic-relay-sse             EventBus
//!   ├── counter-{port}              PersistentCounter
//!   └── ticker                      (optional) increments the global counter
//! ```

use crate::chat::ChatRoom;
use crate::counter::{
    singleton_counter_props, spawn_persistent_counter, PersistentCounter, SingletonCounterCommand,
};
use crate::events::EventBus;
use actors::{
    async_trait, ActorBehavior, ActorContext, ActorRef, ActorSystem, Next, SystemSettings,
};
use anyhow::{Context, Result};
use cluster::{
    spawn_cluster_listener, spawn_split_brain_resolver, ClusterNode, ClusterSingleton,
    InMemoryCluster, ListenerMsg, NodeAddress, SbrMsg, SingletonRef, SingletonSettings,
};
use node_config::NodeConfig;
use persistence::{EntityRef, InMemoryJournal, InMemorySnapshotStore, Persistence};
use std::sync::Arc;
use std::time::Duration;
use topic_relay::RelaySettings;
use tracing::{info, warn};

pub const GLOBAL_COUNTER: &str = "global-counter";

/// Services of one cluster node
pub struct NodeRuntime {
    address: NodeAddress,
    system: ActorSystem,
    node: ClusterNode,
    listener: ActorRef<ListenerMsg>,
    resolver: Option<ActorRef<SbrMsg>>,
    counter: SingletonRef<SingletonCounterCommand, i64>,
    persistent_counter: EntityRef<PersistentCounter>,
    chat: ChatRoom,
    events: EventBus,
}

impl NodeRuntime {
    pub fn start(config: &NodeConfig, node: ClusterNode, persistence: Persistence) -> Result<Self> {
        let address = node.self_address();
        let system = ActorSystem::with_settings(
            &format!("{}-{}", config.system.name, address.port),
            SystemSettings::from(config),
        );

        let listener = spawn_cluster_listener(&system, &node).context("Failed to start cluster listener")?;
        let resolver = spawn_split_brain_resolver(&system, &node, &config.cluster.split_brain)
            .context("Failed to start split-brain resolver")?;

        let counter = ClusterSingleton::new(&system, &node, SingletonSettings::from_config(config))
            .init(GLOBAL_COUNTER, singleton_counter_props())
            .context("Failed to initialise global counter singleton")?;

        let relay_settings = RelaySettings::from_config(config);
        let chat = ChatRoom::start(&system, &node, relay_settings.clone()).context("Failed to start chat room")?;
        let events = EventBus::start(&system, &node, relay_settings).context("Failed to start event bus")?;

        let persistent_counter = spawn_persistent_counter(&system, &address.port.to_string(), persistence)
            .context("Failed to start persistent counter")?;

        info!(
            node = %address,
            system = system.name(),
            split_brain = resolver.is_some(),
            "Node started"
        );

        Ok(Self {
            address,
            system,
            node,
            listener,
            resolver,
            counter,
            persistent_counter,
            chat,
            events,
        })
    }

    /// Increment the global counter after `initial_delay`, then every `interval`
    pub fn start_ticker(&self, initial_delay: Duration, interval: Duration) -> Result<ActorRef<Tick>> {
        let counter = self.counter.clone();
        let props = self.system.default_props(move || Ticker {
            counter: counter.clone(),
            initial_delay,
            interval,
        });
        self.system.spawn("ticker", props).context("Failed to start ticker")
    }

    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn system(&self) -> &ActorSystem {
        &self.system
    }

    pub fn node(&self) -> &ClusterNode {
        &self.node
    }

    pub fn split_brain_resolver(&self) -> Option<&ActorRef<SbrMsg>> {
        self.resolver.as_ref()
    }

    pub fn counter(&self) -> &SingletonRef<SingletonCounterCommand, i64> {
        &self.counter
    }

    pub fn persistent_counter(&self) -> &EntityRef<PersistentCounter> {
        &self.persistent_counter
    }

    pub fn chat(&self) -> &ChatRoom {
        &self.chat
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub async fn members(&self) -> Result<Vec<cluster::Member>> {
        self.listener
            .ask(ListenerMsg::Members, self.system.ask_timeout())
            .await
            .context("Cluster listener did not answer")
    }

    pub async fn shutdown(&self) {
        info!(node = %self.address, "Shutting down node");
        self.counter.shutdown().await;
        self.chat.shutdown().await;
        self.events.shutdown().await;
        self.system.shutdown().await;
    }
}

#[derive(Debug, Clone)]
pub struct Tick;

struct Ticker {
    counter: SingletonRef<SingletonCounterCommand, i64>,
    initial_delay: Duration,
    interval: Duration,
}

#[async_trait]
impl ActorBehavior for Ticker {
    type Message = Tick;

    async fn on_start(&mut self, ctx: &mut ActorContext<Tick>) -> actors::Result<()> {
        ctx.start_timer("tick", self.initial_delay, self.interval, Tick);
        Ok(())
    }

    async fn handle(&mut self, ctx: &mut ActorContext<Tick>, _msg: Tick) -> actors::Result<Next<Tick>> {
        if let Err(e) = self.counter.tell(SingletonCounterCommand::Increment(1)) {
            warn!(actor = %ctx.path(), error = %e, "Tick not delivered to global counter");
        }
        Ok(Next::Same)
    }
}

/// Several nodes in one process over an [`InMemoryCluster`], sharing one journal
pub struct LocalCluster {
    cluster: InMemoryCluster,
    journal: Arc<InMemoryJournal>,
    snapshots: Arc<InMemorySnapshotStore>,
    nodes: Vec<NodeRuntime>,
}

impl LocalCluster {
    /// Nodes listen on consecutive ports starting at `cluster.port`
    pub fn start(config: &NodeConfig, size: usize) -> Result<Self> {
        anyhow::ensure!(size > 0, "A local cluster needs at least one node");
        config.validate().context("Invalid node configuration")?;

        let cluster = InMemoryCluster::new();
        let journal = Arc::new(InMemoryJournal::new());
        let snapshots = Arc::new(InMemorySnapshotStore::new());
        let persistence = Persistence::from_config(&config.persistence, journal.clone(), snapshots.clone());

        let mut members = Vec::with_capacity(size);
        for offset in 0..size {
            let port = u16::try_from(offset)
                .ok()
                .and_then(|offset| config.cluster.port.checked_add(offset))
                .context("Node port out of range")?;
            let address = NodeAddress::new(&config.cluster.hostname, port);
            let member = cluster
                .join_up(address.clone(), config.cluster.roles.clone())
                .with_context(|| format!("Failed to join {}", address))?;
            members.push(member);
        }

        let nodes = members
            .iter()
            .map(|member| NodeRuntime::start(config, member.cluster_node(), persistence.clone()))
            .collect::<Result<Vec<_>>>()?;

        info!(nodes = nodes.len(), "Local cluster started");
        Ok(Self {
            cluster,
            journal,
            snapshots,
            nodes,
        })
    }

    pub fn cluster(&self) -> &InMemoryCluster {
        &self.cluster
    }

    pub fn nodes(&self) -> &[NodeRuntime] {
        &self.nodes
    }

    pub fn journal(&self) -> &Arc<InMemoryJournal> {
        &self.journal
    }

    pub fn snapshots(&self) -> &Arc<InMemorySnapshotStore> {
        &self.snapshots
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
    }
}
