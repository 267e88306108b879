//! Topic Relay Actor
//!
//! One relay actor per named relay per node. It owns the local registry of
//! subscribers and the reconciled view, numbers local publishes, and
//! exchanges events with the relays of the same name on the other nodes.
//!
//! ```text
//!  publish(topic, e) ──► seq += 1 ──► view.apply ──► local sinks
//!                                   └─► frame ──► every other Up, reachable node
//!
//!  frame from node X ──► dedup(X, seq) ──► view.apply ──► local sinks   (never forwarded)
//! ```
//!
//! Frames sent before a peer's relay registered are lost, as are frames hit by
//! a transport failure. Each relay keeps its own recent events and advertises
//! its last sequence with its stats; a peer that is behind, or that sees a
//! gap, sends `Resync` and the origin replays what it still holds.

use crate::error::{RelayError, Result};
use crate::event::{
    ClusterStats, Delivery, NodeStats, RelayStats, SubscriberInfo, TopicEvent, TopicPayload,
};
use crate::registry::{DeliverySink, TopicRegistry};
use crate::sequence::{SequenceCheck, SequenceTracker};
use crate::view::ReconciledView;
use actors::{
    async_trait, respond, ActorBehavior, ActorContext, ActorError, ActorRef, ActorSystem, Next,
    Props, ReplyTo,
};
use cluster::{
    decode_frame, encode_frame, initial_view, membership_events, ClusterNode, MembershipEvent,
    MembershipView, NodeAddress,
};
use node_config::NodeConfig;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const HEARTBEAT_TIMER: &str = "relay-heartbeat";

#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// `None` disables heartbeats to local subscribers
    pub heartbeat_interval: Option<Duration>,
    /// Out-of-order sequence numbers remembered per origin
    pub dedup_window: usize,
    /// Own events kept for replay to peers
    pub replay_window: usize,
    pub ask_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Some(Duration::from_secs(30)),
            dedup_window: 1024,
            replay_window: 1024,
            ask_timeout: Duration::from_secs(3),
        }
    }
}

impl RelaySettings {
    pub fn from_config(config: &NodeConfig) -> Self {
        let relay = &config.relay;
        Self {
            heartbeat_interval: match relay.heartbeat_interval_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            dedup_window: relay.dedup_window,
            replay_window: relay.replay_window,
            ask_timeout: Duration::from_millis(config.system.ask_timeout_ms),
        }
    }
}

/// Transport channel shared by the relays named `name` on every node
pub fn relay_channel(name: &str) -> String {
    format!("topic-relay/{}", name)
}

/// `T` is the event; encoding borrows it, decoding owns it
#[derive(Serialize, Deserialize)]
enum Wire<T> {
    Event(T),
    Stats(NodeStats),
    /// Ask the receiver to replay its events of `incarnation` after `after`
    Resync { incarnation: Uuid, after: u64 },
}

/// Frame carrying `event`, as relays exchange it
pub fn event_frame<E: Serialize>(event: &TopicEvent<E>) -> Result<Vec<u8>> {
    Ok(encode_frame(&Wire::Event(event))?)
}

/// Counters that survive relay restarts
#[derive(Debug, Default)]
struct RelayCounters {
    published: AtomicU64,
    received: AtomicU64,
    duplicates: AtomicU64,
    gaps: AtomicU64,
    replayed: AtomicU64,
}

pub enum RelayMsg<E, S> {
    Subscribe {
        topic: String,
        subscriber_id: String,
        sink: DeliverySink<E>,
    },
    Unsubscribe {
        topic: String,
        subscriber_id: String,
    },
    Publish {
        topic: String,
        payload: E,
        reply_to: Option<ReplyTo<Result<String>>>,
    },
    Remote {
        from: NodeAddress,
        frame: Vec<u8>,
    },
    Membership(MembershipEvent),
    Heartbeat,
    GetSubscribers(ReplyTo<Vec<SubscriberInfo>>),
    GetStats(ReplyTo<RelayStats>),
    GetClusterStats(ReplyTo<ClusterStats>),
    GetView(ReplyTo<S>),
}

struct TopicRelay<E: TopicPayload, V: ReconciledView<E>> {
    name: String,
    channel: String,
    node: ClusterNode,
    self_address: NodeAddress,
    settings: RelaySettings,
    registry: Arc<TopicRegistry<E>>,
    counters: Arc<RelayCounters>,
    view: V,
    membership: MembershipView,
    tracker: SequenceTracker,
    incarnation: Uuid,
    last_sequence: u64,
    /// Own recent events, oldest first
    outbox: VecDeque<Arc<TopicEvent<E>>>,
    /// Highest sequence already requested per origin
    requested: HashMap<NodeAddress, (Uuid, u64)>,
    peer_subscribers: HashMap<NodeAddress, usize>,
    registered: bool,
}

impl<E: TopicPayload, V: ReconciledView<E>> TopicRelay<E, V> {
    fn new(
        name: String,
        node: ClusterNode,
        settings: RelaySettings,
        registry: Arc<TopicRegistry<E>>,
        counters: Arc<RelayCounters>,
        view: V,
    ) -> Self {
        let self_address = node.self_address();
        Self {
            channel: relay_channel(&name),
            membership: MembershipView::new(self_address.clone()),
            tracker: SequenceTracker::new(settings.dedup_window),
            name,
            node,
            self_address,
            settings,
            registry,
            counters,
            view,
            incarnation: Uuid::new_v4(),
            last_sequence: 0,
            outbox: VecDeque::new(),
            requested: HashMap::new(),
            peer_subscribers: HashMap::new(),
            registered: false,
        }
    }

    fn send_frame(&self, to: &NodeAddress, frame: Vec<u8>) {
        if let Err(e) = self.node.transport().send(to, &self.channel, frame) {
            warn!(relay = %self.name, to = %to, error = %e, "Failed to send relay frame");
        }
    }

    fn broadcast_frame(&self, frame: &[u8]) -> usize {
        let peers = self.membership.reachable_up_except_self();
        for peer in &peers {
            self.send_frame(peer, frame.to_vec());
        }
        peers.len()
    }

    fn node_stats(&self) -> NodeStats {
        NodeStats {
            node: self.self_address.clone(),
            subscribers: self.registry.subscriber_count(),
            incarnation: self.incarnation,
            last_sequence: self.last_sequence,
        }
    }

    /// Advertise the local subscriber count to one peer, or to all of them
    fn advertise_stats(&self, to: Option<&NodeAddress>) {
        let frame = match encode_frame(&Wire::<()>::Stats(self.node_stats())) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(relay = %self.name, error = %e, "Failed to encode node stats");
                return;
            }
        };
        match to {
            Some(peer) => self.send_frame(peer, frame),
            None => {
                self.broadcast_frame(&frame);
            }
        }
    }

    fn publish(&mut self, topic: String, payload: E) -> Result<String> {
        if let Err(reason) = self.view.admit(&payload, &self.self_address) {
            debug!(relay = %self.name, topic = %topic, reason = %reason, "Publish rejected by view");
            return Err(RelayError::rejected(reason));
        }

        let event = TopicEvent {
            topic,
            origin: self.self_address.clone(),
            incarnation: self.incarnation,
            sequence: self.last_sequence + 1,
            payload,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        };
        let frame = event_frame(&event)?;
        self.last_sequence = event.sequence;

        let event_id = event.event_id();
        self.view.apply(&event);
        let topic = event.topic.clone();
        let event = Arc::new(event);
        let delivered = self.registry.deliver(&topic, &Delivery::Event(Arc::clone(&event)));
        self.remember(event);
        let peers = self.broadcast_frame(&frame);
        self.counters.published.fetch_add(1, Ordering::Relaxed);

        debug!(
            relay = %self.name,
            topic = %topic,
            event_id = %event_id,
            local_deliveries = delivered,
            peers,
            "Published topic event"
        );
        Ok(event_id)
    }

    fn remember(&mut self, event: Arc<TopicEvent<E>>) {
        if self.settings.replay_window == 0 {
            return;
        }
        if self.outbox.len() >= self.settings.replay_window {
            self.outbox.pop_front();
        }
        self.outbox.push_back(event);
    }

    /// Ask `origin` for everything after our contiguous mark, once per target
    fn request_missing(&mut self, origin: &NodeAddress, incarnation: Uuid, up_to: u64) {
        let after = self.tracker.resume_point(origin, incarnation);
        if up_to <= after {
            return;
        }
        if let Some((asked_incarnation, asked)) = self.requested.get(origin) {
            if *asked_incarnation == incarnation && *asked >= up_to {
                return;
            }
        }
        let frame = match encode_frame(&Wire::<()>::Resync { incarnation, after }) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(relay = %self.name, error = %e, "Failed to encode resync request");
                return;
            }
        };
        debug!(relay = %self.name, origin = %origin, after, up_to, "Requesting replay");
        self.requested.insert(origin.clone(), (incarnation, up_to));
        self.send_frame(origin, frame);
    }

    fn replay_to(&self, peer: &NodeAddress, incarnation: Uuid, after: u64) {
        let after = if incarnation == self.incarnation { after } else { 0 };
        if let Some(oldest) = self.outbox.front() {
            if oldest.sequence > after + 1 {
                warn!(
                    relay = %self.name,
                    peer = %peer,
                    after,
                    oldest = oldest.sequence,
                    "Replay window exceeded, peer misses older events"
                );
            }
        }
        let mut replayed = 0u64;
        for event in self.outbox.iter().filter(|event| event.sequence > after) {
            match event_frame(event.as_ref()) {
                Ok(frame) => {
                    self.send_frame(peer, frame);
                    replayed += 1;
                }
                Err(e) => warn!(relay = %self.name, error = %e, "Failed to encode replayed event"),
            }
        }
        self.counters.replayed.fetch_add(replayed, Ordering::Relaxed);
        debug!(relay = %self.name, peer = %peer, after, replayed, "Replayed own events");
    }

    fn on_remote(&mut self, from: NodeAddress, frame: &[u8]) {
        let wire: Wire<TopicEvent<E>> = match decode_frame(frame) {
            Ok(wire) => wire,
            Err(e) => {
                warn!(relay = %self.name, from = %from, error = %e, "Dropping undecodable relay frame");
                return;
            }
        };
        match wire {
            Wire::Event(event) => self.on_remote_event(event),
            Wire::Stats(stats) => {
                if stats.node == self.self_address {
                    return;
                }
                let first_contact = self
                    .peer_subscribers
                    .insert(stats.node.clone(), stats.subscribers)
                    .is_none();
                debug!(
                    relay = %self.name,
                    node = %stats.node,
                    subscribers = stats.subscribers,
                    last_sequence = stats.last_sequence,
                    "Node stats received"
                );
                if first_contact {
                    self.advertise_stats(Some(&stats.node));
                }
                self.request_missing(&stats.node, stats.incarnation, stats.last_sequence);
            }
            Wire::Resync { incarnation, after } => self.replay_to(&from, incarnation, after),
        }
    }

    fn on_remote_event(&mut self, event: TopicEvent<E>) {
        match self
            .tracker
            .observe(&event.origin, event.incarnation, event.sequence)
        {
            SequenceCheck::Duplicate => {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                let error = RelayError::duplicate(event.event_id());
                debug!(relay = %self.name, error = %error, "Ignoring redelivered event");
                return;
            }
            SequenceCheck::Gap { expected, received } => {
                self.counters.gaps.fetch_add(1, Ordering::Relaxed);
                warn!(
                    relay = %self.name,
                    origin = %event.origin,
                    expected,
                    received,
                    "Sequence gap from origin"
                );
                self.request_missing(&event.origin, event.incarnation, received);
            }
            SequenceCheck::Fresh => {}
        }

        let changed = self.view.apply(&event);
        let topic = event.topic.clone();
        let event_id = event.event_id();
        let delivered = self.registry.deliver(&topic, &Delivery::Event(Arc::new(event)));
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        debug!(
            relay = %self.name,
            topic = %topic,
            event_id = %event_id,
            view_changed = changed,
            local_deliveries = delivered,
            "Remote topic event applied"
        );
    }

    fn on_membership(&mut self, event: MembershipEvent) {
        if !self.membership.apply(&event) {
            return;
        }
        match &event {
            MembershipEvent::MemberUp(member) if member.address != self.self_address => {
                self.advertise_stats(Some(&member.address));
            }
            MembershipEvent::MemberDowned(member) | MembershipEvent::MemberRemoved(member) => {
                self.peer_subscribers.remove(&member.address);
                self.requested.remove(&member.address);
                if matches!(event, MembershipEvent::MemberRemoved(_)) {
                    self.tracker.forget(&member.address);
                }
                if self.view.on_member_removed(&member.address) {
                    info!(relay = %self.name, node = %member.address, "Dropped view entries of departed node");
                }
            }
            _ => {}
        }
    }

    fn schedule_heartbeat(&self, ctx: &mut ActorContext<RelayMsg<E, V::Snapshot>>) {
        if let Some(interval) = self.settings.heartbeat_interval {
            ctx.start_single_timer(HEARTBEAT_TIMER, interval, RelayMsg::Heartbeat);
        }
    }

    fn stats(&self) -> RelayStats {
        RelayStats {
            node: self.self_address.clone(),
            local_subscribers: self.registry.subscriber_count(),
            topics: self.registry.topic_count(),
            published: self.counters.published.load(Ordering::Relaxed),
            received: self.counters.received.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            gaps: self.counters.gaps.load(Ordering::Relaxed),
            replayed: self.counters.replayed.load(Ordering::Relaxed),
        }
    }

    fn cluster_stats(&self) -> ClusterStats {
        let local = self.registry.subscriber_count();
        let live_peers: Vec<usize> = self
            .peer_subscribers
            .iter()
            .filter(|(node, _)| {
                self.membership
                    .status_of(node)
                    .map(|status| !status.is_terminal())
                    .unwrap_or(false)
            })
            .map(|(_, count)| *count)
            .collect();
        ClusterStats {
            node: self.self_address.clone(),
            local_subscribers: local,
            total_subscribers: local + live_peers.iter().sum::<usize>(),
            nodes: live_peers.len() + 1,
        }
    }
}

#[async_trait]
impl<E: TopicPayload, V: ReconciledView<E>> ActorBehavior for TopicRelay<E, V> {
    type Message = RelayMsg<E, V::Snapshot>;

    async fn on_start(&mut self, ctx: &mut ActorContext<Self::Message>) -> actors::Result<()> {
        let (view, receiver) = initial_view(self.node.oracle().as_ref()).await;
        self.membership = view;
        ctx.forward_stream(membership_events(receiver), RelayMsg::Membership);

        let target = ctx.self_ref().clone();
        self.node
            .transport()
            .register(
                &self.channel,
                Arc::new(move |from, frame| {
                    let _ = target.tell(RelayMsg::Remote { from, frame });
                }),
            )
            .map_err(ActorError::handler)?;
        self.registered = true;

        self.schedule_heartbeat(ctx);
        self.advertise_stats(None);
        info!(
            relay = %self.name,
            node = %self.self_address,
            incarnation = %self.incarnation,
            local_subscribers = self.registry.subscriber_count(),
            "Topic relay started"
        );
        Ok(())
    }

    async fn handle(
        &mut self,
        ctx: &mut ActorContext<Self::Message>,
        msg: Self::Message,
    ) -> actors::Result<Next<Self::Message>> {
        match msg {
            RelayMsg::Subscribe {
                topic,
                subscriber_id,
                sink,
            } => {
                if self.registry.subscribe(&topic, &subscriber_id, sink) {
                    debug!(relay = %self.name, subscriber = %subscriber_id, "Replaced existing subscription");
                }
                let connected = Delivery::connected(&subscriber_id, &topic, &self.self_address);
                self.registry.send_to(&topic, &subscriber_id, connected);
                info!(
                    relay = %self.name,
                    subscriber = %subscriber_id,
                    topic = %topic,
                    local_subscribers = self.registry.subscriber_count(),
                    "Subscriber added"
                );
                self.advertise_stats(None);
            }
            RelayMsg::Unsubscribe {
                topic,
                subscriber_id,
            } => {
                if self.registry.unsubscribe(&topic, &subscriber_id) {
                    info!(
                        relay = %self.name,
                        subscriber = %subscriber_id,
                        topic = %topic,
                        local_subscribers = self.registry.subscriber_count(),
                        "Subscriber removed"
                    );
                    self.advertise_stats(None);
                }
            }
            RelayMsg::Publish {
                topic,
                payload,
                reply_to,
            } => {
                let outcome = self.publish(topic, payload);
                if let Err(e) = &outcome {
                    if reply_to.is_none() {
                        warn!(relay = %self.name, error = %e, "Fire-and-forget publish failed");
                    }
                }
                respond(reply_to, outcome);
            }
            RelayMsg::Remote { from, frame } => self.on_remote(from, &frame),
            RelayMsg::Membership(event) => self.on_membership(event),
            RelayMsg::Heartbeat => {
                let heartbeat = Delivery::Heartbeat {
                    node: self.self_address.clone(),
                    timestamp_ms: chrono::Utc::now().timestamp_millis(),
                };
                let reached = self.registry.broadcast(&heartbeat);
                debug!(relay = %self.name, reached, "Heartbeat delivered");
                // periodic stats let peers notice a lost trailing event
                self.requested.clear();
                self.advertise_stats(None);
                self.schedule_heartbeat(ctx);
            }
            RelayMsg::GetSubscribers(reply_to) => {
                let subscribers = self
                    .registry
                    .subscribers()
                    .into_iter()
                    .map(|(topic, id)| SubscriberInfo {
                        id,
                        topic,
                        node: self.self_address.clone(),
                    })
                    .collect();
                reply_to.send(subscribers);
            }
            RelayMsg::GetStats(reply_to) => {
                reply_to.send(self.stats());
            }
            RelayMsg::GetClusterStats(reply_to) => {
                reply_to.send(self.cluster_stats());
            }
            RelayMsg::GetView(reply_to) => {
                reply_to.send(self.view.snapshot());
            }
        }
        Ok(Next::Same)
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext<Self::Message>) {
        if self.registered {
            self.node.transport().unregister(&self.channel);
            self.registered = false;
        }
        info!(relay = %self.name, node = %self.self_address, "Topic relay stopped");
    }
}

/// Handle to the relay on this node
pub struct TopicRelayHandle<E: TopicPayload, S: Send + 'static> {
    name: String,
    relay: ActorRef<RelayMsg<E, S>>,
    registry: Arc<TopicRegistry<E>>,
    timeout: Duration,
}

impl<E: TopicPayload, S: Send + 'static> TopicRelayHandle<E, S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a subscriber and return the receiving end of its sink.
    /// The first delivery is always `Connected`.
    pub fn subscribe(
        &self,
        topic: &str,
        subscriber_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<Delivery<E>>> {
        let (sink, receiver) = mpsc::unbounded_channel();
        self.subscribe_with(topic, subscriber_id, sink)?;
        Ok(receiver)
    }

    pub fn subscribe_with(&self, topic: &str, subscriber_id: &str, sink: DeliverySink<E>) -> Result<()> {
        Ok(self.relay.tell(RelayMsg::Subscribe {
            topic: topic.to_string(),
            subscriber_id: subscriber_id.to_string(),
            sink,
        })?)
    }

    pub fn unsubscribe(&self, topic: &str, subscriber_id: &str) -> Result<()> {
        Ok(self.relay.tell(RelayMsg::Unsubscribe {
            topic: topic.to_string(),
            subscriber_id: subscriber_id.to_string(),
        })?)
    }

    /// Fire-and-forget publish
    pub fn publish(&self, topic: &str, payload: E) -> Result<()> {
        Ok(self.relay.tell(RelayMsg::Publish {
            topic: topic.to_string(),
            payload,
            reply_to: None,
        })?)
    }

    /// Publish and wait until the event is sequenced; returns its event id
    pub async fn publish_checked(&self, topic: &str, payload: E) -> Result<String> {
        let topic = topic.to_string();
        self.relay
            .ask(
                |reply_to| RelayMsg::Publish {
                    topic,
                    payload,
                    reply_to: Some(reply_to),
                },
                self.timeout,
            )
            .await?
    }

    pub async fn subscribers(&self) -> Result<Vec<SubscriberInfo>> {
        Ok(self.relay.ask(RelayMsg::GetSubscribers, self.timeout).await?)
    }

    pub async fn stats(&self) -> Result<RelayStats> {
        Ok(self.relay.ask(RelayMsg::GetStats, self.timeout).await?)
    }

    pub async fn cluster_stats(&self) -> Result<ClusterStats> {
        Ok(self.relay.ask(RelayMsg::GetClusterStats, self.timeout).await?)
    }

    /// Snapshot of the reconciled view
    pub async fn view(&self) -> Result<S> {
        Ok(self.relay.ask(RelayMsg::GetView, self.timeout).await?)
    }

    /// Read without a round trip through the relay mailbox
    pub fn local_subscriber_count(&self) -> usize {
        self.registry.subscriber_count()
    }

    pub async fn shutdown(&self) {
        self.relay.stop();
        self.relay.stopped().await;
    }
}

impl<E: TopicPayload, S: Send + 'static> Clone for TopicRelayHandle<E, S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            relay: self.relay.clone(),
            registry: Arc::clone(&self.registry),
            timeout: self.timeout,
        }
    }
}

impl<E: TopicPayload, S: Send + 'static> fmt::Debug for TopicRelayHandle<E, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicRelayHandle")
            .field("name", &self.name)
            .field("relay", &self.relay.path())
            .finish()
    }
}

/// Start the relay `/user/topic-relay-{name}`. `view_factory` builds the
/// reconciled view, again after every restart.
pub fn spawn_topic_relay<E, V, F>(
    system: &ActorSystem,
    node: &ClusterNode,
    name: &str,
    settings: RelaySettings,
    view_factory: F,
) -> Result<TopicRelayHandle<E, V::Snapshot>>
where
    E: TopicPayload,
    V: ReconciledView<E>,
    F: Fn() -> V + Send + Sync + 'static,
{
    let registry = Arc::new(TopicRegistry::new());
    let counters = Arc::new(RelayCounters::default());
    let timeout = settings.ask_timeout;

    let props = {
        let name = name.to_string();
        let node = node.clone();
        let registry = Arc::clone(&registry);
        Props::new(move || {
            TopicRelay::new(
                name.clone(),
                node.clone(),
                settings.clone(),
                Arc::clone(&registry),
                Arc::clone(&counters),
                view_factory(),
            )
        })
    };
    let relay = system.spawn(&format!("topic-relay-{}", name), props)?;

    Ok(TopicRelayHandle {
        name: name.to_string(),
        relay,
        registry,
        timeout,
    })
}
