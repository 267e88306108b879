//! Cluster Singleton
//!
//! Keeps at most one live instance of a named actor across the cluster. Every
//! node runs a manager for the singleton; the manager on the oldest Up member
//! (optionally restricted to a role) hosts the instance, the others route to it.
//!
//! Takeover is safety first: a node starts the instance only when every older
//! member has announced `HandOverDone` or has been observed Down/Removed. An
//! unreachable holder is therefore never replaced until it is downed.
//!
//! ```text
//!  node A (oldest)                     node B
//!  ┌─────────────────────┐            ┌─────────────────────┐
//!  │ singleton-counter    │ LeaseGranted│ singleton-counter   │
//!  │   └── counter-1  ◄───┼────────────┤  tell/ask ──► frame  │
//!  └─────────────────────┘  Request   └─────────────────────┘
//!      MemberLeft(A): stop counter-1 ──► HandOverDone ──► B starts counter-2
//! ```

use crate::error::{spawn_error, ClusterError, Result};
use crate::member::{MemberStatus, MembershipEvent, NodeAddress};
use crate::membership::{initial_view, membership_events, MembershipView};
use crate::node::ClusterNode;
use crate::transport::{decode_frame, encode_frame, WireMessage};
use actors::{
    async_trait, ActorBehavior, ActorContext, ActorError, ActorRef, ActorSystem, CorrelationId,
    Next, Props, ReplyTo, Request, SupervisorDirective,
};
use node_config::{NodeConfig, SingletonConfig};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const RETRY_TIMER: &str = "retry-activation";

#[derive(Debug, Clone)]
pub struct SingletonSettings {
    /// Commands kept while no holder is known; the oldest is dropped when full
    pub buffer_size: usize,
    pub role: Option<String>,
    /// Extra wait after observing the previous holder Down before taking over
    pub down_removal_margin: Duration,
    pub ask_timeout: Duration,
}

impl Default for SingletonSettings {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            role: None,
            down_removal_margin: Duration::from_millis(
                SingletonConfig::default().down_removal_margin_ms,
            ),
            ask_timeout: Duration::from_secs(3),
        }
    }
}

impl SingletonSettings {
    pub fn from_config(config: &NodeConfig) -> Self {
        let singleton = &config.cluster.singleton;
        Self {
            buffer_size: singleton.buffer_size,
            role: singleton.role.clone(),
            down_removal_margin: Duration::from_millis(config.singleton_takeover_margin_ms()),
            ask_timeout: Duration::from_millis(config.system.ask_timeout_ms),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_down_removal_margin(mut self, margin: Duration) -> Self {
        self.down_removal_margin = margin;
        self
    }
}

/// Who hosts the singleton, as known by this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingletonLease {
    pub singleton_name: String,
    pub holder: NodeAddress,
    pub generation: u64,
}

/// Local lifecycle notifications of the instance hosted on this node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SingletonEvent {
    Activated {
        singleton: String,
        node: NodeAddress,
        generation: u64,
    },
    Deactivated {
        singleton: String,
        node: NodeAddress,
        generation: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingletonState {
    pub lease: Option<SingletonLease>,
    pub local_instance: bool,
    pub handing_over: bool,
    pub buffered: usize,
    pub dropped: u64,
}

type SingletonReply<R> = std::result::Result<R, ClusterError>;

/// Frames exchanged between the managers of one singleton
#[derive(Serialize, Deserialize)]
enum Wire<C, R> {
    Request {
        correlation: CorrelationId,
        expects_reply: bool,
        command: C,
    },
    Reply {
        correlation: CorrelationId,
        reply: R,
    },
    Rejected {
        correlation: CorrelationId,
        reason: String,
    },
    LeaseGranted {
        generation: u64,
    },
    HandOverDone {
        generation: u64,
    },
    LeaseQuery,
}

enum ManagerMsg<C, R> {
    Membership(MembershipEvent),
    Deliver {
        command: C,
        reply_to: Option<ReplyTo<SingletonReply<R>>>,
    },
    Inbound {
        from: NodeAddress,
        frame: Vec<u8>,
    },
    InstanceStopped {
        generation: u64,
    },
    RetryActivation,
    GetState(ReplyTo<SingletonState>),
}

struct ActiveInstance<C: Send + 'static, R: Send + 'static> {
    generation: u64,
    actor: ActorRef<Request<C, R>>,
}

struct PendingAsk<R> {
    target: NodeAddress,
    reply_to: ReplyTo<SingletonReply<R>>,
}

struct SingletonManager<C: WireMessage, R: WireMessage> {
    name: String,
    channel: String,
    self_address: NodeAddress,
    node: ClusterNode,
    settings: SingletonSettings,
    props: Props<Request<C, R>>,
    events: broadcast::Sender<SingletonEvent>,
    /// Highest generation seen; survives manager restarts
    generations: Arc<AtomicU64>,
    view: MembershipView,
    lease: Option<SingletonLease>,
    instance: Option<ActiveInstance<C, R>>,
    handing_over: bool,
    exiting: bool,
    handed_over: BTreeSet<NodeAddress>,
    downed_at: HashMap<NodeAddress, Instant>,
    buffer: VecDeque<C>,
    dropped: u64,
    pending: HashMap<CorrelationId, PendingAsk<R>>,
    registered: bool,
}

impl<C: WireMessage, R: WireMessage> SingletonManager<C, R> {
    fn new(
        name: String,
        node: ClusterNode,
        settings: SingletonSettings,
        props: Props<Request<C, R>>,
        events: broadcast::Sender<SingletonEvent>,
        generations: Arc<AtomicU64>,
    ) -> Self {
        let self_address = node.self_address();
        Self {
            channel: format!("singleton/{}", name),
            view: MembershipView::new(self_address.clone()),
            name,
            self_address,
            node,
            settings,
            props,
            events,
            generations,
            lease: None,
            instance: None,
            handing_over: false,
            exiting: false,
            handed_over: BTreeSet::new(),
            downed_at: HashMap::new(),
            buffer: VecDeque::new(),
            dropped: 0,
            pending: HashMap::new(),
            registered: false,
        }
    }

    fn observed_generation(&self) -> u64 {
        self.generations.load(Ordering::SeqCst)
    }

    fn observe_generation(&self, generation: u64) {
        self.generations.fetch_max(generation, Ordering::SeqCst);
    }

    fn active_instance(&self) -> Option<&ActorRef<Request<C, R>>> {
        match &self.instance {
            Some(active) if !self.handing_over => Some(&active.actor),
            _ => None,
        }
    }

    fn remote_holder(&self) -> Option<NodeAddress> {
        self.lease
            .as_ref()
            .filter(|lease| lease.holder != self.self_address)
            .map(|lease| lease.holder.clone())
    }

    fn state(&self) -> SingletonState {
        SingletonState {
            lease: self.lease.clone(),
            local_instance: self.instance.is_some(),
            handing_over: self.handing_over,
            buffered: self.buffer.len(),
            dropped: self.dropped,
        }
    }

    fn send_wire(&self, to: &NodeAddress, wire: &Wire<C, R>) -> Result<()> {
        let frame = encode_frame(wire)?;
        self.node.transport().send(to, &self.channel, frame)
    }

    fn broadcast(&self, wire: &Wire<C, R>) {
        let frame = match encode_frame(wire) {
            Ok(frame) => frame,
            Err(e) => {
                error!(singleton = %self.name, error = %e, "Failed to encode singleton frame");
                return;
            }
        };
        for peer in self.view.peers() {
            if let Err(e) = self.node.transport().send(&peer, &self.channel, frame.clone()) {
                debug!(singleton = %self.name, peer = %peer, error = %e, "Broadcast frame not sent");
            }
        }
    }

    /// Route one command to wherever the instance lives
    fn deliver(&mut self, command: C, reply_to: Option<ReplyTo<SingletonReply<R>>>) {
        if let Some(instance) = self.active_instance() {
            let reply_to = reply_to.map(|reply_to| reply_to.map(Ok::<R, ClusterError>));
            if let Err(e) = instance.tell(Request { command, reply_to }) {
                warn!(singleton = %self.name, error = %e, "Local singleton instance refused command");
            }
            return;
        }

        match (self.remote_holder(), reply_to) {
            (Some(holder), reply_to) => self.send_remote(holder, command, reply_to),
            (None, Some(reply_to)) => {
                debug!(singleton = %self.name, "Ask while no holder is known");
                reply_to.send(Err(ClusterError::handover_in_progress(&self.name)));
            }
            (None, None) => self.buffer_command(command),
        }
    }

    fn send_remote(
        &mut self,
        holder: NodeAddress,
        command: C,
        reply_to: Option<ReplyTo<SingletonReply<R>>>,
    ) {
        let correlation = reply_to
            .as_ref()
            .map(|reply_to| reply_to.correlation_id())
            .unwrap_or_default();
        let wire = Wire::Request {
            correlation,
            expects_reply: reply_to.is_some(),
            command,
        };
        match self.send_wire(&holder, &wire) {
            Ok(()) => {
                if let Some(reply_to) = reply_to {
                    self.pending.retain(|_, pending| !pending.reply_to.is_closed());
                    self.pending.insert(
                        correlation,
                        PendingAsk {
                            target: holder,
                            reply_to,
                        },
                    );
                }
            }
            Err(e) => {
                warn!(singleton = %self.name, holder = %holder, error = %e, "Failed to route to singleton holder");
                if let Some(reply_to) = reply_to {
                    reply_to.send(Err(e));
                }
            }
        }
    }

    fn buffer_command(&mut self, command: C) {
        if self.buffer.len() >= self.settings.buffer_size.max(1) {
            self.buffer.pop_front();
            self.dropped += 1;
            warn!(
                singleton = %self.name,
                buffer_size = self.settings.buffer_size,
                dropped = self.dropped,
                "Singleton buffer full, dropping oldest command"
            );
        }
        self.buffer.push_back(command);
        debug!(singleton = %self.name, buffered = self.buffer.len(), "Command buffered until a holder is known");
    }

    fn flush_buffer(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let buffered = std::mem::take(&mut self.buffer);
        info!(singleton = %self.name, count = buffered.len(), "Flushing buffered singleton commands");
        for command in buffered {
            self.deliver(command, None);
        }
    }

    fn fail_pending_for(&mut self, target: &NodeAddress) {
        let failed: Vec<CorrelationId> = self
            .pending
            .iter()
            .filter(|(_, pending)| &pending.target == target)
            .map(|(id, _)| *id)
            .collect();
        for id in failed {
            if let Some(pending) = self.pending.remove(&id) {
                pending
                    .reply_to
                    .send(Err(ClusterError::handover_in_progress(&self.name)));
            }
        }
    }

    /// Reply address that ships the reply back to the asking node
    fn remote_reply(&self, to: NodeAddress, correlation: CorrelationId) -> ReplyTo<R> {
        let transport = Arc::clone(self.node.transport());
        let channel = self.channel.clone();
        ReplyTo::forward(correlation, move |reply: R| {
            let sent = encode_frame(&Wire::<C, R>::Reply { correlation, reply })
                .and_then(|frame| transport.send(&to, &channel, frame));
            if let Err(e) = sent {
                warn!(channel = %channel, to = %to, error = %e, "Singleton reply not delivered");
            }
        })
    }

    fn on_inbound(&mut self, ctx: &mut ActorContext<ManagerMsg<C, R>>, from: NodeAddress, frame: Vec<u8>) {
        let wire: Wire<C, R> = match decode_frame(&frame) {
            Ok(wire) => wire,
            Err(e) => {
                warn!(singleton = %self.name, from = %from, error = %e, "Undecodable singleton frame");
                return;
            }
        };

        match wire {
            Wire::Request {
                correlation,
                expects_reply,
                command,
            } => self.on_remote_request(from, correlation, expects_reply, command),
            Wire::Reply { correlation, reply } => {
                if let Some(pending) = self.pending.remove(&correlation) {
                    pending.reply_to.send(Ok(reply));
                }
            }
            Wire::Rejected { correlation, reason } => {
                if let Some(pending) = self.pending.remove(&correlation) {
                    debug!(singleton = %self.name, from = %from, reason = %reason, "Remote manager rejected request");
                    pending
                        .reply_to
                        .send(Err(ClusterError::handover_in_progress(&self.name)));
                }
            }
            Wire::LeaseGranted { generation } => self.on_lease_granted(from, generation),
            Wire::HandOverDone { generation } => {
                info!(singleton = %self.name, from = %from, generation, "Previous holder handed over");
                self.observe_generation(generation);
                self.handed_over.insert(from.clone());
                if self.remote_holder().as_ref() == Some(&from) {
                    self.lease = None;
                }
                self.fail_pending_for(&from);
                self.try_activate(ctx);
            }
            Wire::LeaseQuery => {
                if self.active_instance().is_some() {
                    let wire = Wire::LeaseGranted {
                        generation: self.observed_generation(),
                    };
                    if let Err(e) = self.send_wire(&from, &wire) {
                        debug!(singleton = %self.name, to = %from, error = %e, "Lease answer not sent");
                    }
                }
            }
        }
    }

    fn on_remote_request(
        &mut self,
        from: NodeAddress,
        correlation: CorrelationId,
        expects_reply: bool,
        command: C,
    ) {
        if let Some(instance) = self.active_instance() {
            let reply_to = expects_reply.then(|| self.remote_reply(from.clone(), correlation));
            if let Err(e) = instance.tell(Request { command, reply_to }) {
                warn!(singleton = %self.name, error = %e, "Local singleton instance refused remote command");
            }
        } else if expects_reply {
            let wire = Wire::Rejected {
                correlation,
                reason: format!("{} does not host the singleton", self.self_address),
            };
            if let Err(e) = self.send_wire(&from, &wire) {
                debug!(singleton = %self.name, to = %from, error = %e, "Rejection not sent");
            }
        } else if self.remote_holder().as_ref() == Some(&from) {
            // the sender believes we hold it and we believe it does
            self.buffer_command(command);
        } else {
            self.deliver(command, None);
        }
    }

    fn on_lease_granted(&mut self, from: NodeAddress, generation: u64) {
        if generation < self.observed_generation() {
            debug!(singleton = %self.name, from = %from, generation, "Ignoring stale lease");
            return;
        }
        if self.active_instance().is_some() && from != self.self_address {
            warn!(
                singleton = %self.name,
                other = %from,
                generation,
                "Newer lease granted elsewhere, handing over local instance"
            );
            self.stop_instance();
        }
        self.observe_generation(generation);
        debug!(singleton = %self.name, holder = %from, generation, "Lease observed");
        self.lease = Some(SingletonLease {
            singleton_name: self.name.clone(),
            holder: from,
            generation,
        });
        self.flush_buffer();
    }

    fn on_membership(&mut self, ctx: &mut ActorContext<ManagerMsg<C, R>>, event: MembershipEvent) {
        if !self.view.apply(&event) {
            return;
        }
        let address = event.member().address.clone();
        let is_self = address == self.self_address;

        match &event {
            MembershipEvent::MemberUp(_) if !is_self => {
                if self.active_instance().is_some() {
                    let wire = Wire::LeaseGranted {
                        generation: self.observed_generation(),
                    };
                    if let Err(e) = self.send_wire(&address, &wire) {
                        debug!(singleton = %self.name, to = %address, error = %e, "Lease not sent to new member");
                    }
                }
            }
            MembershipEvent::MemberLeft(_)
            | MembershipEvent::MemberDowned(_)
            | MembershipEvent::MemberRemoved(_)
                if is_self =>
            {
                info!(singleton = %self.name, event = event.kind(), "This node is exiting, handing over singleton");
                self.exiting = true;
                self.stop_instance();
            }
            MembershipEvent::MemberDowned(_) | MembershipEvent::MemberRemoved(_) => {
                self.downed_at.entry(address.clone()).or_insert_with(Instant::now);
                if self.remote_holder().as_ref() == Some(&address) {
                    info!(singleton = %self.name, holder = %address, "Singleton holder is gone");
                    self.lease = None;
                }
                self.fail_pending_for(&address);
            }
            _ => {}
        }
        self.try_activate(ctx);
    }

    /// Time still to wait after observing `address` Down, if any
    fn margin_remaining(&self, address: &NodeAddress) -> Option<Duration> {
        let margin = self.settings.down_removal_margin;
        if margin.is_zero() {
            return None;
        }
        let elapsed = self.downed_at.get(address)?.elapsed();
        margin.checked_sub(elapsed).filter(|d| !d.is_zero())
    }

    fn try_activate(&mut self, ctx: &mut ActorContext<ManagerMsg<C, R>>) {
        if self.exiting || self.instance.is_some() {
            return;
        }
        let role = self.settings.role.as_deref();
        let Some(me) = self.view.oldest_up(role).cloned() else {
            return;
        };
        if me.address != self.self_address {
            return;
        }

        let mut wait = Duration::ZERO;
        for member in self.view.members() {
            if member.address == self.self_address
                || member.up_number == 0
                || !member.has_role(role)
                || !member.is_older_than(&me)
            {
                continue;
            }
            match member.status {
                MemberStatus::Up | MemberStatus::Leaving => {
                    if !self.handed_over.contains(&member.address) {
                        debug!(
                            singleton = %self.name,
                            older = %member.address,
                            "Waiting for older member to hand over"
                        );
                        return;
                    }
                }
                MemberStatus::Down | MemberStatus::Removed
                    if !self.handed_over.contains(&member.address) =>
                {
                    if let Some(remaining) = self.margin_remaining(&member.address) {
                        wait = wait.max(remaining);
                    }
                }
                MemberStatus::Down | MemberStatus::Removed | MemberStatus::Joining => {}
            }
        }

        if let Some(holder) = self.remote_holder() {
            let gone = self
                .view
                .status_of(&holder)
                .map(|status| status.is_terminal())
                .unwrap_or(false);
            let handed_over = self.handed_over.contains(&holder);
            if !gone && !handed_over {
                debug!(singleton = %self.name, holder = %holder, "Previous holder still active");
                return;
            }
            if !handed_over {
                if let Some(remaining) = self.margin_remaining(&holder) {
                    wait = wait.max(remaining);
                }
            }
        }

        if !wait.is_zero() {
            debug!(singleton = %self.name, wait_ms = wait.as_millis() as u64, "Takeover delayed by down-removal margin");
            ctx.start_single_timer(RETRY_TIMER, wait, ManagerMsg::RetryActivation);
            return;
        }
        self.activate(ctx);
    }

    fn activate(&mut self, ctx: &mut ActorContext<ManagerMsg<C, R>>) {
        let generation = self.observed_generation() + 1;
        let child_name = format!("{}-{}", self.name, generation);
        let actor = match ctx.spawn(&child_name, self.props.clone()) {
            Ok(actor) => actor,
            Err(e) => {
                error!(singleton = %self.name, generation, error = %e, "Failed to start singleton instance");
                return;
            }
        };
        self.observe_generation(generation);

        let watched = actor.clone();
        ctx.forward_stream(
            futures::stream::once(async move {
                watched.stopped().await;
                generation
            }),
            |generation| ManagerMsg::InstanceStopped { generation },
        );

        self.instance = Some(ActiveInstance { generation, actor });
        self.lease = Some(SingletonLease {
            singleton_name: self.name.clone(),
            holder: self.self_address.clone(),
            generation,
        });
        info!(
            singleton = %self.name,
            node = %self.self_address,
            generation,
            "Singleton activated"
        );
        let _ = self.events.send(SingletonEvent::Activated {
            singleton: self.name.clone(),
            node: self.self_address.clone(),
            generation,
        });

        self.broadcast(&Wire::LeaseGranted { generation });
        let stale: Vec<NodeAddress> = self.pending.values().map(|p| p.target.clone()).collect();
        for target in stale {
            self.fail_pending_for(&target);
        }
        self.flush_buffer();
    }

    /// Stop the local instance; `HandOverDone` follows once it has stopped
    fn stop_instance(&mut self) {
        match &self.instance {
            Some(active) if !self.handing_over => {
                info!(singleton = %self.name, generation = active.generation, "Stopping singleton instance for handover");
                self.handing_over = true;
                active.actor.stop();
            }
            Some(_) => {}
            None => self.announce_handover_done(self.observed_generation()),
        }
    }

    fn announce_handover_done(&mut self, generation: u64) {
        if self.lease.as_ref().map(|l| &l.holder) == Some(&self.self_address) {
            self.lease = None;
        }
        info!(singleton = %self.name, generation, "Announcing handover done");
        self.broadcast(&Wire::HandOverDone { generation });
    }

    fn on_instance_stopped(&mut self, ctx: &mut ActorContext<ManagerMsg<C, R>>, generation: u64) {
        let current = self.instance.as_ref().map(|active| active.generation);
        if current != Some(generation) {
            return;
        }
        self.instance = None;
        let _ = self.events.send(SingletonEvent::Deactivated {
            singleton: self.name.clone(),
            node: self.self_address.clone(),
            generation,
        });

        if self.handing_over {
            self.handing_over = false;
            self.announce_handover_done(generation);
        } else {
            warn!(singleton = %self.name, generation, "Singleton instance stopped unexpectedly, restarting");
            self.try_activate(ctx);
        }
    }
}

#[async_trait]
impl<C: WireMessage, R: WireMessage> ActorBehavior for SingletonManager<C, R> {
    type Message = ManagerMsg<C, R>;

    async fn on_start(&mut self, ctx: &mut ActorContext<Self::Message>) -> actors::Result<()> {
        let (view, receiver) = initial_view(self.node.oracle().as_ref()).await;
        self.view = view;
        self.exiting = self
            .view
            .status_of(&self.self_address)
            .map(|status| status >= MemberStatus::Leaving)
            .unwrap_or(false);
        ctx.forward_stream(membership_events(receiver), ManagerMsg::Membership);

        let target = ctx.self_ref().clone();
        self.node
            .transport()
            .register(
                &self.channel,
                Arc::new(move |from, frame| {
                    let _ = target.tell(ManagerMsg::Inbound { from, frame });
                }),
            )
            .map_err(ActorError::handler)?;
        self.registered = true;

        info!(
            singleton = %self.name,
            node = %self.self_address,
            role = ?self.settings.role,
            "Singleton manager started"
        );
        self.broadcast(&Wire::LeaseQuery);
        self.try_activate(ctx);
        Ok(())
    }

    async fn handle(
        &mut self,
        ctx: &mut ActorContext<Self::Message>,
        msg: Self::Message,
    ) -> actors::Result<Next<Self::Message>> {
        match msg {
            ManagerMsg::Membership(event) => self.on_membership(ctx, event),
            ManagerMsg::Deliver { command, reply_to } => self.deliver(command, reply_to),
            ManagerMsg::Inbound { from, frame } => self.on_inbound(ctx, from, frame),
            ManagerMsg::InstanceStopped { generation } => self.on_instance_stopped(ctx, generation),
            ManagerMsg::RetryActivation => self.try_activate(ctx),
            ManagerMsg::GetState(reply_to) => {
                reply_to.send(self.state());
            }
        }
        Ok(Next::Same)
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext<Self::Message>) {
        if let Some(active) = self.instance.take() {
            active.actor.stop();
            active.actor.stopped().await;
            let _ = self.events.send(SingletonEvent::Deactivated {
                singleton: self.name.clone(),
                node: self.self_address.clone(),
                generation: active.generation,
            });
            self.announce_handover_done(active.generation);
        }
        if self.registered {
            self.node.transport().unregister(&self.channel);
            self.registered = false;
        }
        for (_, pending) in self.pending.drain() {
            pending
                .reply_to
                .send(Err(ClusterError::handover_in_progress(&self.name)));
        }
    }

    async fn on_error(&mut self, error: &ActorError) -> Option<SupervisorDirective> {
        // a failed instance is restarted through its stop watcher
        match error {
            ActorError::Escalated { .. } => Some(SupervisorDirective::Resume),
            _ => None,
        }
    }
}

/// Location-transparent handle to a cluster singleton
pub struct SingletonRef<C: WireMessage, R: WireMessage> {
    name: String,
    manager: ActorRef<ManagerMsg<C, R>>,
    events: broadcast::Sender<SingletonEvent>,
    timeout: Duration,
}

impl<C: WireMessage, R: WireMessage> SingletonRef<C, R> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fire-and-forget; buffered while no holder is known
    pub fn tell(&self, command: C) -> Result<()> {
        self.manager
            .tell(ManagerMsg::Deliver {
                command,
                reply_to: None,
            })
            .map_err(ClusterError::from)
    }

    pub async fn ask(&self, command: C) -> Result<R> {
        self.ask_with_timeout(command, self.timeout).await
    }

    pub async fn ask_with_timeout(&self, command: C, timeout: Duration) -> Result<R> {
        match self
            .manager
            .ask(
                |reply_to| ManagerMsg::Deliver {
                    command,
                    reply_to: Some(reply_to),
                },
                timeout,
            )
            .await
        {
            Ok(reply) => reply,
            Err(e) => Err(ClusterError::Actor(e)),
        }
    }

    pub async fn state(&self) -> Result<SingletonState> {
        Ok(self.manager.ask(ManagerMsg::GetState, self.timeout).await?)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SingletonEvent> {
        self.events.subscribe()
    }

    /// Stop this node's manager, handing over a local instance first
    pub async fn shutdown(&self) {
        self.manager.stop();
        self.manager.stopped().await;
    }
}

impl<C: WireMessage, R: WireMessage> Clone for SingletonRef<C, R> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            manager: self.manager.clone(),
            events: self.events.clone(),
            timeout: self.timeout,
        }
    }
}

impl<C: WireMessage, R: WireMessage> fmt::Debug for SingletonRef<C, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingletonRef")
            .field("name", &self.name)
            .field("manager", &self.manager.path())
            .finish()
    }
}

/// Entry point for starting singleton managers on one node
#[derive(Debug, Clone)]
pub struct ClusterSingleton {
    system: ActorSystem,
    node: ClusterNode,
    settings: SingletonSettings,
}

impl ClusterSingleton {
    pub fn new(system: &ActorSystem, node: &ClusterNode, settings: SingletonSettings) -> Self {
        Self {
            system: system.clone(),
            node: node.clone(),
            settings,
        }
    }

    pub fn settings(&self) -> &SingletonSettings {
        &self.settings
    }

    /// Start the manager `/user/singleton-{name}`; a name can be initialised once per node
    pub fn init<C, R>(&self, name: &str, props: Props<Request<C, R>>) -> Result<SingletonRef<C, R>>
    where
        C: WireMessage,
        R: WireMessage,
    {
        let (events, _) = broadcast::channel(64);
        let generations = Arc::new(AtomicU64::new(0));

        let manager_props = {
            let name = name.to_string();
            let node = self.node.clone();
            let settings = self.settings.clone();
            let events = events.clone();
            Props::new(move || {
                SingletonManager::new(
                    name.clone(),
                    node.clone(),
                    settings.clone(),
                    props.clone(),
                    events.clone(),
                    Arc::clone(&generations),
                )
            })
        };

        let manager = self
            .system
            .spawn(&format!("singleton-{}", name), manager_props)
            .map_err(spawn_error)?;

        Ok(SingletonRef {
            name: name.to_string(),
            manager,
            events,
            timeout: self.settings.ask_timeout,
        })
    }
}
