//! Actor System Core
//!
//! Actor runtime with lifecycle management, mailboxes and supervision. Each
//! actor is one tokio task that owns its behavior and drains its mailbox one
//! message at a time; the tokio scheduler multiplexes actors over its workers.
//!
//! ## Mailbox
//!
//! Every actor has two queues: user messages (unbounded, FIFO per sender) and
//! system signals (stop, child failure). Signals are polled first, so a stop
//! request overtakes queued user messages but never interrupts the message
//! currently being handled.
//!
//! ## Stopping
//!
//! Stopping is cooperative: the in-flight message completes, the mailbox is
//! closed, queued messages are dropped as dead letters (closing their reply
//! addresses, so pending asks fail with [`ActorError::ActorStopped`]),
//! children are stopped depth-first, and finally `on_stop` runs.
//!
//! # Lock Ordering
//!
//! Only one lock exists per cell (`children`). It is never held across an
//! await point and never nested with another cell's lock.

use crate::behavior::{ActorBehavior, Next, Props};
use crate::context::ActorContext;
use crate::error::{ActorError, Result};
use crate::messages::{Message, ReplyTo};
use crate::registry::{ActorId, ActorPath, Children};
use crate::supervision::{RestartWindow, SupervisorDirective, SupervisorStrategy};

use futures::FutureExt;
use node_config::NodeConfig;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Actor status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorStatus {
    Starting,
    Running,
    Restarting,
    Stopping,
    Stopped,
}

/// System-wide metrics
#[derive(Debug, Default)]
pub struct SystemMetrics {
    pub actors_spawned: AtomicU64,
    pub actors_stopped: AtomicU64,
    pub messages_processed: AtomicU64,
    pub total_processing_time_ns: AtomicU64,
    pub actor_restarts: AtomicU64,
    pub restart_failures: AtomicU64,
    pub escalations: AtomicU64,
    pub dead_letters: AtomicU64,
}

impl SystemMetrics {
    pub fn record_message_handled(&self, duration: Duration) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        self.total_processing_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn avg_processing_time_ns(&self) -> f64 {
        let count = self.messages_processed.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        let total = self.total_processing_time_ns.load(Ordering::Relaxed);
        total as f64 / count as f64
    }

    /// Record actor restart event; `success` is false when the limit was hit
    pub fn record_actor_restart(&self, success: bool) {
        self.actor_restarts.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.restart_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_dead_letters(&self, count: u64) {
        self.dead_letters.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_escalation(&self) {
        self.escalations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SystemStats {
        SystemStats {
            actors_spawned: self.actors_spawned.load(Ordering::Relaxed),
            actors_stopped: self.actors_stopped.load(Ordering::Relaxed),
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            avg_processing_time_ns: self.avg_processing_time_ns(),
            actor_restarts: self.actor_restarts.load(Ordering::Relaxed),
            restart_failures: self.restart_failures.load(Ordering::Relaxed),
            escalations: self.escalations.load(Ordering::Relaxed),
            dead_letters: self.dead_letters.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SystemMetrics`]
#[derive(Debug, Clone, PartialEq)]
pub struct SystemStats {
    pub actors_spawned: u64,
    pub actors_stopped: u64,
    pub messages_processed: u64,
    pub avg_processing_time_ns: f64,
    pub actor_restarts: u64,
    pub restart_failures: u64,
    pub escalations: u64,
    pub dead_letters: u64,
}

/// Runtime settings shared by every actor of a system
#[derive(Debug, Clone)]
pub struct SystemSettings {
    /// Default timeout for asks that do not pass their own
    pub ask_timeout: Duration,
    /// Concurrent piped or blocking tasks across the system
    pub worker_pool_size: usize,
    /// Strategy applied by [`ActorSystem::default_props`]
    pub default_strategy: SupervisorStrategy,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self::from(&NodeConfig::default())
    }
}

impl From<&NodeConfig> for SystemSettings {
    fn from(config: &NodeConfig) -> Self {
        Self {
            ask_timeout: Duration::from_millis(config.system.ask_timeout_ms),
            worker_pool_size: config.system.worker_pool_size.max(1),
            default_strategy: SupervisorStrategy::from(&config.supervision),
        }
    }
}

/// Signals delivered ahead of user messages
#[derive(Debug)]
pub(crate) enum SystemSignal {
    Stop,
    ChildFailed { child: ActorPath, error: ActorError },
}

/// Shared, type-erased part of an actor: identity, status and children
pub(crate) struct ActorCell {
    pub(crate) id: ActorId,
    pub(crate) path: ActorPath,
    /// None for the user guardian, which has no task of its own
    signals: Option<mpsc::UnboundedSender<SystemSignal>>,
    status: watch::Sender<ActorStatus>,
    pub(crate) children: Mutex<Children<ActorCell>>,
}

impl ActorCell {
    fn new(path: ActorPath, signals: mpsc::UnboundedSender<SystemSignal>) -> Self {
        let (status, _) = watch::channel(ActorStatus::Starting);
        Self {
            id: ActorId::new(),
            path,
            signals: Some(signals),
            status,
            children: Mutex::new(Children::default()),
        }
    }

    fn guardian() -> Self {
        let (status, _) = watch::channel(ActorStatus::Running);
        Self {
            id: ActorId::new(),
            path: ActorPath::user_root(),
            signals: None,
            status,
            children: Mutex::new(Children::default()),
        }
    }

    fn signal(&self, signal: SystemSignal) -> bool {
        match &self.signals {
            Some(tx) => tx.send(signal).is_ok(),
            None => false,
        }
    }

    pub(crate) fn request_stop(&self) -> bool {
        self.signal(SystemSignal::Stop)
    }

    fn set_status(&self, status: ActorStatus) {
        self.status.send_replace(status);
    }

    pub(crate) fn status(&self) -> ActorStatus {
        *self.status.borrow()
    }

    pub(crate) async fn wait_stopped(&self) {
        let mut rx = self.status.subscribe();
        let _ = rx.wait_for(|status| *status == ActorStatus::Stopped).await;
    }

    /// Stop every child and wait until each one has fully stopped
    pub(crate) async fn stop_children(&self) {
        let children = self.children.lock().snapshot();
        if children.is_empty() {
            return;
        }
        debug!(actor = %self.path, count = children.len(), "Stopping children");
        for child in &children {
            child.request_stop();
        }
        futures::future::join_all(children.iter().map(|child| child.wait_stopped())).await;
    }
}

/// Actor reference for location-transparent communication
pub struct ActorRef<M: Message> {
    cell: Arc<ActorCell>,
    sender: mpsc::UnboundedSender<M>,
    metrics: Arc<SystemMetrics>,
}

impl<M: Message> ActorRef<M> {
    /// Enqueue a message without waiting; fails fast if the actor is stopped
    pub fn tell(&self, msg: M) -> Result<()> {
        self.sender.send(msg).map_err(|_| {
            self.metrics.record_dead_letters(1);
            debug!(
                actor = %self.cell.path,
                message_type = std::any::type_name::<M>(),
                "Dead letter: actor no longer accepts messages"
            );
            ActorError::stopped(self.cell.path.as_str())
        })
    }

    /// Send a command carrying a fresh reply address and wait for the reply
    pub async fn ask<R, F>(&self, make: F, timeout: Duration) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(ReplyTo<R>) -> M,
    {
        let (reply_to, rx) = ReplyTo::channel();
        let correlation_id = reply_to.correlation_id();
        self.tell(make(reply_to))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => {
                if matches!(self.status(), ActorStatus::Stopping | ActorStatus::Stopped) {
                    Err(ActorError::stopped(self.cell.path.as_str()))
                } else {
                    Err(ActorError::no_reply(self.cell.path.as_str()))
                }
            }
            Err(_) => {
                debug!(
                    actor = %self.cell.path,
                    correlation_id = %correlation_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Ask timed out"
                );
                Err(ActorError::timeout(
                    format!("ask {}", self.cell.path),
                    timeout.as_millis() as u64,
                ))
            }
        }
    }

    /// Request a cooperative stop; returns immediately
    pub fn stop(&self) {
        if !self.cell.request_stop() {
            debug!(actor = %self.cell.path, "Stop requested for actor that already stopped");
        }
    }

    /// Wait until the actor has fully stopped
    pub async fn stopped(&self) {
        self.cell.wait_stopped().await
    }

    pub fn is_stopped(&self) -> bool {
        self.status() == ActorStatus::Stopped
    }

    pub fn status(&self) -> ActorStatus {
        self.cell.status()
    }

    pub fn id(&self) -> &ActorId {
        &self.cell.id
    }

    pub fn path(&self) -> &ActorPath {
        &self.cell.path
    }

    /// Names of the actor's live children
    pub fn children(&self) -> Vec<String> {
        self.cell.children.lock().names()
    }

    pub(crate) fn cell(&self) -> &Arc<ActorCell> {
        &self.cell
    }
}

impl<M: Message> Clone for ActorRef<M> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            sender: self.sender.clone(),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<M: Message> PartialEq for ActorRef<M> {
    fn eq(&self, other: &Self) -> bool {
        self.cell.id == other.cell.id
    }
}

impl<M: Message> fmt::Debug for ActorRef<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorRef")
            .field("id", &self.cell.id)
            .field("path", &self.cell.path)
            .finish()
    }
}

enum Delivery<M> {
    Signal(SystemSignal),
    Message(M),
}

/// Mailbox receiver
struct MailboxReceiver<M: Message> {
    signals: mpsc::UnboundedReceiver<SystemSignal>,
    user: mpsc::UnboundedReceiver<M>,
}

impl<M: Message> MailboxReceiver<M> {
    async fn recv(&mut self) -> Option<Delivery<M>> {
        // Signals first
        tokio::select! {
            biased;

            Some(signal) = self.signals.recv() => Some(Delivery::Signal(signal)),
            Some(msg) = self.user.recv() => Some(Delivery::Message(msg)),
            else => None,
        }
    }

    /// Refuse further messages and drop what is queued; returns the count
    fn close_and_drain(&mut self) -> u64 {
        self.user.close();
        let mut dropped = 0;
        while self.user.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

/// Core actor system managing actor lifecycles
pub struct ActorSystem {
    name: Arc<str>,
    /// System ID for debugging
    system_id: String,
    guardian: Arc<ActorCell>,
    metrics: Arc<SystemMetrics>,
    settings: Arc<SystemSettings>,
    workers: Arc<Semaphore>,
}

impl ActorSystem {
    /// Create new actor system with default settings
    pub fn new(name: &str) -> Self {
        Self::with_settings(name, SystemSettings::default())
    }

    pub fn from_config(config: &NodeConfig) -> Self {
        Self::with_settings(&config.system.name, SystemSettings::from(config))
    }

    pub fn with_settings(name: &str, settings: SystemSettings) -> Self {
        let system_id = format!("system-{}", Uuid::new_v4().simple());
        info!(
            system = name,
            system_id = %system_id,
            worker_pool_size = settings.worker_pool_size,
            ask_timeout_ms = settings.ask_timeout.as_millis() as u64,
            "Creating new actor system"
        );

        Self {
            name: Arc::from(name),
            system_id,
            guardian: Arc::new(ActorCell::guardian()),
            metrics: Arc::new(SystemMetrics::default()),
            workers: Arc::new(Semaphore::new(settings.worker_pool_size.max(1))),
            settings: Arc::new(settings),
        }
    }

    /// Spawn a top-level actor under `/user`
    pub fn spawn<M: Message>(&self, name: &str, props: Props<M>) -> Result<ActorRef<M>> {
        spawn_actor(self, &self.guardian, name, props)
    }

    /// Props using this system's default supervisor strategy
    pub fn default_props<M, B, F>(&self, factory: F) -> Props<M>
    where
        M: Message,
        B: ActorBehavior<Message = M>,
        F: Fn() -> B + Send + Sync + 'static,
    {
        Props::new(factory).with_strategy(self.settings.default_strategy.clone())
    }

    /// Stop an actor and wait until it (and its children) have stopped
    pub async fn stop<M: Message>(&self, actor: &ActorRef<M>) {
        actor.stop();
        actor.stopped().await;
    }

    /// Names of the live top-level actors
    pub fn list_actors(&self) -> Vec<String> {
        self.guardian.children.lock().names()
    }

    /// Get system metrics
    pub fn metrics(&self) -> Arc<SystemMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn settings(&self) -> &SystemSettings {
        &self.settings
    }

    pub fn ask_timeout(&self) -> Duration {
        self.settings.ask_timeout
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn worker_permits(&self) -> Arc<Semaphore> {
        Arc::clone(&self.workers)
    }

    /// Stop every top-level actor (children first) and wait for completion
    pub async fn shutdown(&self) {
        let started = Instant::now();
        info!(system = %self.name, system_id = %self.system_id, "Shutting down actor system");
        self.guardian.stop_children().await;
        info!(
            system = %self.name,
            system_id = %self.system_id,
            shutdown_duration_ms = started.elapsed().as_millis() as u64,
            "Actor system shutdown complete"
        );
    }
}

impl Clone for ActorSystem {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            system_id: self.system_id.clone(),
            guardian: Arc::clone(&self.guardian),
            metrics: Arc::clone(&self.metrics),
            settings: Arc::clone(&self.settings),
            workers: Arc::clone(&self.workers),
        }
    }
}

impl fmt::Debug for ActorSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorSystem")
            .field("name", &self.name)
            .field("system_id", &self.system_id)
            .finish()
    }
}

/// Spawn an actor as a child of `parent`, reserving its name first
pub(crate) fn spawn_actor<M: Message>(
    system: &ActorSystem,
    parent: &Arc<ActorCell>,
    name: &str,
    props: Props<M>,
) -> Result<ActorRef<M>> {
    let path = parent.path.child(name)?;
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let (user_tx, user_rx) = mpsc::unbounded_channel();
    let cell = Arc::new(ActorCell::new(path, signal_tx));

    parent
        .children
        .lock()
        .reserve(&parent.path, name, Arc::clone(&cell))?;

    let actor_ref = ActorRef {
        cell: Arc::clone(&cell),
        sender: user_tx,
        metrics: system.metrics(),
    };

    debug!(
        actor = %cell.path,
        actor_id = %cell.id,
        message_type = std::any::type_name::<M>(),
        "Spawning actor"
    );

    let runner = ActorRunner {
        behavior: props.create(),
        restarts: props.strategy().restart_window(),
        props,
        cell,
        parent: Arc::downgrade(parent),
        receiver: MailboxReceiver {
            signals: signal_rx,
            user: user_rx,
        },
        ctx: ActorContext::new(actor_ref.clone(), system.clone()),
        metrics: system.metrics(),
    };
    tokio::spawn(runner.run());

    system.metrics.actors_spawned.fetch_add(1, Ordering::Relaxed);
    Ok(actor_ref)
}

enum Flow {
    Continue,
    Stop,
}

/// Owns one actor's behavior and mailbox for the lifetime of its task
struct ActorRunner<M: Message> {
    cell: Arc<ActorCell>,
    parent: Weak<ActorCell>,
    props: Props<M>,
    behavior: Box<dyn ActorBehavior<Message = M>>,
    receiver: MailboxReceiver<M>,
    ctx: ActorContext<M>,
    restarts: RestartWindow,
    metrics: Arc<SystemMetrics>,
}

impl<M: Message> ActorRunner<M> {
    async fn run(mut self) {
        let task_start = Instant::now();

        let mut flow = match self.start_behavior().await {
            Ok(()) => Flow::Continue,
            Err(e) => {
                error!(
                    actor = %self.cell.path,
                    error = %e,
                    startup_duration_ms = task_start.elapsed().as_millis() as u64,
                    "Actor failed to start"
                );
                self.supervise(e).await
            }
        };
        if matches!(flow, Flow::Continue) {
            self.cell.set_status(ActorStatus::Running);
            debug!(
                actor = %self.cell.path,
                startup_duration_ms = task_start.elapsed().as_millis() as u64,
                "Actor started, entering message loop"
            );
        }

        while matches!(flow, Flow::Continue) {
            let Some(delivery) = self.receiver.recv().await else {
                break;
            };
            flow = match delivery {
                Delivery::Signal(SystemSignal::Stop) => {
                    debug!(actor = %self.cell.path, "Stop signal received");
                    Flow::Stop
                }
                Delivery::Signal(SystemSignal::ChildFailed { child, error }) => {
                    warn!(
                        actor = %self.cell.path,
                        child = %child,
                        error = %error,
                        "Child escalated failure"
                    );
                    self.supervise(ActorError::escalated(child.as_str(), error))
                        .await
                }
                Delivery::Message(msg) => self.process(msg).await,
            };
        }

        self.terminate(task_start).await;
    }

    async fn process(&mut self, msg: M) -> Flow {
        let start = Instant::now();
        let outcome = AssertUnwindSafe(self.behavior.handle(&mut self.ctx, msg))
            .catch_unwind()
            .await;
        self.metrics.record_message_handled(start.elapsed());

        let result = match outcome {
            Ok(result) => result,
            Err(panic) => Err(ActorError::panicked(panic_message(panic.as_ref()))),
        };

        match result {
            Ok(Next::Same) => Flow::Continue,
            Ok(Next::Become(next)) => {
                debug!(actor = %self.cell.path, "Behavior replaced");
                self.behavior = next;
                Flow::Continue
            }
            Ok(Next::Stop) => {
                debug!(actor = %self.cell.path, "Behavior requested stop");
                Flow::Stop
            }
            Err(e) => {
                error!(
                    actor = %self.cell.path,
                    error = %e,
                    error_category = e.category(),
                    processing_duration_ns = start.elapsed().as_nanos() as u64,
                    "Actor message processing failed"
                );
                self.supervise(e).await
            }
        }
    }

    async fn start_behavior(&mut self) -> Result<()> {
        match AssertUnwindSafe(self.behavior.on_start(&mut self.ctx))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(ActorError::panicked(panic_message(panic.as_ref()))),
        }
    }

    async fn stop_behavior(&mut self) {
        if let Err(panic) = AssertUnwindSafe(self.behavior.on_stop(&mut self.ctx))
            .catch_unwind()
            .await
        {
            warn!(
                actor = %self.cell.path,
                panic = %panic_message(panic.as_ref()),
                "Actor panicked in on_stop"
            );
        }
    }

    async fn supervise(&mut self, error: ActorError) -> Flow {
        let directive = match self.behavior.on_error(&error).await {
            Some(directive) => directive,
            None => self.props.strategy().decide(&error),
        };

        match directive {
            SupervisorDirective::Resume => {
                debug!(actor = %self.cell.path, directive = "Resume", "Actor resumed after error");
                Flow::Continue
            }
            SupervisorDirective::Restart => self.restart(error).await,
            SupervisorDirective::Stop => {
                warn!(
                    actor = %self.cell.path,
                    directive = "Stop",
                    error = %error,
                    "Stopping actor due to error directive"
                );
                Flow::Stop
            }
            SupervisorDirective::Escalate => {
                self.escalate(error);
                Flow::Stop
            }
        }
    }

    /// Replace the behavior with a fresh one; the mailbox is kept, the failed
    /// message is not redelivered
    async fn restart(&mut self, mut error: ActorError) -> Flow {
        loop {
            if !self.restarts.should_restart() {
                error!(
                    actor = %self.cell.path,
                    directive = "Restart",
                    restart_count = self.restarts.restart_count(),
                    max_restarts = self.restarts.max_restarts(),
                    "Actor exceeded restart limit - escalating to supervisor"
                );
                self.metrics.record_actor_restart(false);
                self.escalate(error);
                return Flow::Stop;
            }

            warn!(
                actor = %self.cell.path,
                directive = "Restart",
                error = %error,
                restart_count = self.restarts.restart_count(),
                max_restarts = self.restarts.max_restarts(),
                "Restarting actor within restart limits"
            );
            self.metrics.record_actor_restart(true);
            self.cell.set_status(ActorStatus::Restarting);

            self.stop_behavior().await;
            self.cell.stop_children().await;
            self.ctx.cancel_background();
            self.behavior = self.props.create();

            match self.start_behavior().await {
                Ok(()) => {
                    self.cell.set_status(ActorStatus::Running);
                    return Flow::Continue;
                }
                Err(e) => {
                    error!(actor = %self.cell.path, error = %e, "Actor failed to start after restart");
                    error = e;
                }
            }
        }
    }

    fn escalate(&self, error: ActorError) {
        self.metrics.record_escalation();
        let escalated = self.parent.upgrade().is_some_and(|parent| {
            let sent = parent.signal(SystemSignal::ChildFailed {
                child: self.cell.path.clone(),
                error: error.clone(),
            });
            if sent {
                warn!(
                    actor = %self.cell.path,
                    parent = %parent.path,
                    error = %error,
                    "Escalating actor error to parent supervisor"
                );
            }
            sent
        });
        if !escalated {
            error!(
                actor = %self.cell.path,
                error = %error,
                "Top-level actor failed with no supervisor to escalate to - stopping"
            );
        }
    }

    async fn terminate(mut self, task_start: Instant) {
        self.cell.set_status(ActorStatus::Stopping);

        let dropped = self.receiver.close_and_drain();
        if dropped > 0 {
            debug!(actor = %self.cell.path, dropped, "Dropped queued messages of stopping actor");
            self.metrics.record_dead_letters(dropped);
        }

        self.cell.stop_children().await;
        self.ctx.cancel_background();
        self.stop_behavior().await;

        if let Some(parent) = self.parent.upgrade() {
            parent.children.lock().release(self.cell.path.name(), &self.cell);
        }
        self.metrics.actors_stopped.fetch_add(1, Ordering::Relaxed);
        self.cell.set_status(ActorStatus::Stopped);

        info!(
            actor = %self.cell.path,
            actor_id = %self.cell.id,
            total_runtime_ms = task_start.elapsed().as_millis() as u64,
            "Actor stopped"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
