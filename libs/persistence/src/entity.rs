//! Event-Sourced Entities
//!
//! An entity turns commands into events, persists them, and only then applies
//! them to its in-memory state. State after a restart is rebuilt from the
//! latest snapshot plus the journal tail, so it always equals the fold of
//! every persisted event.
//!
//! ```text
//! command ─► handle_command(state) ─► Effect::Persist(events)
//!                                        │
//!                          journal.append(seq+1) ──fail──► reply JournalWriteFailure, restart
//!                                        │ ok
//!                               state = apply_event(state)
//!                                        │
//!                         seq % N == 0 ? snapshots.save(state)
//!                                        │
//!                                  reply(&state)
//! ```

use crate::codec;
use crate::error::{EntityError, PersistenceError};
use crate::journal::Journal;
use crate::snapshot::{SnapshotPolicy, SnapshotStore};
use actors::{
    async_trait, respond, ActorBehavior, ActorContext, ActorError, ActorRef, ActorSystem, Next,
    Props, Request,
};
use futures::StreamExt;
use node_config::PersistenceConfig;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Reply type seen by callers of an entity
pub type EntityResult<R> = std::result::Result<R, EntityError>;

/// Mailbox message of an entity actor
pub type EntityMessage<E> = Request<
    <E as EventSourcedEntity>::Command,
    EntityResult<<E as EventSourcedEntity>::Reply>,
>;

type ReplyFn<S, R> = Box<dyn FnOnce(&S) -> R + Send>;

/// Outcome of handling one command
pub enum Effect<E, S, R> {
    /// Persist the events as one journal batch, apply them in order, then
    /// build the reply from the new state. A failed write applies none of them.
    Persist { events: Vec<E>, reply: ReplyFn<S, R> },
    /// Answer without changing state
    Reply(R),
    /// Refuse the command; state unchanged
    Reject(String),
}

impl<E, S, R> Effect<E, S, R> {
    pub fn persist_then_reply<F>(event: E, reply: F) -> Self
    where
        F: FnOnce(&S) -> R + Send + 'static,
    {
        Effect::Persist {
            events: vec![event],
            reply: Box::new(reply),
        }
    }

    pub fn persist_all<F>(events: Vec<E>, reply: F) -> Self
    where
        F: FnOnce(&S) -> R + Send + 'static,
    {
        Effect::Persist {
            events,
            reply: Box::new(reply),
        }
    }

    pub fn reply(value: R) -> Self {
        Effect::Reply(value)
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Effect::Reject(reason.into())
    }
}

impl<E: fmt::Debug, S, R: fmt::Debug> fmt::Debug for Effect<E, S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effect::Persist { events, .. } => f.debug_struct("Persist").field("events", events).finish(),
            Effect::Reply(value) => f.debug_tuple("Reply").field(value).finish(),
            Effect::Reject(reason) => f.debug_tuple("Reject").field(reason).finish(),
        }
    }
}

/// Definition of an event-sourced entity type
pub trait EventSourcedEntity: Send + Sync + Clone + 'static {
    type Command: Send + 'static;
    type Event: Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static;
    type State: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;
    type Reply: Send + 'static;

    /// Prefix of the actor name and journal key, e.g. "counter"
    fn type_name(&self) -> &'static str;

    fn empty_state(&self) -> Self::State;

    /// Decide what a command does; must not mutate anything
    fn handle_command(
        &self,
        state: &Self::State,
        command: Self::Command,
    ) -> Effect<Self::Event, Self::State, Self::Reply>;

    /// Pure and deterministic: the same events always fold to the same state
    fn apply_event(state: Self::State, event: &Self::Event) -> Self::State;

    /// Per-type snapshot cadence; `None` uses the configured default
    fn snapshot_policy(&self) -> Option<SnapshotPolicy> {
        None
    }
}

/// Fold events onto a starting state
pub fn replay<'a, E, I>(state: E::State, events: I) -> E::State
where
    E: EventSourcedEntity,
    I: IntoIterator<Item = &'a E::Event>,
{
    events.into_iter().fold(state, E::apply_event)
}

/// Journal and snapshot store shared by the entities of a node
#[derive(Clone)]
pub struct Persistence {
    journal: Arc<dyn Journal>,
    snapshots: Arc<dyn SnapshotStore>,
    default_policy: SnapshotPolicy,
}

impl Persistence {
    pub fn new(journal: Arc<dyn Journal>, snapshots: Arc<dyn SnapshotStore>) -> Self {
        Self {
            journal,
            snapshots,
            default_policy: SnapshotPolicy::default(),
        }
    }

    pub fn from_config(
        config: &PersistenceConfig,
        journal: Arc<dyn Journal>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self::new(journal, snapshots).with_default_policy(SnapshotPolicy::from_every(config.snapshot_every))
    }

    pub fn with_default_policy(mut self, policy: SnapshotPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn journal(&self) -> &Arc<dyn Journal> {
        &self.journal
    }

    pub fn snapshots(&self) -> &Arc<dyn SnapshotStore> {
        &self.snapshots
    }

    pub fn default_policy(&self) -> SnapshotPolicy {
        self.default_policy
    }
}

impl fmt::Debug for Persistence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Persistence")
            .field("default_policy", &self.default_policy)
            .finish()
    }
}

/// Journal key of an entity instance
pub fn persistence_id(type_name: &str, entity_id: &str) -> String {
    format!("{}-{}", type_name, entity_id)
}

struct EntityActor<E: EventSourcedEntity> {
    entity: E,
    persistence_id: String,
    persistence: Persistence,
    policy: SnapshotPolicy,
    state: E::State,
    sequence_nr: u64,
}

impl<E: EventSourcedEntity> EntityActor<E> {
    fn new(entity: E, entity_id: &str, persistence: Persistence) -> Self {
        let policy = entity
            .snapshot_policy()
            .unwrap_or_else(|| persistence.default_policy());
        Self {
            persistence_id: persistence_id(entity.type_name(), entity_id),
            state: entity.empty_state(),
            entity,
            persistence,
            policy,
            sequence_nr: 0,
        }
    }

    async fn recover(&mut self) -> Result<(), PersistenceError> {
        let start = Instant::now();
        let id = self.persistence_id.as_str();

        let snapshot = match self.persistence.snapshots().load_latest(id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(entity = id, error = %e, "Snapshot load failed, replaying full journal");
                None
            }
        };

        let (mut state, mut sequence_nr, snapshot_used) = match snapshot {
            Some(entry) => match codec::decode::<E::State>(&entry.payload) {
                Ok(state) => (state, entry.sequence_nr, true),
                Err(e) => {
                    warn!(entity = id, error = %e, "Snapshot unreadable, replaying full journal");
                    (self.entity.empty_state(), 0, false)
                }
            },
            None => (self.entity.empty_state(), 0, false),
        };

        let mut events = self.persistence.journal().read_from(id, sequence_nr).await?;
        let mut replayed = 0u64;
        while let Some(entry) = events.next().await {
            let entry = entry?;
            let event: E::Event = codec::decode(&entry.payload)?;
            state = E::apply_event(state, &event);
            sequence_nr = entry.sequence_nr;
            replayed += 1;
        }

        self.state = state;
        self.sequence_nr = sequence_nr;
        info!(
            entity = id,
            sequence_nr,
            events_replayed = replayed,
            snapshot_used,
            recovery_duration_ms = start.elapsed().as_millis() as u64,
            "Entity recovered"
        );
        Ok(())
    }

    /// Write one event ahead of applying it
    async fn persist(&mut self, events: &[E::Event]) -> Result<(), PersistenceError> {
        let first = self.sequence_nr + 1;
        let payloads = events
            .iter()
            .map(codec::encode)
            .collect::<Result<Vec<_>, _>>()?;
        self.persistence
            .journal()
            .append_all(&self.persistence_id, first, payloads)
            .await?;

        for event in events {
            let next = self.sequence_nr + 1;
            self.state = E::apply_event(self.state.clone(), event);
            self.sequence_nr = next;
            debug!(entity = %self.persistence_id, sequence_nr = next, event = ?event, "Event persisted");

            if self.policy.is_due(next) {
                self.save_snapshot().await;
            }
        }
        Ok(())
    }

    async fn save_snapshot(&self) {
        let payload = match codec::encode(&self.state) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(entity = %self.persistence_id, error = %e, "Snapshot encoding failed");
                return;
            }
        };
        // the journal stays authoritative; a missed snapshot only lengthens recovery
        if let Err(e) = self
            .persistence
            .snapshots()
            .save(&self.persistence_id, self.sequence_nr, payload)
            .await
        {
            warn!(
                entity = %self.persistence_id,
                sequence_nr = self.sequence_nr,
                error = %e,
                "Snapshot save failed"
            );
        }
    }
}

#[async_trait]
impl<E: EventSourcedEntity> ActorBehavior for EntityActor<E> {
    type Message = EntityMessage<E>;

    async fn on_start(&mut self, _ctx: &mut ActorContext<Self::Message>) -> actors::Result<()> {
        self.recover().await.map_err(ActorError::handler)
    }

    async fn handle(
        &mut self,
        _ctx: &mut ActorContext<Self::Message>,
        msg: Self::Message,
    ) -> actors::Result<Next<Self::Message>> {
        let Request { command, reply_to } = msg;

        match self.entity.handle_command(&self.state, command) {
            Effect::Reply(value) => respond(reply_to, Ok(value)),
            Effect::Reject(reason) => {
                debug!(entity = %self.persistence_id, reason = %reason, "Command rejected");
                respond(reply_to, Err(EntityError::Rejected { reason }));
            }
            Effect::Persist { events, reply } => {
                if let Err(e) = self.persist(&events).await {
                    error!(
                        entity = %self.persistence_id,
                        sequence_nr = self.sequence_nr + 1,
                        events = events.len(),
                        error = %e,
                        "Journal write failed, restarting entity"
                    );
                    respond(
                        reply_to,
                        Err(EntityError::JournalWriteFailure {
                            reason: e.to_string(),
                        }),
                    );
                    return Err(ActorError::handler(e));
                }
                respond(reply_to, Ok(reply(&self.state)));
            }
        }
        Ok(Next::Same)
    }
}

/// Props for an entity actor; every (re)start recovers from the journal
pub fn entity_props<E: EventSourcedEntity>(
    entity: E,
    entity_id: impl Into<String>,
    persistence: Persistence,
) -> Props<EntityMessage<E>> {
    let entity_id = entity_id.into();
    Props::new(move || EntityActor::new(entity.clone(), &entity_id, persistence.clone()))
}

/// Spawn an entity under the user guardian as `{type_name}-{entity_id}`
pub fn spawn_entity<E: EventSourcedEntity>(
    system: &ActorSystem,
    entity: E,
    entity_id: &str,
    persistence: Persistence,
) -> actors::Result<EntityRef<E>> {
    let name = persistence_id(entity.type_name(), entity_id);
    let actor = system.spawn(&name, entity_props(entity, entity_id, persistence))?;
    Ok(EntityRef {
        actor,
        timeout: system.ask_timeout(),
    })
}

/// Typed handle to a running entity
pub struct EntityRef<E: EventSourcedEntity> {
    actor: ActorRef<EntityMessage<E>>,
    timeout: Duration,
}

impl<E: EventSourcedEntity> EntityRef<E> {
    pub fn new(actor: ActorRef<EntityMessage<E>>, timeout: Duration) -> Self {
        Self { actor, timeout }
    }

    pub fn tell(&self, command: E::Command) -> actors::Result<()> {
        self.actor.tell(Request::tell(command))
    }

    pub async fn ask(&self, command: E::Command) -> EntityResult<E::Reply> {
        self.ask_with_timeout(command, self.timeout).await
    }

    pub async fn ask_with_timeout(
        &self,
        command: E::Command,
        timeout: Duration,
    ) -> EntityResult<E::Reply> {
        match self
            .actor
            .ask(|reply_to| Request::ask(command, reply_to), timeout)
            .await
        {
            Ok(reply) => reply,
            Err(e) => Err(e.into()),
        }
    }

    pub fn actor_ref(&self) -> &ActorRef<EntityMessage<E>> {
        &self.actor
    }

    pub async fn stop(&self) {
        self.actor.stop();
        self.actor.stopped().await;
    }
}

impl<E: EventSourcedEntity> Clone for EntityRef<E> {
    fn clone(&self) -> Self {
        Self {
            actor: self.actor.clone(),
            timeout: self.timeout,
        }
    }
}

impl<E: EventSourcedEntity> fmt::Debug for EntityRef<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRef")
            .field("actor", &self.actor)
            .field("timeout", &self.timeout)
            .finish()
    }
}
