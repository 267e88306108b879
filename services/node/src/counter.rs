//! Counters
//!
//! The same counter three ways:
//! - [`counter_props`]: a plain actor in the functional style, every change
//!   returns the behavior for the next value
//! - [`singleton_counter_props`]: the instance hosted by the cluster singleton
//! - [`PersistentCounter`]: event sourced, survives restarts

use actors::{
    async_trait, from_fn, respond, ActorBehavior, ActorContext, ActorSystem, Next, Props, Request,
};
use persistence::{spawn_entity, Effect, EntityRef, EventSourcedEntity, Persistence};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterCommand {
    Increment,
    Decrement,
    GetValue,
    Reset,
}

/// Every counter command replies with the value after it was applied
pub type CounterRequest = Request<CounterCommand, i64>;

fn counter(value: i64) -> Box<dyn ActorBehavior<Message = CounterRequest>> {
    Box::new(from_fn(move |ctx, request: CounterRequest| {
        let Request { command, reply_to } = request;
        let next = match command {
            CounterCommand::Increment => value + 1,
            CounterCommand::Decrement => value - 1,
            CounterCommand::Reset => 0,
            CounterCommand::GetValue => {
                respond(reply_to, value);
                return Ok(Next::Same);
            }
        };
        debug!(actor = %ctx.path(), from = value, to = next, "Counter changed");
        respond(reply_to, next);
        Ok(Next::Become(counter(next)))
    }))
}

/// Counter starting at zero; a restart starts over from zero
pub fn counter_props() -> Props<CounterRequest> {
    Props::boxed(|| counter(0))
}

/// Command set of the cluster-wide counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SingletonCounterCommand {
    Increment(i64),
    Decrement(i64),
    GetCount,
    Reset,
}

pub type SingletonCounterRequest = Request<SingletonCounterCommand, i64>;

#[derive(Debug, Default)]
struct SingletonCounter {
    count: i64,
}

#[async_trait]
impl ActorBehavior for SingletonCounter {
    type Message = SingletonCounterRequest;

    async fn on_start(&mut self, ctx: &mut ActorContext<Self::Message>) -> actors::Result<()> {
        info!(actor = %ctx.path(), "Singleton counter started");
        Ok(())
    }

    async fn handle(
        &mut self,
        ctx: &mut ActorContext<Self::Message>,
        request: Self::Message,
    ) -> actors::Result<Next<Self::Message>> {
        match request.command {
            SingletonCounterCommand::Increment(delta) => self.count += delta,
            SingletonCounterCommand::Decrement(delta) => self.count -= delta,
            SingletonCounterCommand::Reset => self.count = 0,
            SingletonCounterCommand::GetCount => {}
        }
        debug!(actor = %ctx.path(), count = self.count, command = ?request.command, "Singleton counter");
        respond(request.reply_to, self.count);
        Ok(Next::Same)
    }

    async fn on_stop(&mut self, ctx: &mut ActorContext<Self::Message>) {
        info!(actor = %ctx.path(), count = self.count, "Singleton counter stopped");
    }
}

/// Behavior hosted by `ClusterSingleton::init`
pub fn singleton_counter_props() -> Props<SingletonCounterRequest> {
    Props::new(SingletonCounter::default)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterEvent {
    Incremented,
    Decremented,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterState {
    pub value: i64,
}

/// Event-sourced counter. Snapshots follow the configured default cadence.
#[derive(Debug, Clone, Default)]
pub struct PersistentCounter;

impl EventSourcedEntity for PersistentCounter {
    type Command = CounterCommand;
    type Event = CounterEvent;
    type State = CounterState;
    type Reply = i64;

    fn type_name(&self) -> &'static str {
        "counter"
    }

    fn empty_state(&self) -> CounterState {
        CounterState::default()
    }

    fn handle_command(
        &self,
        state: &CounterState,
        command: CounterCommand,
    ) -> Effect<CounterEvent, CounterState, i64> {
        match command {
            CounterCommand::Increment => {
                Effect::persist_then_reply(CounterEvent::Incremented, |state: &CounterState| state.value)
            }
            CounterCommand::Decrement => {
                Effect::persist_then_reply(CounterEvent::Decremented, |state: &CounterState| state.value)
            }
            CounterCommand::GetValue => Effect::reply(state.value),
            CounterCommand::Reset => Effect::reject("persistent counters cannot be reset"),
        }
    }

    fn apply_event(state: CounterState, event: &CounterEvent) -> CounterState {
        match event {
            CounterEvent::Incremented => CounterState {
                value: state.value + 1,
            },
            CounterEvent::Decremented => CounterState {
                value: state.value - 1,
            },
        }
    }
}

/// Spawn `/user/counter-{id}`, recovering whatever the journal holds for it
pub fn spawn_persistent_counter(
    system: &ActorSystem,
    id: &str,
    persistence: Persistence,
) -> actors::Result<EntityRef<PersistentCounter>> {
    spawn_entity(system, PersistentCounter, id, persistence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use persistence::replay;

    #[test]
    fn test_events_fold_to_value() {
        let events = [
            CounterEvent::Incremented,
            CounterEvent::Incremented,
            CounterEvent::Decremented,
            CounterEvent::Incremented,
        ];
        let state = replay::<PersistentCounter, _>(CounterState::default(), events.iter());
        assert_eq!(state.value, 2);
    }

    #[test]
    fn test_reset_is_rejected() {
        let effect = PersistentCounter.handle_command(&CounterState { value: 4 }, CounterCommand::Reset);
        assert!(matches!(effect, Effect::Reject(_)));
    }
}
