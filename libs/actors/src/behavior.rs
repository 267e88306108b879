//! Actor Behaviors
//!
//! A behavior is the current message handler of an actor. After each message
//! it decides what handles the next one: itself ([`Next::Same`]), a
//! replacement ([`Next::Become`]), or nobody ([`Next::Stop`]).

use crate::context::ActorContext;
use crate::error::{ActorError, Result};
use crate::messages::Message;
use crate::supervision::{SupervisorDirective, SupervisorStrategy};
use async_trait::async_trait;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Trait for actor behavior
#[async_trait]
pub trait ActorBehavior: Send + 'static {
    type Message: Message;

    /// Handle one message; exactly one call runs at a time per actor
    async fn handle(
        &mut self,
        ctx: &mut ActorContext<Self::Message>,
        msg: Self::Message,
    ) -> Result<Next<Self::Message>>;

    /// Called when the actor starts and after every restart
    async fn on_start(&mut self, _ctx: &mut ActorContext<Self::Message>) -> Result<()> {
        Ok(())
    }

    /// Called before the actor stops or is replaced by a restart
    async fn on_stop(&mut self, _ctx: &mut ActorContext<Self::Message>) {}

    /// Override the supervisor strategy for a specific failure
    async fn on_error(&mut self, _error: &ActorError) -> Option<SupervisorDirective> {
        None
    }
}

/// What handles the next message
pub enum Next<M: Message> {
    Same,
    Become(Box<dyn ActorBehavior<Message = M>>),
    Stop,
}

impl<M: Message> Next<M> {
    /// Replace the current behavior after this message
    pub fn switch_to<B>(behavior: B) -> Self
    where
        B: ActorBehavior<Message = M>,
    {
        Next::Become(Box::new(behavior))
    }
}

impl<M: Message> fmt::Debug for Next<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Next::Same => f.write_str("Same"),
            Next::Become(_) => f.write_str("Become(..)"),
            Next::Stop => f.write_str("Stop"),
        }
    }
}

/// Behavior built from a closure, for the functional "return the next
/// behavior" style
pub struct FnBehavior<M, F> {
    f: F,
    _message: PhantomData<fn(M)>,
}

/// Build a behavior from a synchronous handler closure
pub fn from_fn<M, F>(f: F) -> FnBehavior<M, F>
where
    M: Message,
    F: FnMut(&mut ActorContext<M>, M) -> Result<Next<M>> + Send + 'static,
{
    FnBehavior {
        f,
        _message: PhantomData,
    }
}

#[async_trait]
impl<M, F> ActorBehavior for FnBehavior<M, F>
where
    M: Message,
    F: FnMut(&mut ActorContext<M>, M) -> Result<Next<M>> + Send + 'static,
{
    type Message = M;

    async fn handle(&mut self, ctx: &mut ActorContext<M>, msg: M) -> Result<Next<M>> {
        (self.f)(ctx, msg)
    }
}

type BehaviorFactory<M> = dyn Fn() -> Box<dyn ActorBehavior<Message = M>> + Send + Sync;

/// Recipe for creating (and re-creating on restart) an actor
pub struct Props<M: Message> {
    factory: Arc<BehaviorFactory<M>>,
    strategy: SupervisorStrategy,
}

impl<M: Message> Props<M> {
    /// Props from a factory producing a concrete behavior
    pub fn new<B, F>(factory: F) -> Self
    where
        B: ActorBehavior<Message = M>,
        F: Fn() -> B + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(move || Box::new(factory()) as Box<dyn ActorBehavior<Message = M>>),
            strategy: SupervisorStrategy::default(),
        }
    }

    /// Props from a factory that already returns a boxed behavior
    pub fn boxed<F>(factory: F) -> Self
    where
        F: Fn() -> Box<dyn ActorBehavior<Message = M>> + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            strategy: SupervisorStrategy::default(),
        }
    }

    pub fn with_strategy(mut self, strategy: SupervisorStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn strategy(&self) -> &SupervisorStrategy {
        &self.strategy
    }

    pub(crate) fn create(&self) -> Box<dyn ActorBehavior<Message = M>> {
        (self.factory)()
    }
}

impl<M: Message> Clone for Props<M> {
    fn clone(&self) -> Self {
        Self {
            factory: Arc::clone(&self.factory),
            strategy: self.strategy.clone(),
        }
    }
}

impl<M: Message> fmt::Debug for Props<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Props")
            .field("message", &std::any::type_name::<M>())
            .field("strategy", &self.strategy)
            .finish()
    }
}
