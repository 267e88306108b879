//! Actor Context
//!
//! Handed to a behavior with every message. Gives access to the actor's own
//! reference, child spawning, timers, and adapters that turn futures and
//! streams into messages for this actor.

use crate::behavior::Props;
use crate::error::Result;
use crate::messages::Message;
use crate::registry::ActorPath;
use crate::system::{spawn_actor, ActorRef, ActorSystem};
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Shortest interval accepted for repeating timers
const MIN_TIMER_INTERVAL: Duration = Duration::from_millis(1);

pub struct ActorContext<M: Message> {
    self_ref: ActorRef<M>,
    system: ActorSystem,
    timers: HashMap<String, JoinHandle<()>>,
    adapters: Vec<JoinHandle<()>>,
}

impl<M: Message> ActorContext<M> {
    pub(crate) fn new(self_ref: ActorRef<M>, system: ActorSystem) -> Self {
        Self {
            self_ref,
            system,
            timers: HashMap::new(),
            adapters: Vec::new(),
        }
    }

    pub fn self_ref(&self) -> &ActorRef<M> {
        &self.self_ref
    }

    pub fn path(&self) -> &ActorPath {
        self.self_ref.path()
    }

    pub fn system(&self) -> &ActorSystem {
        &self.system
    }

    /// Spawn a child supervised by this actor; names are unique per parent
    pub fn spawn<C: Message>(&self, name: &str, props: Props<C>) -> Result<ActorRef<C>> {
        spawn_actor(&self.system, self.self_ref.cell(), name, props)
    }

    pub fn children(&self) -> Vec<String> {
        self.self_ref.children()
    }

    /// Deliver `msg` after `initial_delay` and then every `interval`
    /// (fixed delay). Replaces a running timer with the same key.
    pub fn start_timer(
        &mut self,
        key: impl Into<String>,
        initial_delay: Duration,
        interval: Duration,
        msg: M,
    ) where
        M: Clone,
    {
        let key = key.into();
        let target = self.self_ref.clone();
        let interval = interval.max(MIN_TIMER_INTERVAL);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(initial_delay).await;
            loop {
                if target.tell(msg.clone()).is_err() {
                    break;
                }
                tokio::time::sleep(interval).await;
            }
        });
        self.install_timer(key, handle);
    }

    /// Deliver `msg` once after `delay`
    pub fn start_single_timer(&mut self, key: impl Into<String>, delay: Duration, msg: M) {
        let key = key.into();
        let target = self.self_ref.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = target.tell(msg);
        });
        self.install_timer(key, handle);
    }

    fn install_timer(&mut self, key: String, handle: JoinHandle<()>) {
        debug!(actor = %self.self_ref.path(), timer = %key, "Timer started");
        if let Some(previous) = self.timers.insert(key, handle) {
            previous.abort();
        }
    }

    pub fn cancel_timer(&mut self, key: &str) -> bool {
        match self.timers.remove(key) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_timer_active(&self, key: &str) -> bool {
        self.timers
            .get(key)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Run `future` on the system worker pool and deliver its mapped output
    /// back to this actor as a message
    pub fn pipe_to_self<F, T, Map>(&self, future: F, map: Map)
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
        Map: FnOnce(T) -> M + Send + 'static,
    {
        let target = self.self_ref.clone();
        let permits = self.system.worker_permits();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let value = future.await;
            if target.tell(map(value)).is_err() {
                debug!(actor = %target.path(), "Piped result arrived after actor stopped");
            }
        });
    }

    /// Run blocking work on tokio's blocking pool, bounded by the system
    /// worker permits, and deliver the mapped result to this actor
    pub fn spawn_blocking<F, T, Map>(&self, work: F, map: Map)
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
        Map: FnOnce(T) -> M + Send + 'static,
    {
        let target = self.self_ref.clone();
        let permits = self.system.worker_permits();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            match tokio::task::spawn_blocking(work).await {
                Ok(value) => {
                    let _ = target.tell(map(value));
                }
                Err(e) => warn!(actor = %target.path(), error = %e, "Blocking task failed"),
            }
        });
    }

    /// Feed every item of an external stream into this actor's mailbox.
    /// The adapter ends with the stream, or when the actor stops or restarts.
    pub fn forward_stream<S, Map>(&mut self, stream: S, mut map: Map)
    where
        S: Stream + Send + 'static,
        S::Item: Send,
        Map: FnMut(S::Item) -> M + Send + 'static,
    {
        let target = self.self_ref.clone();
        let handle = tokio::spawn(async move {
            let mut stream = Box::pin(stream);
            while let Some(item) = stream.next().await {
                if target.tell(map(item)).is_err() {
                    break;
                }
            }
        });
        self.adapters.push(handle);
    }

    /// Abort timers and stream adapters; used on stop and restart
    pub(crate) fn cancel_background(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
        for handle in self.adapters.drain(..) {
            handle.abort();
        }
    }
}
