//! Local Subscription Registry
//!
//! Maps topic patterns to the sinks of subscribers on this node. Patterns:
//!
//! - exact: `"chat.room-1"`
//! - prefix wildcard: `"chat.*"` matches `"chat.room-1"` and `"chat.lobby.x"`
//! - global: `"*"` matches every topic
//!
//! A sink whose receiver has been dropped is removed on the next delivery
//! attempt. Subscriptions are never replicated to other nodes.

use crate::event::Delivery;
use dashmap::DashMap;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

pub type DeliverySink<E> = mpsc::UnboundedSender<Delivery<E>>;

pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix(".*") {
        Some(prefix) => topic
            .strip_prefix(prefix)
            .map(|rest| rest.starts_with('.'))
            .unwrap_or(false),
        None => pattern == topic,
    }
}

pub struct TopicRegistry<E> {
    /// pattern -> subscriber id -> sink
    subscriptions: DashMap<String, HashMap<String, DeliverySink<E>>>,
}

impl<E> Default for TopicRegistry<E> {
    fn default() -> Self {
        Self {
            subscriptions: DashMap::new(),
        }
    }
}

impl<E> TopicRegistry<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when an existing subscription with the same id was replaced
    pub fn subscribe(&self, pattern: &str, subscriber_id: &str, sink: DeliverySink<E>) -> bool {
        self.subscriptions
            .entry(pattern.to_string())
            .or_default()
            .insert(subscriber_id.to_string(), sink)
            .is_some()
    }

    pub fn unsubscribe(&self, pattern: &str, subscriber_id: &str) -> bool {
        let removed = match self.subscriptions.get_mut(pattern) {
            Some(mut subscribers) => subscribers.remove(subscriber_id).is_some(),
            None => false,
        };
        self.subscriptions
            .remove_if(pattern, |_, subscribers| subscribers.is_empty());
        removed
    }

    /// Deliver to one subscriber; a closed sink is removed
    pub fn send_to(&self, pattern: &str, subscriber_id: &str, delivery: Delivery<E>) -> bool {
        let sent = self
            .subscriptions
            .get(pattern)
            .and_then(|subscribers| subscribers.get(subscriber_id).map(|sink| sink.send(delivery).is_ok()));
        match sent {
            Some(true) => true,
            Some(false) => {
                debug!(topic = pattern, subscriber = subscriber_id, "Sink closed, removing subscriber");
                self.unsubscribe(pattern, subscriber_id);
                false
            }
            None => false,
        }
    }

    /// Deliver to every subscriber whose pattern matches `topic`; returns the number reached
    pub fn deliver(&self, topic: &str, delivery: &Delivery<E>) -> usize {
        self.deliver_where(|pattern| topic_matches(pattern, topic), delivery)
    }

    /// Deliver to every local subscriber regardless of topic
    pub fn broadcast(&self, delivery: &Delivery<E>) -> usize {
        self.deliver_where(|_| true, delivery)
    }

    fn deliver_where(&self, mut accept: impl FnMut(&str) -> bool, delivery: &Delivery<E>) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        for entry in self.subscriptions.iter() {
            if !accept(entry.key()) {
                continue;
            }
            for (subscriber_id, sink) in entry.value() {
                if sink.send(delivery.clone()).is_ok() {
                    delivered += 1;
                } else {
                    closed.push((entry.key().clone(), subscriber_id.clone()));
                }
            }
        }
        for (pattern, subscriber_id) in closed {
            debug!(topic = %pattern, subscriber = %subscriber_id, "Sink closed, removing subscriber");
            self.unsubscribe(&pattern, &subscriber_id);
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn topic_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// `(pattern, subscriber id)` pairs, sorted
    pub fn subscribers(&self) -> Vec<(String, String)> {
        let mut all: Vec<(String, String)> = self
            .subscriptions
            .iter()
            .flat_map(|entry| {
                let pattern = entry.key().clone();
                entry
                    .value()
                    .keys()
                    .map(move |id| (pattern.clone(), id.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        all.sort();
        all
    }
}
