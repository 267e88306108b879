//! Supervision
//!
//! Strategies applied when an actor fails while handling a message, and the
//! restart window that bounds how often an actor may be restarted before the
//! failure escalates to its parent.

use crate::error::ActorError;
use node_config::SupervisionConfig;
use std::time::{Duration, Instant};

/// Supervision directive for error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorDirective {
    /// Keep the current behavior and state, continue with the next message
    Resume,
    /// Replace the behavior with a fresh one from the actor's factory
    Restart,
    /// Stop the actor
    Stop,
    /// Stop the actor and let the parent handle the failure as its own
    Escalate,
}

/// Decision rule attached to an actor when it is spawned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorStrategy {
    directive: SupervisorDirective,
    max_restarts: u32,
    within: Duration,
}

impl SupervisorStrategy {
    pub fn restart() -> Self {
        Self {
            directive: SupervisorDirective::Restart,
            ..Self::default()
        }
    }

    pub fn resume() -> Self {
        Self {
            directive: SupervisorDirective::Resume,
            ..Self::default()
        }
    }

    pub fn stop() -> Self {
        Self {
            directive: SupervisorDirective::Stop,
            ..Self::default()
        }
    }

    pub fn escalate() -> Self {
        Self {
            directive: SupervisorDirective::Escalate,
            ..Self::default()
        }
    }

    /// Restart at most `max_restarts` times within `within`, then escalate
    pub fn with_restart_limit(mut self, max_restarts: u32, within: Duration) -> Self {
        self.max_restarts = max_restarts;
        self.within = within;
        self
    }

    pub fn decide(&self, _error: &ActorError) -> SupervisorDirective {
        self.directive
    }

    pub fn max_restarts(&self) -> u32 {
        self.max_restarts
    }

    pub fn within(&self) -> Duration {
        self.within
    }

    pub(crate) fn restart_window(&self) -> RestartWindow {
        RestartWindow::new(self.max_restarts, self.within)
    }
}

impl Default for SupervisorStrategy {
    fn default() -> Self {
        Self {
            directive: SupervisorDirective::Restart,
            max_restarts: 5,
            within: Duration::from_secs(60),
        }
    }
}

impl From<&SupervisionConfig> for SupervisorStrategy {
    fn from(config: &SupervisionConfig) -> Self {
        Self::restart()
            .with_restart_limit(config.max_restarts, Duration::from_secs(config.within_secs))
    }
}

/// Counts restarts inside a sliding time window
#[derive(Debug)]
pub(crate) struct RestartWindow {
    restart_count: u32,
    max_restarts: u32,
    window: Duration,
    window_start: Option<Instant>,
}

impl RestartWindow {
    pub(crate) fn new(max_restarts: u32, window: Duration) -> Self {
        Self {
            restart_count: 0,
            max_restarts,
            window,
            window_start: None,
        }
    }

    /// Record a restart attempt; false once the limit for this window is used up
    pub(crate) fn should_restart(&mut self) -> bool {
        self.should_restart_at(Instant::now())
    }

    fn should_restart_at(&mut self, now: Instant) -> bool {
        if self.max_restarts == 0 {
            return false;
        }
        match self.window_start {
            Some(start) if now.duration_since(start) <= self.window => {
                self.restart_count += 1;
                self.restart_count <= self.max_restarts
            }
            _ => {
                // first restart, or the previous window expired
                self.window_start = Some(now);
                self.restart_count = 1;
                true
            }
        }
    }

    pub(crate) fn restart_count(&self) -> u32 {
        self.restart_count
    }

    pub(crate) fn max_restarts(&self) -> u32 {
        self.max_restarts
    }
}
