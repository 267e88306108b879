//! Actor Registry
//!
//! Actor identity, hierarchical paths, and the per-parent table of live
//! children. There is no process-wide registry: every actor cell owns the
//! names of its own children.

use crate::error::{ActorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Unique actor identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActorId {
    id: Uuid,
}

impl ActorId {
    /// Create new actor ID
    pub fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }

    /// Get UUID
    pub fn uuid(&self) -> Uuid {
        self.id
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "actor-{}", self.id.simple())
    }
}

impl Default for ActorId {
    fn default() -> Self {
        Self::new()
    }
}

/// Slash-separated location of an actor in the supervision tree, e.g. `/user/room/alice`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorPath(String);

impl ActorPath {
    /// Guardian of all user-spawned actors
    pub(crate) fn user_root() -> Self {
        Self("/user".to_string())
    }

    /// Path of a child with the given name
    pub fn child(&self, name: &str) -> Result<Self> {
        validate_name(name)?;
        Ok(Self(format!("{}/{}", self.0, name)))
    }

    /// Last path segment
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of segments below the root
    pub fn depth(&self) -> usize {
        self.0.matches('/').count().saturating_sub(1)
    }
}

impl fmt::Display for ActorPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ActorError::configuration(
            "Actor name must not be empty",
            Some("name"),
        ));
    }
    if name.contains('/') || name.chars().any(char::is_whitespace) {
        return Err(ActorError::configuration(
            format!("Actor name '{}' contains '/' or whitespace", name),
            Some("name"),
        ));
    }
    Ok(())
}

/// Live children of one actor, keyed by name
#[derive(Debug)]
pub(crate) struct Children<T> {
    by_name: BTreeMap<String, Arc<T>>,
}

impl<T> Default for Children<T> {
    fn default() -> Self {
        Self {
            by_name: BTreeMap::new(),
        }
    }
}

impl<T> Children<T> {
    /// Reserve a name; fails while a live sibling holds it
    pub(crate) fn reserve(&mut self, parent: &ActorPath, name: &str, child: Arc<T>) -> Result<()> {
        if self.by_name.contains_key(name) {
            tracing::debug!(parent = %parent, name = name, "Child name already taken");
            return Err(ActorError::name_conflict(name, parent.as_str()));
        }
        self.by_name.insert(name.to_string(), child);
        Ok(())
    }

    /// Remove a child only if the entry still refers to the same cell
    pub(crate) fn release(&mut self, name: &str, child: &Arc<T>) -> bool {
        match self.by_name.get(name) {
            Some(current) if Arc::ptr_eq(current, child) => {
                self.by_name.remove(name);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<T>> {
        self.by_name.values().cloned().collect()
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.by_name.keys().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_name.len()
    }
}
