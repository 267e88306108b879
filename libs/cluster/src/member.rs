//! Cluster Members
//!
//! Addresses, lifecycle status and the membership events nodes observe.

use crate::error::ClusterError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Network identity of a node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NodeAddress {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ClusterError::InvalidAddress {
            address: s.to_string(),
            reason: reason.to_string(),
        };
        let (host, port) = s.rsplit_once(':').ok_or_else(|| invalid("expected host:port"))?;
        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        let port = port.parse::<u16>().map_err(|_| invalid("invalid port"))?;
        Ok(Self::new(host, port))
    }
}

/// Member lifecycle; only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MemberStatus {
    Joining,
    Up,
    Leaving,
    Down,
    Removed,
}

impl MemberStatus {
    /// Down or Removed: the member can never host anything again
    pub fn is_terminal(&self) -> bool {
        matches!(self, MemberStatus::Down | MemberStatus::Removed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub address: NodeAddress,
    pub status: MemberStatus,
    pub roles: BTreeSet<String>,
    /// Join order assigned when the member became Up; 0 before that
    pub up_number: u64,
}

impl Member {
    pub fn new(address: NodeAddress, status: MemberStatus) -> Self {
        Self {
            address,
            status,
            roles: BTreeSet::new(),
            up_number: 0,
        }
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_up_number(mut self, up_number: u64) -> Self {
        self.up_number = up_number;
        self
    }

    /// `None` matches every member
    pub fn has_role(&self, role: Option<&str>) -> bool {
        role.map(|r| self.roles.contains(r)).unwrap_or(true)
    }

    /// Total "age" order: lower up-number first, address breaks ties
    pub fn age_cmp(&self, other: &Member) -> Ordering {
        (self.up_number, &self.address).cmp(&(other.up_number, &other.address))
    }

    pub fn is_older_than(&self, other: &Member) -> bool {
        self.age_cmp(other) == Ordering::Less
    }
}

/// Membership change as published by the membership oracle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipEvent {
    MemberJoined(Member),
    MemberUp(Member),
    MemberLeft(Member),
    MemberDowned(Member),
    MemberRemoved(Member),
    UnreachableMember(Member),
    ReachableMember(Member),
}

impl MembershipEvent {
    pub fn member(&self) -> &Member {
        match self {
            MembershipEvent::MemberJoined(m)
            | MembershipEvent::MemberUp(m)
            | MembershipEvent::MemberLeft(m)
            | MembershipEvent::MemberDowned(m)
            | MembershipEvent::MemberRemoved(m)
            | MembershipEvent::UnreachableMember(m)
            | MembershipEvent::ReachableMember(m) => m,
        }
    }

    /// Status this event moves the member to; reachability events carry none
    pub fn status(&self) -> Option<MemberStatus> {
        match self {
            MembershipEvent::MemberJoined(_) => Some(MemberStatus::Joining),
            MembershipEvent::MemberUp(_) => Some(MemberStatus::Up),
            MembershipEvent::MemberLeft(_) => Some(MemberStatus::Leaving),
            MembershipEvent::MemberDowned(_) => Some(MemberStatus::Down),
            MembershipEvent::MemberRemoved(_) => Some(MemberStatus::Removed),
            MembershipEvent::UnreachableMember(_) | MembershipEvent::ReachableMember(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MembershipEvent::MemberJoined(_) => "member_joined",
            MembershipEvent::MemberUp(_) => "member_up",
            MembershipEvent::MemberLeft(_) => "member_left",
            MembershipEvent::MemberDowned(_) => "member_downed",
            MembershipEvent::MemberRemoved(_) => "member_removed",
            MembershipEvent::UnreachableMember(_) => "unreachable_member",
            MembershipEvent::ReachableMember(_) => "reachable_member",
        }
    }
}
