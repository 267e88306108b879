//! Cluster collaborators of one node

use crate::member::NodeAddress;
use crate::membership::MembershipOracle;
use crate::transport::ClusterTransport;
use std::fmt;
use std::sync::Arc;

/// Membership oracle and transport used by every cluster service on a node
#[derive(Clone)]
pub struct ClusterNode {
    oracle: Arc<dyn MembershipOracle>,
    transport: Arc<dyn ClusterTransport>,
}

impl ClusterNode {
    pub fn new(oracle: Arc<dyn MembershipOracle>, transport: Arc<dyn ClusterTransport>) -> Self {
        Self { oracle, transport }
    }

    pub fn oracle(&self) -> &Arc<dyn MembershipOracle> {
        &self.oracle
    }

    pub fn transport(&self) -> &Arc<dyn ClusterTransport> {
        &self.transport
    }

    pub fn self_address(&self) -> NodeAddress {
        self.oracle.self_address()
    }
}

impl fmt::Debug for ClusterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterNode")
            .field("address", &self.self_address())
            .finish()
    }
}
