//! Cluster Transport
//!
//! Node-to-node delivery of opaque byte frames on named channels. Delivery is
//! best effort: frames to crashed, partitioned or removed nodes are dropped.
//! Handlers run on the sender's task and must not block; they normally just
//! enqueue a message into an actor mailbox.

use crate::error::Result;
use crate::member::NodeAddress;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

/// Receives `(sender, frame)` for one channel
pub type InboundHandler = Arc<dyn Fn(NodeAddress, Vec<u8>) + Send + Sync>;

pub trait ClusterTransport: Send + Sync + 'static {
    /// Register the handler for a channel; a channel has at most one handler
    fn register(&self, channel: &str, handler: InboundHandler) -> Result<()>;

    fn unregister(&self, channel: &str);

    fn send(&self, to: &NodeAddress, channel: &str, frame: Vec<u8>) -> Result<()>;
}

/// Anything that can be carried between nodes
pub trait WireMessage: Serialize + DeserializeOwned + Send + 'static {}

impl<T: Serialize + DeserializeOwned + Send + 'static> WireMessage for T {}

pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub fn decode_frame<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(frame)?)
}
