//! Peer exchange messages
//!
//! Sent over direct connections when distributed lookup is enabled. A node
//! asks its connected peers for the peers they are connected to and reports
//! every answer as a distributed-lookup peer.

use serde::{Deserialize, Serialize};
use swapnet_network::PeerId;

/// Default number of peers asked for per request
pub const DEFAULT_EXCHANGE_LIMIT: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscoveryMessage {
    PeerExchangeRequest { limit: usize },
    PeerExchangeResponse { peers: Vec<PeerId> },
}

impl DiscoveryMessage {
    /// Parse a frame, returning `None` for anything that is not a discovery message
    pub fn parse(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }
}
