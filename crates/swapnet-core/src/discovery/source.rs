//! Discovery source abstraction

use std::collections::HashMap;

use async_trait::async_trait;
use swapnet_network::PeerId;
use tokio::sync::mpsc;

use crate::error::CoreResult;
use crate::registry::PeerType;

/// A peer reported by a discovery source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundPeer {
    pub peer_id: PeerId,
    pub peer_type: PeerType,
    pub metadata: HashMap<String, String>,
}

impl FoundPeer {
    pub fn new(peer_id: PeerId, peer_type: PeerType) -> Self {
        Self {
            peer_id,
            peer_type,
            metadata: HashMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Where sources deliver the peers they find
pub type FoundPeerSink = mpsc::UnboundedSender<FoundPeer>;

/// One mechanism for learning about peers
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Name used in logs and error events
    fn name(&self) -> &str;

    /// Type recorded for peers this source finds
    fn peer_type(&self) -> PeerType;

    /// Begin discovering; found peers go to `sink`
    async fn start(&self, sink: FoundPeerSink) -> CoreResult<()>;

    /// Actively look for more peers (called on each discovery tick)
    async fn announce(&self) -> CoreResult<()>;

    async fn stop(&self);
}
