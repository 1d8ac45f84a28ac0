//! Peer Registry
//!
//! Single source of truth for every peer the node has heard of. Plain
//! storage: the discovery engine is the only writer, everybody else gets
//! cloned snapshots.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use swapnet_network::PeerId;
use tokio::sync::RwLock;

/// How a peer was learned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerType {
    Bootstrap,
    Rendezvous,
    DistributedLookup,
    LocalNetwork,
    /// Requested by the user; never reconnected automatically
    Manual,
}

impl PeerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerType::Bootstrap => "bootstrap",
            PeerType::Rendezvous => "rendezvous",
            PeerType::DistributedLookup => "distributed_lookup",
            PeerType::LocalNetwork => "local_network",
            PeerType::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

/// Everything known about one peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub peer_type: PeerType,
    pub status: PeerStatus,
    pub last_seen: DateTime<Utc>,
    pub latency: Option<Duration>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl PeerInfo {
    pub fn new(peer_id: PeerId, peer_type: PeerType, status: PeerStatus) -> Self {
        Self {
            peer_id,
            peer_type,
            status,
            last_seen: Utc::now(),
            latency: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.status == PeerStatus::Connected
    }
}

#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerId, PeerInfo>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a peer record
    pub async fn upsert(&self, info: PeerInfo) {
        self.peers.write().await.insert(info.peer_id.clone(), info);
    }

    /// Insert only if the peer is unknown; returns whether it was inserted
    pub async fn insert_new(&self, info: PeerInfo) -> bool {
        let mut peers = self.peers.write().await;
        if peers.contains_key(&info.peer_id) {
            return false;
        }
        peers.insert(info.peer_id.clone(), info);
        true
    }

    pub async fn get(&self, id: &PeerId) -> Option<PeerInfo> {
        self.peers.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &PeerId) -> bool {
        self.peers.read().await.contains_key(id)
    }

    pub async fn status(&self, id: &PeerId) -> Option<PeerStatus> {
        self.peers.read().await.get(id).map(|p| p.status)
    }

    /// Change a peer's status, touching `last_seen`; returns the previous status
    pub async fn set_status(&self, id: &PeerId, status: PeerStatus) -> Option<PeerStatus> {
        let mut peers = self.peers.write().await;
        let peer = peers.get_mut(id)?;
        let previous = peer.status;
        peer.status = status;
        peer.last_seen = Utc::now();
        Some(previous)
    }

    /// Apply `f` to a peer record; returns the updated snapshot
    pub async fn update<F>(&self, id: &PeerId, f: F) -> Option<PeerInfo>
    where
        F: FnOnce(&mut PeerInfo),
    {
        let mut peers = self.peers.write().await;
        let peer = peers.get_mut(id)?;
        f(peer);
        Some(peer.clone())
    }

    pub async fn list_all(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn list_by_status(&self, status: PeerStatus) -> Vec<PeerInfo> {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| p.status == status)
            .cloned()
            .collect()
    }

    pub async fn list_connected(&self) -> Vec<PeerInfo> {
        self.list_by_status(PeerStatus::Connected).await
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str, status: PeerStatus) -> PeerInfo {
        PeerInfo::new(PeerId::new(id), PeerType::Bootstrap, status)
    }

    #[tokio::test]
    async fn test_registry_queries() {
        let registry = PeerRegistry::new();
        registry.upsert(peer("a", PeerStatus::Connected)).await;
        registry.upsert(peer("b", PeerStatus::Disconnected)).await;
        registry.upsert(peer("c", PeerStatus::Connected)).await;

        assert_eq!(registry.len().await, 3);
        assert_eq!(registry.list_connected().await.len(), 2);
        assert_eq!(registry.list_by_status(PeerStatus::Disconnected).await.len(), 1);
        assert!(registry.list_by_status(PeerStatus::Failed).await.is_empty());
        assert!(registry.get(&PeerId::new("zz")).await.is_none());
    }

    #[tokio::test]
    async fn test_insert_new_keeps_first_seen() {
        let registry = PeerRegistry::new();
        let mut first = peer("a", PeerStatus::Disconnected);
        first.metadata.insert("source".into(), "first".into());
        assert!(registry.insert_new(first).await);

        let mut second = peer("a", PeerStatus::Disconnected);
        second.metadata.insert("source".into(), "second".into());
        assert!(!registry.insert_new(second).await);

        let stored = registry.get(&PeerId::new("a")).await.unwrap();
        assert_eq!(stored.metadata["source"], "first");
    }

    #[tokio::test]
    async fn test_set_status_returns_previous() {
        let registry = PeerRegistry::new();
        registry.upsert(peer("a", PeerStatus::Connecting)).await;

        let previous = registry.set_status(&PeerId::new("a"), PeerStatus::Connected).await;
        assert_eq!(previous, Some(PeerStatus::Connecting));
        assert_eq!(registry.status(&PeerId::new("a")).await, Some(PeerStatus::Connected));
        assert_eq!(registry.set_status(&PeerId::new("x"), PeerStatus::Failed).await, None);
    }

    #[tokio::test]
    async fn test_update_returns_snapshot() {
        let registry = PeerRegistry::new();
        registry.upsert(peer("a", PeerStatus::Connected)).await;

        let updated = registry
            .update(&PeerId::new("a"), |p| p.latency = Some(Duration::from_millis(12)))
            .await
            .unwrap();
        assert_eq!(updated.latency, Some(Duration::from_millis(12)));
    }
}
