//! Rendezvous discovery
//!
//! Registers with every configured signaling server and reports the sender
//! of each envelope the servers deliver.

use std::sync::Arc;

use async_trait::async_trait;
use swapnet_network::{PeerId, SignalingChannel, SignalingConnector, SignalingMessage};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::source::{DiscoverySource, FoundPeer, FoundPeerSink};
use crate::error::{CoreError, CoreResult};
use crate::registry::PeerType;

struct ServerLink {
    server: String,
    channel: Arc<dyn SignalingChannel>,
    reader: JoinHandle<()>,
}

pub struct RendezvousDiscovery {
    local_id: PeerId,
    servers: Vec<String>,
    connector: Arc<dyn SignalingConnector>,
    links: Mutex<Vec<ServerLink>>,
}

impl RendezvousDiscovery {
    pub fn new(local_id: PeerId, servers: Vec<String>, connector: Arc<dyn SignalingConnector>) -> Self {
        Self {
            local_id,
            servers,
            connector,
            links: Mutex::new(Vec::new()),
        }
    }

    /// Servers currently connected
    pub async fn connected_servers(&self) -> Vec<String> {
        self.links.lock().await.iter().map(|l| l.server.clone()).collect()
    }

    fn spawn_reader(
        &self,
        server: String,
        channel: Arc<dyn SignalingChannel>,
        sink: FoundPeerSink,
    ) -> JoinHandle<()> {
        let local_id = self.local_id.clone();
        tokio::spawn(async move {
            while let Some(msg) = channel.recv().await {
                if let SignalingMessage::Error(payload) = &msg {
                    warn!("Signaling server {} reported: {}", server, payload.message);
                    continue;
                }
                let Some(from) = msg.sender() else { continue };
                if from == &local_id {
                    continue;
                }
                debug!("Rendezvous {} saw {} from {}", server, msg.type_name(), from);
                let found = FoundPeer::new(from.clone(), PeerType::Rendezvous)
                    .with_meta("signaling_server", server.clone());
                if sink.send(found).is_err() {
                    break;
                }
            }
            debug!("Signaling channel to {} closed", server);
        })
    }
}

#[async_trait]
impl DiscoverySource for RendezvousDiscovery {
    fn name(&self) -> &str {
        "rendezvous"
    }

    fn peer_type(&self) -> PeerType {
        PeerType::Rendezvous
    }

    async fn start(&self, sink: FoundPeerSink) -> CoreResult<()> {
        let mut links = self.links.lock().await;
        let mut last_error = None;

        for server in &self.servers {
            if links.iter().any(|l| &l.server == server) {
                continue;
            }
            let channel: Arc<dyn SignalingChannel> = match self.connector.connect(server).await {
                Ok(channel) => Arc::from(channel),
                Err(e) => {
                    warn!("Failed to reach signaling server {}: {}", server, e);
                    last_error = Some(e.to_string());
                    continue;
                }
            };
            if let Err(e) = channel.send(SignalingMessage::register(self.local_id.clone())).await {
                warn!("Failed to register with {}: {}", server, e);
                last_error = Some(e.to_string());
                channel.close().await;
                continue;
            }

            info!("Registered with signaling server {}", server);
            let reader = self.spawn_reader(server.clone(), channel.clone(), sink.clone());
            links.push(ServerLink {
                server: server.clone(),
                channel,
                reader,
            });
        }

        if links.is_empty() && !self.servers.is_empty() {
            return Err(CoreError::DiscoverySource {
                source_name: self.name().to_string(),
                message: last_error.unwrap_or_else(|| "no signaling server reachable".into()),
            });
        }
        Ok(())
    }

    async fn announce(&self) -> CoreResult<()> {
        let links = self.links.lock().await;
        for link in links.iter() {
            if let Err(e) = link
                .channel
                .send(SignalingMessage::register(self.local_id.clone()))
                .await
            {
                warn!("Re-register with {} failed: {}", link.server, e);
            }
        }
        Ok(())
    }

    async fn stop(&self) {
        let links: Vec<ServerLink> = self.links.lock().await.drain(..).collect();
        for link in links {
            link.reader.abort();
            link.channel.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swapnet_network::MemorySignaling;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_rendezvous_reports_other_peers() {
        let hub = MemorySignaling::new();
        hub.add_server("memory://rv");

        let a = RendezvousDiscovery::new(PeerId::new("a"), vec!["memory://rv".into()], Arc::new(hub.clone()));
        let b = RendezvousDiscovery::new(PeerId::new("b"), vec!["memory://rv".into()], Arc::new(hub.clone()));

        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        a.start(a_tx).await.unwrap();
        b.start(b_tx).await.unwrap();

        let found_by_a = a_rx.recv().await.unwrap();
        assert_eq!(found_by_a.peer_id, PeerId::new("b"));
        assert_eq!(found_by_a.peer_type, PeerType::Rendezvous);
        assert_eq!(found_by_a.metadata["signaling_server"], "memory://rv");
        assert_eq!(b_rx.recv().await.unwrap().peer_id, PeerId::new("a"));

        a.stop().await;
        b.stop().await;
        assert!(hub.registered("memory://rv").is_empty());
    }

    #[tokio::test]
    async fn test_one_dead_server_does_not_stop_others() {
        let hub = MemorySignaling::new();
        hub.add_server("memory://up");

        let source = RendezvousDiscovery::new(
            PeerId::new("a"),
            vec!["memory://down".into(), "memory://up".into()],
            Arc::new(hub.clone()),
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        source.start(tx).await.unwrap();
        assert_eq!(source.connected_servers().await, vec!["memory://up".to_string()]);
    }

    #[tokio::test]
    async fn test_all_servers_down_is_error() {
        let hub = MemorySignaling::new();
        let source = RendezvousDiscovery::new(
            PeerId::new("a"),
            vec!["memory://down".into()],
            Arc::new(hub),
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            source.start(tx).await,
            Err(CoreError::DiscoverySource { .. })
        ));
    }
}
