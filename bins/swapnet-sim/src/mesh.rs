//! In-process mesh
//!
//! Wires exchange nodes, relay servers and a rendezvous server together over
//! the memory transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use swapnet_core::{DiscoveryEvent, NetworkContext, PeerPath, RelayEvent, RelayServer};
use swapnet_network::{MemoryNetwork, MemorySignaling, PeerId};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{SimConfig, RENDEZVOUS_URL};

/// One exchange node in the mesh
pub struct SimNode {
    pub id: PeerId,
    pub behind_nat: bool,
    pub context: NetworkContext,
    pub direct_received: Arc<AtomicUsize>,
    pub relayed_received: Arc<AtomicUsize>,
}

/// Outcome of one delivery attempt
#[derive(Debug, Clone)]
pub struct Delivery {
    pub from: PeerId,
    pub to: PeerId,
    pub path: Option<PeerPath>,
    pub sent: bool,
}

pub struct Mesh {
    network: MemoryNetwork,
    relays: Vec<Arc<RelayServer>>,
    nodes: Vec<SimNode>,
    /// Last working path per (sender, receiver)
    paths: Mutex<HashMap<(PeerId, PeerId), PeerPath>>,
}

impl Mesh {
    /// Build the mesh. Nothing is started yet.
    pub fn build(config: &SimConfig) -> Result<Self> {
        let network = MemoryNetwork::new();
        let signaling = MemorySignaling::new();
        signaling.add_server(RENDEZVOUS_URL);

        let relays: Vec<Arc<RelayServer>> = (0..config.simulation.relays)
            .map(|i| {
                let server = RelayServer::with_bandwidth(
                    format!("relay-{}", i),
                    config.simulation.relay_bandwidth,
                );
                server.serve(network.listen(server.address()));
                server
            })
            .collect();
        let relay_addresses: Vec<String> = relays.iter().map(|r| r.address().to_string()).collect();

        let mut nodes = Vec::with_capacity(config.simulation.nodes);
        for i in 0..config.simulation.nodes {
            let id = PeerId::new(format!("node-{}", i));
            let behind_nat = i < config.simulation.nat_nodes;

            let context = NetworkContext::with_signaling(
                id.clone(),
                config.network_config(relay_addresses.clone()),
                Arc::new(network.transport(id.clone())),
                Arc::new(signaling.clone()),
            )
            .with_context(|| format!("Failed to create {}", id))?;

            // A node behind NAT can dial out but is never reachable directly
            if !behind_nat {
                context.accept_from(network.listen(&id));
            }

            let direct_received = Arc::new(AtomicUsize::new(0));
            let counter = direct_received.clone();
            context.discovery().events().on(move |event| {
                if let DiscoveryEvent::MessageReceived { .. } = event.kind {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            });

            let relayed_received = Arc::new(AtomicUsize::new(0));
            let counter = relayed_received.clone();
            context.relay().events().on(move |event| {
                if let RelayEvent::MessageReceived { .. } = event.kind {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            });

            nodes.push(SimNode {
                id,
                behind_nat,
                context,
                direct_received,
                relayed_received,
            });
        }

        Ok(Self {
            network,
            relays,
            nodes,
            paths: Mutex::new(HashMap::new()),
        })
    }

    pub fn nodes(&self) -> &[SimNode] {
        &self.nodes
    }

    pub async fn start(&self) {
        for node in &self.nodes {
            node.context.start().await;
        }
        info!(
            "Mesh up: {} nodes, {} relays",
            self.nodes.len(),
            self.relays.len()
        );
    }

    /// Every node sends one order to the next node in the ring
    pub async fn exchange_round(&self, round: usize) -> Vec<Delivery> {
        let mut deliveries = Vec::with_capacity(self.nodes.len());
        for (i, node) in self.nodes.iter().enumerate() {
            let target = &self.nodes[(i + 1) % self.nodes.len()];
            let order = serde_json::json!({
                "type": "order",
                "round": round,
                "from": node.id,
            });

            let key = (node.id.clone(), target.id.clone());
            let cached = self.paths.lock().await.get(&key).cloned();
            if let Some(path) = cached {
                if node.context.send(&path, &order).await {
                    deliveries.push(Delivery {
                        from: node.id.clone(),
                        to: target.id.clone(),
                        path: Some(path),
                        sent: true,
                    });
                    continue;
                }
                debug!("Path {} -> {} went stale", node.id, target.id);
                self.paths.lock().await.remove(&key);
            }

            let delivery = match node.context.reach_peer(target.id.clone()).await {
                Ok(path) => {
                    let sent = node.context.send(&path, &order).await;
                    if sent {
                        self.paths.lock().await.insert(key, path.clone());
                    }
                    Delivery {
                        from: node.id.clone(),
                        to: target.id.clone(),
                        path: Some(path),
                        sent,
                    }
                }
                Err(e) => {
                    warn!("{} cannot reach {}: {}", node.id, target.id, e);
                    Delivery {
                        from: node.id.clone(),
                        to: target.id.clone(),
                        path: None,
                        sent: false,
                    }
                }
            };
            deliveries.push(delivery);
        }
        deliveries
    }

    /// Relayed routes currently open across all nodes
    pub async fn relayed_routes(&self) -> usize {
        let mut total = 0;
        for node in &self.nodes {
            total += node.context.relay().active_routes().await.len();
        }
        total
    }

    pub async fn stop(&self) {
        for node in &self.nodes {
            node.context.stop().await;
        }
        for relay in &self.relays {
            relay.shutdown().await;
        }
        info!(
            "Mesh stopped after {} dials",
            self.nodes
                .iter()
                .map(|n| self.network.dial_count(&n.id))
                .sum::<usize>()
        );
    }

    /// Give in-flight frames a moment to land
    pub async fn settle(&self, period: Duration) {
        tokio::time::sleep(period).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> SimConfig {
        let mut config = SimConfig::default();
        config.simulation.nodes = 3;
        config.simulation.nat_nodes = 1;
        config.discovery.connection_timeout_ms = 100;
        config.relay.connection_timeout_ms = 100;
        config
    }

    #[tokio::test]
    async fn test_mesh_round_reaches_every_node() {
        let mesh = Mesh::build(&quick_config()).unwrap();
        mesh.start().await;
        mesh.settle(Duration::from_millis(300)).await;

        let deliveries = mesh.exchange_round(0).await;
        assert_eq!(deliveries.len(), 3);
        assert!(deliveries.iter().all(|d| d.sent && d.path.is_some()));

        mesh.settle(Duration::from_millis(100)).await;
        let received: usize = mesh
            .nodes()
            .iter()
            .map(|n| {
                n.direct_received.load(Ordering::Relaxed) + n.relayed_received.load(Ordering::Relaxed)
            })
            .sum();
        assert_eq!(received, 3);

        mesh.stop().await;
    }

    #[tokio::test]
    async fn test_later_rounds_reuse_paths() {
        let mut config = quick_config();
        config.simulation.nodes = 4;
        let mesh = Mesh::build(&config).unwrap();
        mesh.start().await;
        mesh.settle(Duration::from_millis(300)).await;

        let first = mesh.exchange_round(0).await;
        assert!(first.iter().all(|d| d.sent));
        let routes = mesh.relayed_routes().await;

        for round in 1..4 {
            let deliveries = mesh.exchange_round(round).await;
            assert!(deliveries.iter().all(|d| d.sent));
            for (before, after) in first.iter().zip(&deliveries) {
                assert_eq!(before.path, after.path);
            }
        }
        assert_eq!(mesh.relayed_routes().await, routes);

        mesh.stop().await;
    }
}
