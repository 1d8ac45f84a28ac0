//! Relay server
//!
//! The relay side of the route protocol: accepts sessions from nodes and
//! forwards route traffic between the two ends of each route.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use swapnet_network::{encode_frame, DataChannel, IncomingChannel, PeerId};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::message::RelayMessage;
use super::RouteId;

/// Both ends of a forwarded route
#[derive(Debug, Clone, PartialEq, Eq)]
struct RouteEnds {
    source: PeerId,
    target: PeerId,
}

impl RouteEnds {
    fn other(&self, id: &PeerId) -> Option<&PeerId> {
        if id == &self.source {
            Some(&self.target)
        } else if id == &self.target {
            Some(&self.source)
        } else {
            None
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct RelayServer {
    address: PeerId,
    /// Advertised to nodes in successful route responses
    bandwidth: Option<u64>,
    clients: RwLock<HashMap<PeerId, Arc<dyn DataChannel>>>,
    routes: RwLock<HashMap<RouteId, RouteEnds>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayServer {
    pub fn new(address: impl Into<PeerId>) -> Arc<Self> {
        Self::with_bandwidth(address, None)
    }

    pub fn with_bandwidth(address: impl Into<PeerId>, bandwidth: Option<u64>) -> Arc<Self> {
        Arc::new(Self {
            address: address.into(),
            bandwidth,
            clients: RwLock::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn address(&self) -> &PeerId {
        &self.address
    }

    /// Serve sessions from `incoming` until shut down
    pub fn serve(self: &Arc<Self>, mut incoming: mpsc::UnboundedReceiver<IncomingChannel>) {
        info!("Relay {} serving", self.address);
        let weak = Arc::downgrade(self);
        let acceptor = tokio::spawn(async move {
            while let Some(session) = incoming.recv().await {
                let Some(server) = weak.upgrade() else { break };
                server.attach(session).await;
            }
        });
        lock(&self.tasks).push(acceptor);
    }

    async fn attach(self: &Arc<Self>, session: IncomingChannel) {
        let client = session.remote;
        let channel: Arc<dyn DataChannel> = Arc::from(session.channel);

        let previous = self
            .clients
            .write()
            .await
            .insert(client.clone(), channel.clone());
        if let Some(previous) = previous {
            debug!("Client {} reconnected, closing old session", client);
            previous.close().await;
        }
        info!("Relay {} attached client {}", self.address, client);

        let reader = tokio::spawn(Self::read_client(Arc::downgrade(self), client, channel));
        lock(&self.tasks).push(reader);
    }

    async fn read_client(weak: Weak<Self>, client: PeerId, channel: Arc<dyn DataChannel>) {
        if let Err(e) = channel.opened().await {
            warn!("Session from {} never opened: {}", client, e);
        } else {
            while let Some(frame) = channel.recv().await {
                let Some(server) = weak.upgrade() else { return };
                server.handle_frame(&client, frame).await;
            }
        }

        if let Some(server) = weak.upgrade() {
            server.detach(&client, &channel).await;
        }
    }

    async fn handle_frame(&self, from: &PeerId, frame: Bytes) {
        let msg: RelayMessage = match serde_json::from_slice(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Malformed frame from {}: {}", from, e);
                return;
            }
        };
        trace!("Relay {} got {} from {}", self.address, msg.type_name(), from);

        match msg {
            RelayMessage::RouteRequest {
                route_id,
                target_peer_id,
                ..
            } => {
                if !self.clients.read().await.contains_key(&target_peer_id) {
                    debug!("Route {} target {} not attached", route_id, target_peer_id);
                    let reply = RelayMessage::rejected(
                        route_id,
                        format!("peer {} is not attached to this relay", target_peer_id),
                    );
                    self.send_to(from, &reply).await;
                    return;
                }
                self.routes.write().await.insert(
                    route_id.clone(),
                    RouteEnds {
                        source: from.clone(),
                        target: target_peer_id.clone(),
                    },
                );
                // Forward with the authenticated source
                let forwarded = RelayMessage::RouteRequest {
                    route_id,
                    source_peer_id: from.clone(),
                    target_peer_id: target_peer_id.clone(),
                };
                self.send_to(&target_peer_id, &forwarded).await;
            }
            RelayMessage::RouteResponse {
                route_id,
                success,
                error,
                bandwidth,
            } => {
                let ends = if success {
                    self.routes.read().await.get(&route_id).cloned()
                } else {
                    self.routes.write().await.remove(&route_id)
                };
                let Some(other) = ends.as_ref().and_then(|e| e.other(from)) else {
                    return;
                };
                let reply = RelayMessage::RouteResponse {
                    route_id,
                    success,
                    error,
                    bandwidth: bandwidth.or(self.bandwidth),
                };
                self.send_to(other, &reply).await;
            }
            RelayMessage::RouteData { route_id, data } => {
                let ends = self.routes.read().await.get(&route_id).cloned();
                let Some(other) = ends.as_ref().and_then(|e| e.other(from)) else {
                    trace!("Data for unknown route {}", route_id);
                    return;
                };
                self.send_to(other, &RelayMessage::RouteData { route_id, data }).await;
            }
            RelayMessage::RouteClose { route_id } => {
                let ends = self.routes.write().await.remove(&route_id);
                if let Some(other) = ends.as_ref().and_then(|e| e.other(from)) {
                    self.send_to(other, &RelayMessage::RouteClose { route_id }).await;
                }
            }
            RelayMessage::Unknown => {}
        }
    }

    async fn send_to(&self, peer: &PeerId, msg: &RelayMessage) {
        let channel = self.clients.read().await.get(peer).cloned();
        let Some(channel) = channel else {
            return;
        };
        let frame = match encode_frame(msg) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode relay message: {}", e);
                return;
            }
        };
        if let Err(e) = channel.send(frame).await {
            debug!("Relay send to {} failed: {}", peer, e);
        }
    }

    /// Drop a client and close every route it was part of
    async fn detach(&self, client: &PeerId, channel: &Arc<dyn DataChannel>) {
        {
            let mut clients = self.clients.write().await;
            // A newer session from the same client stays attached
            let current = clients
                .get(client)
                .map(|c| Arc::ptr_eq(c, channel))
                .unwrap_or(false);
            if !current {
                return;
            }
            clients.remove(client);
        }
        info!("Relay {} lost client {}", self.address, client);

        let orphaned: Vec<(RouteId, PeerId)> = {
            let mut routes = self.routes.write().await;
            let ids: Vec<RouteId> = routes
                .iter()
                .filter(|(_, ends)| ends.other(client).is_some())
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| {
                    let ends = routes.remove(&id)?;
                    let other = ends.other(client)?.clone();
                    Some((id, other))
                })
                .collect()
        };

        for (route_id, other) in orphaned {
            self.send_to(&other, &RelayMessage::RouteClose { route_id }).await;
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn route_count(&self) -> usize {
        self.routes.read().await.len()
    }

    /// Stop serving and close every client session
    pub async fn shutdown(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        let clients: Vec<Arc<dyn DataChannel>> =
            self.clients.write().await.drain().map(|(_, c)| c).collect();
        for channel in clients {
            channel.close().await;
        }
        self.routes.write().await.clear();
        info!("Relay {} shut down", self.address);
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}
