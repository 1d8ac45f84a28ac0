//! Network context
//!
//! Owns the discovery engine and the relay router of one node and picks a
//! path to a peer: a direct connection when one can be made, a relayed route
//! otherwise.

use std::sync::Arc;

use serde::Serialize;
use swapnet_network::{IncomingChannel, PeerId, SignalingConnector, Transport};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::NetworkConfig;
use crate::discovery::PeerDiscovery;
use crate::error::CoreResult;
use crate::registry::PeerType;
use crate::relay::{RelayRouter, RouteId};

/// How a peer is reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerPath {
    Direct(PeerId),
    Relayed(RouteId),
}

pub struct NetworkContext {
    local_id: PeerId,
    discovery: Arc<PeerDiscovery>,
    relay: Arc<RelayRouter>,
}

impl NetworkContext {
    /// Build a node from validated configuration. Must be called inside a Tokio runtime.
    pub fn new(
        local_id: impl Into<PeerId>,
        config: NetworkConfig,
        transport: Arc<dyn Transport>,
    ) -> CoreResult<Self> {
        Self::build(local_id.into(), config, transport, None)
    }

    /// Like [`NetworkContext::new`], also registering with signaling servers
    pub fn with_signaling(
        local_id: impl Into<PeerId>,
        config: NetworkConfig,
        transport: Arc<dyn Transport>,
        connector: Arc<dyn SignalingConnector>,
    ) -> CoreResult<Self> {
        Self::build(local_id.into(), config, transport, Some(connector))
    }

    fn build(
        local_id: PeerId,
        config: NetworkConfig,
        transport: Arc<dyn Transport>,
        connector: Option<Arc<dyn SignalingConnector>>,
    ) -> CoreResult<Self> {
        config.validate()?;

        let discovery = match connector {
            Some(connector) => PeerDiscovery::with_signaling(
                local_id.clone(),
                config.discovery,
                transport.clone(),
                connector,
            ),
            None => PeerDiscovery::new(local_id.clone(), config.discovery, transport.clone()),
        };
        let relay = RelayRouter::new(local_id.clone(), config.relay, transport);

        Ok(Self {
            local_id,
            discovery,
            relay,
        })
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn discovery(&self) -> &Arc<PeerDiscovery> {
        &self.discovery
    }

    pub fn relay(&self) -> &Arc<RelayRouter> {
        &self.relay
    }

    /// Hand incoming direct sessions to the discovery engine
    pub fn accept_from(&self, incoming: mpsc::UnboundedReceiver<IncomingChannel>) {
        self.discovery.accept_from(incoming);
    }

    pub async fn start(&self) {
        info!("Starting node {}", self.local_id.short());
        self.relay.start().await;
        self.discovery.start_discovery().await;
    }

    pub async fn stop(&self) {
        self.discovery.stop_discovery().await;
        self.relay.stop().await;
        info!("Node {} stopped", self.local_id.short());
    }

    /// Find a way to `peer`: direct first, then through a relay
    pub async fn reach_peer(&self, peer: impl Into<PeerId>) -> CoreResult<PeerPath> {
        let peer = peer.into();
        if self.discovery.is_connected_to(&peer).await
            || self.discovery.connect_to_peer(peer.clone(), PeerType::Manual).await
        {
            return Ok(PeerPath::Direct(peer));
        }

        debug!("No direct path to {}, trying relays", peer);
        let route_id = self.relay.create_route(peer).await?;
        Ok(PeerPath::Relayed(route_id))
    }

    /// Best-effort send along a path
    pub async fn send<T: Serialize + ?Sized>(&self, path: &PeerPath, msg: &T) -> bool {
        match path {
            PeerPath::Direct(peer) => self.discovery.send_message_to_peer(peer, msg).await,
            PeerPath::Relayed(route_id) => self.relay.send_message_through_route(route_id, msg).await,
        }
    }
}
