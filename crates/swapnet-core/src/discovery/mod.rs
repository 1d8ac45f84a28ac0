//! Peer Discovery Engine
//!
//! Keeps the set of directly connected peers near `max_peers` using several
//! discovery sources, and retries peers that dropped off.
//!
//! The engine owns every direct [`Connection`]. Lifecycle notifications from
//! those connections and peers reported by the sources are handled by a
//! single pump task that holds only a weak reference to the engine.

pub mod exchange;
pub mod local;
pub mod rendezvous;
pub mod source;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use swapnet_network::{
    encode_frame, Connection, ConnectionEvent, ConnectionEventKind, ConnectionEventSender,
    ConnectionId, ConnectionState, IncomingChannel, PeerId, SignalingConnector, Transport,
};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::DiscoveryConfig;
use crate::events::{EventBus, EventKind};
use crate::registry::{PeerInfo, PeerRegistry, PeerStatus, PeerType};

pub use exchange::{DiscoveryMessage, DEFAULT_EXCHANGE_LIMIT};
pub use local::LocalNetworkDiscovery;
pub use rendezvous::RendezvousDiscovery;
pub use source::{DiscoverySource, FoundPeer, FoundPeerSink};

/// Discovery events
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DiscoveryEvent {
    PeerFound(PeerInfo),
    PeerConnected(PeerInfo),
    PeerDisconnected { peer_id: PeerId },
    PeerFailed { peer_id: PeerId, reason: String },
    DiscoveryStarted,
    DiscoveryStopped,
    Error { message: String },
    /// Application payload received on a direct connection
    MessageReceived { peer_id: PeerId, payload: Bytes },
}

impl EventKind for DiscoveryEvent {
    fn name(&self) -> &'static str {
        match self {
            DiscoveryEvent::PeerFound(_) => "peer_found",
            DiscoveryEvent::PeerConnected(_) => "peer_connected",
            DiscoveryEvent::PeerDisconnected { .. } => "peer_disconnected",
            DiscoveryEvent::PeerFailed { .. } => "peer_failed",
            DiscoveryEvent::DiscoveryStarted => "discovery_started",
            DiscoveryEvent::DiscoveryStopped => "discovery_stopped",
            DiscoveryEvent::Error { .. } => "error",
            DiscoveryEvent::MessageReceived { .. } => "message_received",
        }
    }
}

enum Attempt {
    Start(Arc<Connection>),
    Join(Arc<Connection>),
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Peer discovery engine
pub struct PeerDiscovery {
    local_id: PeerId,
    config: DiscoveryConfig,
    transport: Arc<dyn Transport>,
    registry: Arc<PeerRegistry>,
    /// Current direct connection per peer (connecting or connected)
    connections: RwLock<HashMap<PeerId, Arc<Connection>>>,
    sources: RwLock<Vec<Arc<dyn DiscoverySource>>>,
    events: EventBus<DiscoveryEvent>,
    running: AtomicBool,
    /// Bumped on every start so a stale start can tell it was superseded
    generation: AtomicU64,
    /// Periodic loops, aborted on stop
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Pump and acceptor, aborted on drop
    background: Mutex<Vec<JoinHandle<()>>>,
    connection_events: ConnectionEventSender,
    found: FoundPeerSink,
}

impl PeerDiscovery {
    /// Create an engine. Must be called inside a Tokio runtime.
    pub fn new(
        local_id: impl Into<PeerId>,
        config: DiscoveryConfig,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Self::build(local_id.into(), config, transport, None)
    }

    /// Create an engine that also registers with the configured signaling servers
    pub fn with_signaling(
        local_id: impl Into<PeerId>,
        config: DiscoveryConfig,
        transport: Arc<dyn Transport>,
        connector: Arc<dyn SignalingConnector>,
    ) -> Arc<Self> {
        Self::build(local_id.into(), config, transport, Some(connector))
    }

    fn build(
        local_id: PeerId,
        config: DiscoveryConfig,
        transport: Arc<dyn Transport>,
        connector: Option<Arc<dyn SignalingConnector>>,
    ) -> Arc<Self> {
        let mut sources: Vec<Arc<dyn DiscoverySource>> = Vec::new();
        if !config.signaling_servers.is_empty() {
            match connector {
                Some(connector) => sources.push(Arc::new(RendezvousDiscovery::new(
                    local_id.clone(),
                    config.signaling_servers.clone(),
                    connector,
                ))),
                None => warn!("Signaling servers configured but no signaling connector given"),
            }
        }
        if config.enable_local_discovery {
            sources.push(Arc::new(LocalNetworkDiscovery::on_port(
                local_id.clone(),
                config.local_discovery_port,
            )));
        }

        let (connection_events, connection_rx) = mpsc::unbounded_channel();
        let (found, found_rx) = mpsc::unbounded_channel();

        let discovery = Arc::new(Self {
            local_id,
            config,
            transport,
            registry: Arc::new(PeerRegistry::new()),
            connections: RwLock::new(HashMap::new()),
            sources: RwLock::new(sources),
            events: EventBus::new(),
            running: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
            background: Mutex::new(Vec::new()),
            connection_events,
            found,
        });

        let pump = tokio::spawn(Self::run_pump(
            Arc::downgrade(&discovery),
            connection_rx,
            found_rx,
        ));
        lock(&discovery.background).push(pump);
        discovery
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Read access to the peer registry
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventBus<DiscoveryEvent> {
        &self.events
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Attach another discovery source; started right away when running
    pub async fn add_source(&self, source: Arc<dyn DiscoverySource>) {
        self.sources.write().await.push(source.clone());
        if self.is_running() {
            self.start_source(&source).await;
        }
    }

    /// Accept sessions remote peers open to this node
    pub fn accept_from(self: &Arc<Self>, mut incoming: mpsc::UnboundedReceiver<IncomingChannel>) {
        let weak = Arc::downgrade(self);
        let acceptor = tokio::spawn(async move {
            while let Some(channel) = incoming.recv().await {
                let Some(engine) = weak.upgrade() else { break };
                tokio::spawn(async move {
                    engine.accept(channel).await;
                });
            }
        });
        lock(&self.background).push(acceptor);
    }

    /// Whether the run started as `generation` is still the live one
    fn in_run(&self, generation: u64) -> bool {
        self.is_running() && self.generation.load(Ordering::SeqCst) == generation
    }

    /// Start discovering. Idempotent.
    ///
    /// A `stop_discovery` that lands while sources are starting wins: the
    /// remaining steps are skipped and no loops are left behind.
    pub async fn start_discovery(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Starting peer discovery as {}", self.local_id.short());

        let sources = self.sources.read().await.clone();
        for source in &sources {
            self.start_source(source).await;
            if !self.in_run(generation) {
                debug!("Discovery stopped while starting {}", source.name());
                // Stop may have run before this source finished starting
                if !self.is_running() {
                    source.stop().await;
                }
                return;
            }
        }

        if !self.spawn_loops(generation) {
            return;
        }

        let bootstrap: Vec<PeerId> = self
            .config
            .bootstrap_peers
            .iter()
            .map(PeerId::new)
            .filter(|id| id != &self.local_id)
            .collect();
        if !bootstrap.is_empty() {
            debug!("Connecting to {} bootstrap peers", bootstrap.len());
            let connected = join_all(
                bootstrap
                    .into_iter()
                    .map(|id| self.connect_inner(id, PeerType::Bootstrap, true)),
            )
            .await;
            info!(
                "Connected to {}/{} bootstrap peers",
                connected.iter().filter(|ok| **ok).count(),
                connected.len()
            );
        }

        if self.in_run(generation) {
            self.events.emit(DiscoveryEvent::DiscoveryStarted);
        }
    }

    /// Stop discovering and drop every connection. Idempotent.
    pub async fn stop_discovery(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping peer discovery");

        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }

        let sources = self.sources.read().await.clone();
        for source in sources {
            source.stop().await;
        }

        self.disconnect_from_all_peers().await;
        self.events.emit(DiscoveryEvent::DiscoveryStopped);
    }

    async fn start_source(&self, source: &Arc<dyn DiscoverySource>) {
        match source.start(self.found.clone()).await {
            Ok(()) => info!("Discovery source {} started", source.name()),
            Err(e) => {
                warn!("Discovery source {} failed to start: {}", source.name(), e);
                self.events.emit(DiscoveryEvent::Error {
                    message: format!("{} discovery failed: {}", source.name(), e),
                });
            }
        }
    }

    /// Spawn the periodic loops unless the run was stopped. Stop clears
    /// `running` before draining `tasks`, so checking under the lock is enough.
    fn spawn_loops(self: &Arc<Self>, generation: u64) -> bool {
        let mut tasks = lock(&self.tasks);
        if !self.in_run(generation) {
            return false;
        }

        let weak = Arc::downgrade(self);
        let period = self.config.discovery_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(this) = weak.upgrade() else { break };
                this.discovery_tick().await;
            }
        }));

        let weak = Arc::downgrade(self);
        let period = self.config.reconnect_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(this) = weak.upgrade() else { break };
                this.reconnect_tick().await;
            }
        }));
        true
    }

    /// Look for more peers while under the cap
    async fn discovery_tick(&self) {
        if self.connection_count().await >= self.config.max_peers {
            trace!("Discovery tick skipped, at peer cap");
            return;
        }

        let sources = self.sources.read().await.clone();
        for source in sources {
            if let Err(e) = source.announce().await {
                warn!("Discovery source {} announce failed: {}", source.name(), e);
                self.events.emit(DiscoveryEvent::Error {
                    message: format!("{} announce failed: {}", source.name(), e),
                });
            }
        }

        if self.config.enable_dht {
            let request = DiscoveryMessage::PeerExchangeRequest {
                limit: DEFAULT_EXCHANGE_LIMIT,
            };
            let asked = self.broadcast_message(&request, &[]).await;
            trace!("Peer exchange request sent to {} peers", asked);
        }
    }

    /// Retry disconnected peers, manual ones excepted
    async fn reconnect_tick(&self) {
        let candidates: Vec<PeerInfo> = self
            .registry
            .list_by_status(PeerStatus::Disconnected)
            .await
            .into_iter()
            .filter(|p| p.peer_type != PeerType::Manual)
            .collect();
        if candidates.is_empty() {
            return;
        }

        let room = self
            .config
            .max_peers
            .saturating_sub(self.connection_count().await);
        if room == 0 {
            return;
        }

        debug!("Reconnecting to up to {} of {} peers", room, candidates.len());
        join_all(
            candidates
                .into_iter()
                .take(room)
                .map(|p| self.connect_inner(p.peer_id, p.peer_type, true)),
        )
        .await;
    }

    /// Connect to a peer on explicit request. Not subject to the peer cap.
    ///
    /// Returns `true` once connected. Never errors: a failure marks the peer
    /// `failed` and emits `PeerFailed`.
    pub async fn connect_to_peer(&self, peer_id: impl Into<PeerId>, peer_type: PeerType) -> bool {
        self.connect_inner(peer_id.into(), peer_type, false).await
    }

    async fn connect_inner(&self, peer_id: PeerId, peer_type: PeerType, enforce_cap: bool) -> bool {
        if peer_id == self.local_id {
            return false;
        }

        let attempt = {
            let mut connections = self.connections.write().await;
            let mut existing = None;
            if let Some(conn) = connections.get(&peer_id).cloned() {
                match conn.state().await {
                    ConnectionState::Connected => return true,
                    ConnectionState::New | ConnectionState::Connecting => existing = Some(conn),
                    _ => {
                        connections.remove(&peer_id);
                    }
                }
            }

            match existing {
                Some(conn) => Attempt::Join(conn),
                None => {
                    // Discovery-initiated connects die with the run
                    if enforce_cap && !self.is_running() {
                        debug!("Not connecting to {}, discovery stopped", peer_id);
                        return false;
                    }
                    if enforce_cap && connections.len() >= self.config.max_peers {
                        debug!("Not connecting to {}, at peer cap", peer_id);
                        return false;
                    }
                    let conn = Arc::new(Connection::new(
                        peer_id.clone(),
                        self.transport.clone(),
                        self.config.connection_timeout,
                        self.connection_events.clone(),
                    ));
                    connections.insert(peer_id.clone(), conn.clone());
                    self.mark_connecting(&peer_id, peer_type).await;
                    Attempt::Start(conn)
                }
            }
        };

        match attempt {
            Attempt::Join(conn) => {
                let joined = conn.connect().await.is_ok();
                joined && self.is_current(&peer_id, conn.id()).await
            }
            Attempt::Start(conn) => {
                let result = conn.connect().await;
                self.finish_attempt(conn, result.map_err(|e| e.to_string())).await
            }
        }
    }

    async fn accept(&self, incoming: IncomingChannel) {
        let peer_id = incoming.remote.clone();
        if peer_id == self.local_id {
            incoming.channel.close().await;
            return;
        }

        let conn = {
            let mut connections = self.connections.write().await;
            if let Some(existing) = connections.get(&peer_id).cloned() {
                let state = existing.state().await;
                let live = matches!(
                    state,
                    ConnectionState::New | ConnectionState::Connecting | ConnectionState::Connected
                );
                // Both sides dialed: the session opened by the lower ID survives
                if live && self.local_id < peer_id {
                    drop(connections);
                    debug!("Dropping duplicate session from {}", peer_id);
                    incoming.channel.close().await;
                    return;
                }
                connections.remove(&peer_id);
                existing.disconnect().await;
            } else if connections.len() >= self.config.max_peers {
                drop(connections);
                debug!("Rejecting session from {}, at peer cap", peer_id);
                incoming.channel.close().await;
                return;
            }

            let conn = Arc::new(Connection::accept(
                incoming,
                self.config.connection_timeout,
                self.connection_events.clone(),
            ));
            connections.insert(peer_id.clone(), conn.clone());
            self.mark_connecting(&peer_id, PeerType::Manual).await;
            conn
        };

        debug!("Accepted session from {}", peer_id);
        let result = conn.connect().await;
        self.finish_attempt(conn, result.map_err(|e| e.to_string())).await;
    }

    /// Record a peer as connecting, keeping what is already known about it.
    /// `peer_type` only applies to peers seen for the first time.
    async fn mark_connecting(&self, peer_id: &PeerId, peer_type: PeerType) {
        let info = match self.registry.get(peer_id).await {
            Some(mut info) => {
                info.status = PeerStatus::Connecting;
                info.last_seen = Utc::now();
                info
            }
            None => PeerInfo::new(peer_id.clone(), peer_type, PeerStatus::Connecting),
        };
        self.registry.upsert(info).await;
    }

    async fn finish_attempt(&self, conn: Arc<Connection>, result: Result<(), String>) -> bool {
        let peer_id = conn.peer_id().clone();

        if let Err(reason) = result {
            self.remove_connection(&peer_id, conn.id()).await;
            if self.connections.read().await.contains_key(&peer_id) {
                debug!("Superseded attempt to {} ended: {}", peer_id, reason);
                return false;
            }
            let mut failed = false;
            self.registry
                .update(&peer_id, |p| {
                    if p.status == PeerStatus::Connecting {
                        p.status = PeerStatus::Failed;
                        p.last_seen = Utc::now();
                        failed = true;
                    }
                })
                .await;
            if failed {
                warn!("Connection to {} failed: {}", peer_id, reason);
                self.events
                    .emit(DiscoveryEvent::PeerFailed { peer_id, reason });
            }
            return false;
        }

        // The entry may have been removed or replaced while the attempt was in flight
        if !self.is_current(&peer_id, conn.id()).await {
            debug!("Discarding late connection to {}", peer_id);
            conn.disconnect().await;
            return false;
        }

        let latency = conn.latency();
        let mut promoted = false;
        let info = self
            .registry
            .update(&peer_id, |p| {
                if p.status == PeerStatus::Connecting {
                    p.status = PeerStatus::Connected;
                    p.last_seen = Utc::now();
                    if latency.is_some() {
                        p.latency = latency;
                    }
                    promoted = true;
                }
            })
            .await;

        match info {
            Some(info) if promoted => {
                info!("Connected to peer {} ({})", peer_id, info.peer_type.as_str());
                self.events.emit(DiscoveryEvent::PeerConnected(info));
                true
            }
            _ => {
                debug!("Peer {} left connecting state, closing connection", peer_id);
                self.remove_connection(&peer_id, conn.id()).await;
                conn.disconnect().await;
                false
            }
        }
    }

    async fn is_current(&self, peer_id: &PeerId, id: ConnectionId) -> bool {
        self.connections
            .read()
            .await
            .get(peer_id)
            .map(|c| c.id() == id)
            .unwrap_or(false)
    }

    /// Remove the entry for `peer_id` only if it is still connection `id`
    async fn remove_connection(&self, peer_id: &PeerId, id: ConnectionId) -> Option<Arc<Connection>> {
        let mut connections = self.connections.write().await;
        if connections.get(peer_id).map(|c| c.id()) == Some(id) {
            connections.remove(peer_id)
        } else {
            None
        }
    }

    /// Close the connection to a peer and mark it disconnected. Safe on unknown peers.
    pub async fn disconnect_from_peer(&self, peer_id: &PeerId) {
        let conn = self.connections.write().await.remove(peer_id);
        if let Some(conn) = conn {
            conn.disconnect().await;
        }

        let mut was_active = false;
        self.registry
            .update(peer_id, |p| {
                if matches!(p.status, PeerStatus::Connected | PeerStatus::Connecting) {
                    p.status = PeerStatus::Disconnected;
                    p.last_seen = Utc::now();
                    was_active = true;
                }
            })
            .await;

        if was_active {
            info!("Disconnected from peer {}", peer_id);
            self.events.emit(DiscoveryEvent::PeerDisconnected {
                peer_id: peer_id.clone(),
            });
        }
    }

    pub async fn disconnect_from_all_peers(&self) {
        let peers: Vec<PeerId> = self.connections.read().await.keys().cloned().collect();
        for peer_id in peers {
            self.disconnect_from_peer(&peer_id).await;
        }
    }

    /// Best-effort send; `false` when there is no usable connection
    pub async fn send_message_to_peer<T: Serialize + ?Sized>(&self, peer_id: &PeerId, msg: &T) -> bool {
        let frame = match encode_frame(msg) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode message for {}: {}", peer_id, e);
                return false;
            }
        };
        self.send_frame(peer_id, frame).await
    }

    async fn send_frame(&self, peer_id: &PeerId, frame: Bytes) -> bool {
        let conn = self.connections.read().await.get(peer_id).cloned();
        match conn {
            Some(conn) => match conn.send(frame).await {
                Ok(()) => true,
                Err(e) => {
                    debug!("Send to {} failed: {}", peer_id, e);
                    false
                }
            },
            None => false,
        }
    }

    /// Send to every connected peer not in `exclude`; returns how many accepted it
    pub async fn broadcast_message<T: Serialize + ?Sized>(&self, msg: &T, exclude: &[PeerId]) -> usize {
        let frame = match encode_frame(msg) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode broadcast: {}", e);
                return 0;
            }
        };

        let targets: Vec<Arc<Connection>> = self
            .connections
            .read()
            .await
            .iter()
            .filter(|(id, _)| !exclude.contains(id))
            .map(|(_, conn)| conn.clone())
            .collect();

        let mut sent = 0;
        for conn in targets {
            if !conn.is_connected().await {
                continue;
            }
            if conn.send(frame.clone()).await.is_ok() {
                sent += 1;
            }
        }
        sent
    }

    /// Report a peer learned outside the built-in sources.
    ///
    /// Known peers are left untouched. New peers are registered as
    /// `disconnected`; while running and under the cap a connection is
    /// started in the background.
    pub async fn peer_found(
        self: &Arc<Self>,
        peer_id: impl Into<PeerId>,
        peer_type: PeerType,
        metadata: HashMap<String, String>,
    ) {
        self.handle_found(FoundPeer {
            peer_id: peer_id.into(),
            peer_type,
            metadata,
        })
        .await;
    }

    async fn handle_found(self: &Arc<Self>, found: FoundPeer) {
        let FoundPeer {
            peer_id,
            peer_type,
            metadata,
        } = found;
        if peer_id == self.local_id {
            return;
        }

        let info = PeerInfo::new(peer_id.clone(), peer_type, PeerStatus::Disconnected)
            .with_metadata(metadata);
        if !self.registry.insert_new(info.clone()).await {
            trace!("Peer {} already known", peer_id);
            return;
        }

        info!("Found peer {} via {}", peer_id, peer_type.as_str());
        self.events.emit(DiscoveryEvent::PeerFound(info));

        if self.is_running() && self.connection_count().await < self.config.max_peers {
            let engine = self.clone();
            tokio::spawn(async move {
                engine.connect_inner(peer_id, peer_type, true).await;
            });
        }
    }

    async fn run_pump(
        weak: Weak<Self>,
        mut connection_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
        mut found_rx: mpsc::UnboundedReceiver<FoundPeer>,
    ) {
        loop {
            tokio::select! {
                Some(event) = connection_rx.recv() => {
                    let Some(this) = weak.upgrade() else { break };
                    this.handle_connection_event(event).await;
                }
                Some(found) = found_rx.recv() => {
                    let Some(this) = weak.upgrade() else { break };
                    this.handle_found(found).await;
                }
                else => break,
            }
        }
    }

    async fn handle_connection_event(self: &Arc<Self>, event: ConnectionEvent) {
        if !self.is_current(&event.peer_id, event.connection_id).await {
            trace!("Ignoring event from stale connection {}", event.connection_id);
            return;
        }

        match event.kind {
            // Reported by the connect path
            ConnectionEventKind::Connected => {}
            ConnectionEventKind::Error(e) => {
                debug!("Connection to {} reported: {}", event.peer_id, e);
            }
            ConnectionEventKind::Disconnected => {
                if let Some(conn) = self
                    .remove_connection(&event.peer_id, event.connection_id)
                    .await
                {
                    conn.disconnect().await;
                }
                let previous = self
                    .registry
                    .set_status(&event.peer_id, PeerStatus::Disconnected)
                    .await;
                if previous != Some(PeerStatus::Disconnected) {
                    info!("Peer {} disconnected", event.peer_id);
                    self.events.emit(DiscoveryEvent::PeerDisconnected {
                        peer_id: event.peer_id,
                    });
                }
            }
            ConnectionEventKind::Message(payload) => {
                match DiscoveryMessage::parse(&payload) {
                    Some(msg) => self.handle_discovery_message(&event.peer_id, msg).await,
                    None => self.events.emit(DiscoveryEvent::MessageReceived {
                        peer_id: event.peer_id,
                        payload,
                    }),
                }
            }
        }
    }

    async fn handle_discovery_message(self: &Arc<Self>, from: &PeerId, msg: DiscoveryMessage) {
        match msg {
            DiscoveryMessage::PeerExchangeRequest { limit } => {
                let peers: Vec<PeerId> = self
                    .registry
                    .list_connected()
                    .await
                    .into_iter()
                    .map(|p| p.peer_id)
                    .filter(|id| id != from)
                    .take(limit)
                    .collect();
                trace!("Answering peer exchange from {} with {} peers", from, peers.len());
                let response = DiscoveryMessage::PeerExchangeResponse { peers };
                self.send_message_to_peer(from, &response).await;
            }
            DiscoveryMessage::PeerExchangeResponse { peers } => {
                for peer_id in peers {
                    self.handle_found(
                        FoundPeer::new(peer_id, PeerType::DistributedLookup)
                            .with_meta("introduced_by", from.to_string()),
                    )
                    .await;
                }
            }
        }
    }

    /// Connections that are connecting or connected
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn get_peer_info(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.registry.get(peer_id).await
    }

    pub async fn list_peers(&self) -> Vec<PeerInfo> {
        self.registry.list_all().await
    }

    pub async fn connected_peers(&self) -> Vec<PeerId> {
        self.registry
            .list_connected()
            .await
            .into_iter()
            .map(|p| p.peer_id)
            .collect()
    }

    /// Whether a direct connection to `peer_id` is up
    pub async fn is_connected_to(&self, peer_id: &PeerId) -> bool {
        let conn = self.connections.read().await.get(peer_id).cloned();
        match conn {
            Some(conn) => conn.is_connected().await,
            None => false,
        }
    }
}

impl Drop for PeerDiscovery {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        for task in lock(&self.background).drain(..) {
            task.abort();
        }
    }
}
