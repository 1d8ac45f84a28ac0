//! Relay Registry & Router
//!
//! Keeps connections to a handful of relays and uses them to reach peers
//! that cannot be dialed directly. Every payload on a route is wrapped in a
//! `route_data` envelope and forwarded by the relay.
//!
//! Invariant: a route always references a known relay. When a relay
//! connection goes away, every route through it is closed before
//! `RelayDisconnected` is emitted.

pub mod message;
pub mod routes;
pub mod server;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use swapnet_network::{
    Connection, ConnectionEvent, ConnectionEventKind, ConnectionEventSender, ConnectionId,
    ConnectionState, PeerId, Transport,
};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::{RelayConfig, RelaySelection, RouteEstablishment};
use crate::error::{CoreError, CoreResult};
use crate::events::{EventBus, EventKind};

pub use message::RelayMessage;
pub use routes::{Route, RouteDirection, RouteTable};
pub use server::RelayServer;

/// Relay identifier, derived from the relay address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelayId(String);

impl RelayId {
    /// First 8 bytes of the BLAKE3 hash of `address`, hex encoded
    pub fn from_address(address: &str) -> Self {
        let hash = blake3::hash(address.as_bytes());
        Self(hex::encode(&hash.as_bytes()[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RelayId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RelayId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Route identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteId(String);

impl RouteId {
    /// Fresh random ID, `route_` followed by 16 hex digits
    pub fn generate() -> Self {
        Self(format!("route_{:016x}", rand::random::<u64>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RouteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RouteId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayType {
    /// Built into the node
    Bootstrap,
    /// Configured or announced public relay
    Public,
    /// Operated by the user
    Private,
}

/// What the router knows about one relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayInfo {
    pub relay_id: RelayId,
    pub relay_type: RelayType,
    pub address: String,
    pub is_connected: bool,
    /// Time the last connect took
    pub latency: Option<Duration>,
    /// Advertised in route responses, bytes per second
    pub bandwidth: Option<u64>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl RelayInfo {
    pub fn new(address: impl Into<String>, relay_type: RelayType) -> Self {
        let address = address.into();
        Self {
            relay_id: RelayId::from_address(&address),
            relay_type,
            address,
            is_connected: false,
            latency: None,
            bandwidth: None,
            last_seen: None,
        }
    }
}

/// Relay router events
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RelayEvent {
    RelayConnected(RelayInfo),
    RelayDisconnected { relay_id: RelayId },
    RouteEstablished(Route),
    RouteClosed { route_id: RouteId, relay_id: RelayId },
    MessageReceived {
        route_id: RouteId,
        from: PeerId,
        data: serde_json::Value,
    },
    Error {
        relay_id: Option<RelayId>,
        message: String,
    },
}

impl EventKind for RelayEvent {
    fn name(&self) -> &'static str {
        match self {
            RelayEvent::RelayConnected(_) => "relay_connected",
            RelayEvent::RelayDisconnected { .. } => "relay_disconnected",
            RelayEvent::RouteEstablished(_) => "route_established",
            RelayEvent::RouteClosed { .. } => "route_closed",
            RelayEvent::MessageReceived { .. } => "message_received",
            RelayEvent::Error { .. } => "error",
        }
    }
}

type PendingAcks = HashMap<RouteId, oneshot::Sender<Result<(), String>>>;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum Attempt {
    Start(Arc<Connection>),
    Join(Arc<Connection>),
}

/// Relay router
pub struct RelayRouter {
    local_id: PeerId,
    config: RelayConfig,
    transport: Arc<dyn Transport>,
    /// Known relays in registration order
    relays: RwLock<IndexMap<RelayId, RelayInfo>>,
    connections: RwLock<HashMap<RelayId, Arc<Connection>>>,
    routes: RwLock<RouteTable>,
    /// Outbound routes waiting for a route response
    pending: Mutex<PendingAcks>,
    events: EventBus<RelayEvent>,
    running: AtomicBool,
    /// Bumped on every start so a stale start can tell it was superseded
    generation: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    connection_events: ConnectionEventSender,
}

impl RelayRouter {
    /// Create a router seeded with the configured relays. Must be called
    /// inside a Tokio runtime.
    pub fn new(local_id: impl Into<PeerId>, config: RelayConfig, transport: Arc<dyn Transport>) -> Arc<Self> {
        let mut relays = IndexMap::new();
        let seeds = config
            .bootstrap_relays
            .iter()
            .map(|a| (a, RelayType::Bootstrap))
            .chain(config.relays.iter().map(|a| (a, RelayType::Public)));
        for (address, relay_type) in seeds {
            let info = RelayInfo::new(address.clone(), relay_type);
            relays.entry(info.relay_id.clone()).or_insert(info);
        }

        let (connection_events, connection_rx) = mpsc::unbounded_channel();
        let router = Arc::new(Self {
            local_id: local_id.into(),
            config,
            transport,
            relays: RwLock::new(relays),
            connections: RwLock::new(HashMap::new()),
            routes: RwLock::new(RouteTable::new()),
            pending: Mutex::new(HashMap::new()),
            events: EventBus::new(),
            running: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
            pump: Mutex::new(None),
            connection_events,
        });

        let pump = tokio::spawn(Self::run_pump(Arc::downgrade(&router), connection_rx));
        *lock(&router.pump) = Some(pump);
        router
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus<RelayEvent> {
        &self.events
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn in_run(&self, generation: u64) -> bool {
        self.is_running() && self.generation.load(Ordering::SeqCst) == generation
    }

    /// Connect to known relays and start the maintenance loop. Idempotent.
    ///
    /// A `stop` that lands while relays are connecting wins: no further
    /// relays are dialed and the maintenance loop is not started.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Starting relay router");

        let ids: Vec<RelayId> = self.relays.read().await.keys().cloned().collect();
        for id in ids {
            if !self.in_run(generation) || self.connected_count().await >= self.config.max_relays {
                break;
            }
            self.connect_to_relay(&id).await;
        }

        // Stop clears `running` before draining `tasks`
        let spawned = {
            let mut tasks = lock(&self.tasks);
            if self.in_run(generation) {
                let weak = Arc::downgrade(self);
                let period = self.config.reconnect_interval;
                tasks.push(tokio::spawn(async move {
                    let mut ticker = interval_at(Instant::now() + period, period);
                    loop {
                        ticker.tick().await;
                        let Some(this) = weak.upgrade() else { break };
                        this.maintenance_tick().await;
                    }
                }));
                true
            } else {
                false
            }
        };

        if !spawned && !self.is_running() {
            debug!("Relay router stopped while starting");
            // A relay may have connected after stop swept the connections
            self.disconnect_all_relays().await;
        }
    }

    /// Close every route and disconnect every relay. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping relay router");

        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }

        let route_ids = self.routes.read().await.ids();
        for route_id in route_ids {
            self.close_route(&route_id).await;
        }

        self.disconnect_all_relays().await;
    }

    async fn disconnect_all_relays(&self) {
        let relay_ids: Vec<RelayId> = self.connections.read().await.keys().cloned().collect();
        for relay_id in relay_ids {
            self.disconnect_from_relay(&relay_id).await;
        }
    }

    async fn maintenance_tick(&self) {
        let idle = self.routes.read().await.idle(self.config.route_timeout);
        for route_id in idle {
            debug!("Closing idle route {}", route_id);
            self.close_route(&route_id).await;
        }

        let disconnected: Vec<RelayId> = self
            .relays
            .read()
            .await
            .values()
            .filter(|r| !r.is_connected)
            .map(|r| r.relay_id.clone())
            .collect();
        for relay_id in disconnected {
            if self.connected_count().await >= self.config.max_relays {
                break;
            }
            self.connect_to_relay(&relay_id).await;
        }
    }

    /// Register a relay; duplicates (by address) return the existing ID
    pub async fn add_relay(&self, address: &str, relay_type: RelayType) -> RelayId {
        let info = RelayInfo::new(address, relay_type);
        let relay_id = info.relay_id.clone();
        {
            let mut relays = self.relays.write().await;
            if relays.contains_key(&relay_id) {
                return relay_id;
            }
            relays.insert(relay_id.clone(), info);
        }
        info!("Added relay {} ({})", address, relay_id);

        if self.config.enable_auto_relay && self.connected_count().await < self.config.max_relays {
            self.connect_to_relay(&relay_id).await;
        }
        relay_id
    }

    /// Disconnect from a relay and forget it
    pub async fn remove_relay(&self, relay_id: &RelayId) -> bool {
        self.disconnect_from_relay(relay_id).await;
        let removed = self.relays.write().await.shift_remove(relay_id).is_some();
        if removed {
            info!("Removed relay {}", relay_id);
        }
        removed
    }

    /// Connect to a known relay. Returns `true` once connected.
    pub async fn connect_to_relay(&self, relay_id: &RelayId) -> bool {
        let address = match self.relays.read().await.get(relay_id) {
            Some(info) => info.address.clone(),
            None => {
                warn!("Unknown relay {}", relay_id);
                return false;
            }
        };

        let attempt = {
            let mut connections = self.connections.write().await;
            let mut existing = None;
            if let Some(conn) = connections.get(relay_id).cloned() {
                match conn.state().await {
                    ConnectionState::Connected => return true,
                    ConnectionState::New | ConnectionState::Connecting => existing = Some(conn),
                    _ => {
                        connections.remove(relay_id);
                    }
                }
            }
            match existing {
                Some(conn) => Attempt::Join(conn),
                None => {
                    let conn = Arc::new(Connection::new(
                        PeerId::new(address.as_str()),
                        self.transport.clone(),
                        self.config.connection_timeout,
                        self.connection_events.clone(),
                    ));
                    connections.insert(relay_id.clone(), conn.clone());
                    Attempt::Start(conn)
                }
            }
        };

        let conn = match attempt {
            Attempt::Join(conn) => {
                return conn.connect().await.is_ok() && self.is_current(relay_id, conn.id()).await;
            }
            Attempt::Start(conn) => conn,
        };

        debug!("Connecting to relay {}", address);
        if let Err(e) = conn.connect().await {
            self.remove_connection(relay_id, conn.id()).await;
            warn!("Failed to connect to relay {}: {}", address, e);
            self.events.emit(RelayEvent::Error {
                relay_id: Some(relay_id.clone()),
                message: e.to_string(),
            });
            return false;
        }

        if !self.is_current(relay_id, conn.id()).await {
            debug!("Discarding late connection to relay {}", relay_id);
            conn.disconnect().await;
            return false;
        }

        let latency = conn.latency();
        let info = {
            let mut relays = self.relays.write().await;
            relays.get_mut(relay_id).map(|info| {
                info.is_connected = true;
                info.latency = latency;
                info.last_seen = Some(Utc::now());
                info.clone()
            })
        };
        match info {
            Some(info) => {
                info!("Connected to relay {} ({:?})", address, latency);
                self.events.emit(RelayEvent::RelayConnected(info));
                true
            }
            None => {
                // Removed while connecting
                self.remove_connection(relay_id, conn.id()).await;
                conn.disconnect().await;
                false
            }
        }
    }

    /// Close every route through a relay, then the relay connection.
    ///
    /// `RelayDisconnected` is emitted after all `RouteClosed` events.
    pub async fn disconnect_from_relay(&self, relay_id: &RelayId) {
        let conn = self.connections.write().await.remove(relay_id);
        self.teardown(relay_id, conn, true).await;
    }

    async fn teardown(&self, relay_id: &RelayId, conn: Option<Arc<Connection>>, notify: bool) {
        let closed = self.routes.write().await.remove_by_relay(relay_id);

        if let Some(conn) = &conn {
            if notify {
                for route in &closed {
                    let notice = RelayMessage::RouteClose {
                        route_id: route.route_id.clone(),
                    };
                    let _ = conn.send_json(&notice).await;
                }
            }
            conn.disconnect().await;
        }

        for route in closed {
            self.finish_close(route);
        }

        let was_connected = self
            .relays
            .write()
            .await
            .get_mut(relay_id)
            .map(|info| std::mem::replace(&mut info.is_connected, false))
            .unwrap_or(false);

        if conn.is_some() || was_connected {
            info!("Disconnected from relay {}", relay_id);
            self.events.emit(RelayEvent::RelayDisconnected {
                relay_id: relay_id.clone(),
            });
        }
    }

    /// Settle a removed route. Only routes that were reported established
    /// get a `RouteClosed`; a pending one just fails its waiter.
    fn finish_close(&self, route: Route) {
        if let Some(waiter) = lock(&self.pending).remove(&route.route_id) {
            let _ = waiter.send(Err("route closed".into()));
        }
        if !route.active {
            debug!("Pending route {} dropped", route.route_id);
            return;
        }
        debug!("Route {} closed", route.route_id);
        self.events.emit(RelayEvent::RouteClosed {
            route_id: route.route_id,
            relay_id: route.relay_id,
        });
    }

    async fn select_relay(&self) -> Option<(RelayId, Arc<Connection>)> {
        let relays = self.relays.read().await;
        let connections = self.connections.read().await;
        let candidates = relays
            .values()
            .filter(|r| r.is_connected)
            .filter_map(|r| connections.get(&r.relay_id).map(|c| (r, c)));

        let (info, conn) = match self.config.selection {
            RelaySelection::FirstAvailable => candidates.into_iter().next(),
            RelaySelection::LowestLatency => {
                candidates.min_by_key(|(r, _)| r.latency.unwrap_or(Duration::MAX))
            }
        }?;
        Some((info.relay_id.clone(), conn.clone()))
    }

    /// Open a route to `target` through a connected relay
    pub async fn create_route(&self, target: impl Into<PeerId>) -> CoreResult<RouteId> {
        let target = target.into();
        let (relay_id, conn) = self
            .select_relay()
            .await
            .ok_or(CoreError::NoRelaysAvailable)?;

        let route_id = RouteId::generate();
        let mut route = Route::new(
            route_id.clone(),
            self.local_id.clone(),
            target.clone(),
            relay_id.clone(),
            RouteDirection::Outbound,
        );
        let request = RelayMessage::RouteRequest {
            route_id: route_id.clone(),
            source_peer_id: self.local_id.clone(),
            target_peer_id: target.clone(),
        };

        match self.config.establishment {
            RouteEstablishment::Optimistic => {
                route.active = true;
                self.routes.write().await.insert(route.clone());
                if let Err(e) = conn.send_json(&request).await {
                    self.routes.write().await.remove(&route_id);
                    return Err(CoreError::RouteSendFailure(e.to_string()));
                }
                info!("Route {} to {} via relay {}", route_id, target, relay_id);
                self.events.emit(RelayEvent::RouteEstablished(route));
                Ok(route_id)
            }
            RouteEstablishment::AwaitAcknowledgment => {
                let (tx, rx) = oneshot::channel();
                lock(&self.pending).insert(route_id.clone(), tx);
                self.routes.write().await.insert(route);

                if let Err(e) = conn.send_json(&request).await {
                    lock(&self.pending).remove(&route_id);
                    self.routes.write().await.remove(&route_id);
                    return Err(CoreError::RouteSendFailure(e.to_string()));
                }

                match timeout(self.config.connection_timeout, rx).await {
                    Ok(Ok(Ok(()))) => {
                        let established = {
                            let mut routes = self.routes.write().await;
                            routes.get_mut(&route_id).map(|r| {
                                r.active = true;
                                r.touch();
                                r.clone()
                            })
                        };
                        let route = established.ok_or_else(|| CoreError::RouteNotFound(route_id.clone()))?;
                        info!("Route {} to {} acknowledged via relay {}", route_id, target, relay_id);
                        self.events.emit(RelayEvent::RouteEstablished(route));
                        Ok(route_id)
                    }
                    Ok(Ok(Err(reason))) => {
                        self.routes.write().await.remove(&route_id);
                        Err(CoreError::RouteRejected { route_id, reason })
                    }
                    Ok(Err(_)) => {
                        self.routes.write().await.remove(&route_id);
                        Err(CoreError::RouteRejected {
                            route_id,
                            reason: "relay went away".into(),
                        })
                    }
                    Err(_) => {
                        lock(&self.pending).remove(&route_id);
                        self.routes.write().await.remove(&route_id);
                        let _ = conn.send_json(&RelayMessage::RouteClose { route_id }).await;
                        Err(CoreError::Timeout)
                    }
                }
            }
        }
    }

    /// Close a route, notifying the relay on a best-effort basis
    pub async fn close_route(&self, route_id: &RouteId) -> bool {
        let Some(route) = self.routes.write().await.remove(route_id) else {
            return false;
        };

        let conn = self.connections.read().await.get(&route.relay_id).cloned();
        if let Some(conn) = conn {
            let notice = RelayMessage::RouteClose {
                route_id: route_id.clone(),
            };
            if let Err(e) = conn.send_json(&notice).await {
                trace!("Route close notice for {} not sent: {}", route_id, e);
            }
        }

        self.finish_close(route);
        true
    }

    /// Send a message through an active route; `false` if it cannot be handed to the relay
    pub async fn send_message_through_route<T: Serialize + ?Sized>(&self, route_id: &RouteId, msg: &T) -> bool {
        let data = match serde_json::to_value(msg) {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to encode message for route {}: {}", route_id, e);
                return false;
            }
        };

        let relay_id = {
            let mut routes = self.routes.write().await;
            match routes.get_mut(route_id) {
                Some(route) if route.active => {
                    route.touch();
                    route.relay_id.clone()
                }
                _ => return false,
            }
        };

        let conn = self.connections.read().await.get(&relay_id).cloned();
        let Some(conn) = conn else {
            return false;
        };
        if !conn.is_connected().await {
            return false;
        }

        let envelope = RelayMessage::RouteData {
            route_id: route_id.clone(),
            data,
        };
        match conn.send_json(&envelope).await {
            Ok(()) => true,
            Err(e) => {
                debug!("Route {} send failed: {}", route_id, e);
                false
            }
        }
    }

    async fn run_pump(weak: Weak<Self>, mut connection_rx: mpsc::UnboundedReceiver<ConnectionEvent>) {
        while let Some(event) = connection_rx.recv().await {
            let Some(this) = weak.upgrade() else { break };
            this.handle_connection_event(event).await;
        }
    }

    async fn handle_connection_event(&self, event: ConnectionEvent) {
        let relay_id = RelayId::from_address(event.peer_id.as_str());
        if !self.is_current(&relay_id, event.connection_id).await {
            trace!("Ignoring event from stale relay connection {}", event.connection_id);
            return;
        }

        match event.kind {
            ConnectionEventKind::Connected => {}
            ConnectionEventKind::Message(data) => match serde_json::from_slice::<RelayMessage>(&data) {
                Ok(msg) => self.handle_relay_message(&relay_id, msg).await,
                Err(e) => debug!("Malformed message from relay {}: {}", relay_id, e),
            },
            ConnectionEventKind::Disconnected => {
                warn!("Relay {} closed the connection", relay_id);
                let conn = self.remove_connection(&relay_id, event.connection_id).await;
                self.teardown(&relay_id, conn, false).await;
            }
            ConnectionEventKind::Error(e) => {
                // Only raised while connecting; reported by the connect path
                debug!("Relay {} connection error: {}", relay_id, e);
            }
        }
    }

    async fn handle_relay_message(&self, relay_id: &RelayId, msg: RelayMessage) {
        trace!("Relay {} sent {}", relay_id, msg.type_name());
        if let Some(info) = self.relays.write().await.get_mut(relay_id) {
            info.last_seen = Some(Utc::now());
        }

        match msg {
            RelayMessage::RouteRequest {
                route_id,
                source_peer_id,
                target_peer_id,
            } => {
                if target_peer_id != self.local_id {
                    debug!("Ignoring route request for {}", target_peer_id);
                    return;
                }
                let mut route = Route::new(
                    route_id.clone(),
                    source_peer_id.clone(),
                    target_peer_id,
                    relay_id.clone(),
                    RouteDirection::Inbound,
                );
                route.active = true;
                self.routes.write().await.insert(route.clone());
                info!("Inbound route {} from {} via relay {}", route_id, source_peer_id, relay_id);
                self.events.emit(RelayEvent::RouteEstablished(route));

                let conn = self.connections.read().await.get(relay_id).cloned();
                if let Some(conn) = conn {
                    if let Err(e) = conn.send_json(&RelayMessage::accepted(route_id)).await {
                        debug!("Route response not sent: {}", e);
                    }
                }
            }
            RelayMessage::RouteResponse {
                route_id,
                success,
                error,
                bandwidth,
            } => {
                if let Some(bandwidth) = bandwidth {
                    if let Some(info) = self.relays.write().await.get_mut(relay_id) {
                        info.bandwidth = Some(bandwidth);
                    }
                }

                let outcome = if success {
                    Ok(())
                } else {
                    Err(error.unwrap_or_else(|| "rejected by relay".into()))
                };
                let waiter = lock(&self.pending).remove(&route_id);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(outcome);
                    return;
                }

                match outcome {
                    Ok(()) => {
                        if let Some(route) = self.routes.write().await.get_mut(&route_id) {
                            route.touch();
                        }
                    }
                    Err(reason) => {
                        warn!("Route {} rejected: {}", route_id, reason);
                        let removed = self.routes.write().await.remove(&route_id);
                        if let Some(route) = removed {
                            self.finish_close(route);
                        }
                    }
                }
            }
            RelayMessage::RouteData { route_id, data } => {
                let from = {
                    let mut routes = self.routes.write().await;
                    match routes.get_mut(&route_id) {
                        Some(route) if route.active => {
                            route.touch();
                            route.remote_peer().clone()
                        }
                        _ => {
                            trace!("Data for unknown route {}", route_id);
                            return;
                        }
                    }
                };
                self.events.emit(RelayEvent::MessageReceived { route_id, from, data });
            }
            RelayMessage::RouteClose { route_id } => {
                let removed = self.routes.write().await.remove(&route_id);
                if let Some(route) = removed {
                    debug!("Relay {} closed route {}", relay_id, route_id);
                    self.finish_close(route);
                }
            }
            RelayMessage::Unknown => {}
        }
    }

    async fn is_current(&self, relay_id: &RelayId, id: ConnectionId) -> bool {
        self.connections
            .read()
            .await
            .get(relay_id)
            .map(|c| c.id() == id)
            .unwrap_or(false)
    }

    async fn remove_connection(&self, relay_id: &RelayId, id: ConnectionId) -> Option<Arc<Connection>> {
        let mut connections = self.connections.write().await;
        if connections.get(relay_id).map(|c| c.id()) == Some(id) {
            connections.remove(relay_id)
        } else {
            None
        }
    }

    pub async fn connected_count(&self) -> usize {
        self.relays
            .read()
            .await
            .values()
            .filter(|r| r.is_connected)
            .count()
    }

    pub async fn get_relay(&self, relay_id: &RelayId) -> Option<RelayInfo> {
        self.relays.read().await.get(relay_id).cloned()
    }

    /// All known relays in registration order
    pub async fn list_relays(&self) -> Vec<RelayInfo> {
        self.relays.read().await.values().cloned().collect()
    }

    pub async fn connected_relays(&self) -> Vec<RelayInfo> {
        self.relays
            .read()
            .await
            .values()
            .filter(|r| r.is_connected)
            .cloned()
            .collect()
    }

    pub async fn get_route(&self, route_id: &RouteId) -> Option<Route> {
        self.routes.read().await.get(route_id).cloned()
    }

    pub async fn list_routes(&self) -> Vec<Route> {
        self.routes.read().await.all()
    }

    pub async fn active_routes(&self) -> Vec<Route> {
        self.routes.read().await.active()
    }

    /// Routes currently carried by `relay_id`
    pub async fn routes_via(&self, relay_id: &RelayId) -> Vec<RouteId> {
        self.routes.read().await.routes_via(relay_id)
    }
}

impl Drop for RelayRouter {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swapnet_network::MemoryNetwork;

    fn config(relays: &[&str]) -> RelayConfig {
        RelayConfig {
            connection_timeout: Duration::from_millis(200),
            ..RelayConfig::with_relays(relays.iter().map(|s| s.to_string()).collect())
        }
    }

    #[test]
    fn test_relay_id_is_deterministic() {
        let a = RelayId::from_address("wss://relay.example/p2p");
        let b = RelayId::from_address("wss://relay.example/p2p");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 16);
        assert_ne!(a, RelayId::from_address("wss://other.example/p2p"));
    }

    #[test]
    fn test_route_id_format() {
        let id = RouteId::generate();
        assert!(id.as_str().starts_with("route_"));
        assert_eq!(id.as_str().len(), "route_".len() + 16);
        assert_ne!(id, RouteId::generate());
    }

    #[tokio::test]
    async fn test_seeding_preserves_order_and_dedupes() {
        let network = MemoryNetwork::new();
        let config = RelayConfig {
            bootstrap_relays: vec!["relay-b".into()],
            relays: vec!["relay-u".into(), "relay-b".into()],
            ..Default::default()
        };
        let router = RelayRouter::new("me", config, Arc::new(network.transport("me")));

        let relays = router.list_relays().await;
        assert_eq!(relays.len(), 2);
        assert_eq!(relays[0].address, "relay-b");
        assert_eq!(relays[0].relay_type, RelayType::Bootstrap);
        assert_eq!(relays[1].relay_type, RelayType::Public);
    }

    #[tokio::test]
    async fn test_create_route_without_relays() {
        let network = MemoryNetwork::new();
        let router = RelayRouter::new("me", config(&[]), Arc::new(network.transport("me")));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        router.events().on(move |event| sink.lock().unwrap().push(event.name()));

        assert!(matches!(
            router.create_route("peerX").await,
            Err(CoreError::NoRelaysAvailable)
        ));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_relay_reports_error() {
        let network = MemoryNetwork::new();
        let router = RelayRouter::new("me", config(&["relay-down"]), Arc::new(network.transport("me")));
        let mut rx = router.events().subscribe();

        let relay_id = RelayId::from_address("relay-down");
        assert!(!router.connect_to_relay(&relay_id).await);
        assert!(!router.get_relay(&relay_id).await.unwrap().is_connected);
        assert_eq!(rx.recv().await.unwrap().name(), "error");
        assert!(!router.connect_to_relay(&RelayId::from("missing")).await);
    }

    #[tokio::test]
    async fn test_add_relay_dedupes_and_auto_connects() {
        let network = MemoryNetwork::new();
        let _incoming = network.listen(&PeerId::new("relay-1"));
        let router = RelayRouter::new("me", config(&[]), Arc::new(network.transport("me")));

        let id = router.add_relay("relay-1", RelayType::Private).await;
        assert_eq!(router.add_relay("relay-1", RelayType::Public).await, id);
        assert_eq!(router.list_relays().await.len(), 1);

        let info = router.get_relay(&id).await.unwrap();
        assert!(info.is_connected);
        assert_eq!(info.relay_type, RelayType::Private);
        assert!(info.latency.is_some());

        assert!(router.remove_relay(&id).await);
        assert!(router.list_relays().await.is_empty());
        assert!(!router.remove_relay(&id).await);
    }

    #[tokio::test]
    async fn test_unknown_route_send_fails() {
        let network = MemoryNetwork::new();
        let router = RelayRouter::new("me", config(&[]), Arc::new(network.transport("me")));
        assert!(!router.send_message_through_route(&RouteId::from("nope"), &"hi").await);
        assert!(!router.close_route(&RouteId::from("nope")).await);
    }
}
