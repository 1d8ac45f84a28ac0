//! In-Memory Network
//!
//! Process-local transport and rendezvous server. Used by the simulator and
//! by tests, where it stands in for WebRTC sessions and a WebSocket
//! signaling server.
//!
//! A dial to an endpoint that is listening opens immediately, unless the
//! endpoint is held; held dials open on [`MemoryNetwork::release`]. A dial to
//! an endpoint nobody listens on never opens, which is how a NAT-blocked
//! peer looks from the dialing side.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::error::{NetworkError, NetworkResult};
use crate::protocol::PeerId;
use crate::signaling::{SignalingChannel, SignalingConnector, SignalingErrorPayload, SignalingMessage};
use crate::transport::{DataChannel, IncomingChannel, Transport};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct NetworkState {
    listeners: HashMap<PeerId, mpsc::UnboundedSender<IncomingChannel>>,
    held: HashSet<PeerId>,
    gates: HashMap<PeerId, Vec<watch::Sender<bool>>>,
    dials: HashMap<PeerId, usize>,
}

/// Shared in-process network
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept sessions addressed to `id`
    pub fn listen(&self, id: &PeerId) -> mpsc::UnboundedReceiver<IncomingChannel> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.state).listeners.insert(id.clone(), tx);
        debug!("Memory endpoint listening: {}", id);
        rx
    }

    /// Stop accepting sessions for `id`
    pub fn unlisten(&self, id: &PeerId) {
        lock(&self.state).listeners.remove(id);
    }

    /// Transport that dials as `local`
    pub fn transport(&self, local: impl Into<PeerId>) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            local: local.into(),
        }
    }

    /// Keep sessions to `id` from opening until released
    pub fn hold(&self, id: &PeerId) {
        lock(&self.state).held.insert(id.clone());
    }

    /// Open every held session to `id`
    pub fn release(&self, id: &PeerId) {
        let gates = {
            let mut state = lock(&self.state);
            state.held.remove(id);
            state.gates.remove(id).unwrap_or_default()
        };
        for gate in gates {
            let _ = gate.send(true);
        }
    }

    /// Number of dials ever made to `id`
    pub fn dial_count(&self, id: &PeerId) -> usize {
        lock(&self.state).dials.get(id).copied().unwrap_or(0)
    }

    fn connect(&self, from: &PeerId, to: &PeerId) -> MemoryChannel {
        let (open_tx, open_rx) = watch::channel(false);
        let (dialer, acceptor) = MemoryChannel::pair(open_rx);

        let mut state = lock(&self.state);
        *state.dials.entry(to.clone()).or_insert(0) += 1;

        let delivered = match state.listeners.get(to) {
            Some(listener) => listener
                .send(IncomingChannel {
                    remote: from.clone(),
                    channel: Box::new(acceptor),
                })
                .is_ok(),
            None => false,
        };

        if delivered && !state.held.contains(to) {
            let _ = open_tx.send(true);
            trace!("Memory session {} -> {} opened", from, to);
        } else {
            trace!("Memory session {} -> {} pending", from, to);
            state.gates.entry(to.clone()).or_default().push(open_tx);
        }

        dialer
    }
}

/// Dialing side of a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local: PeerId,
}

impl MemoryTransport {
    pub fn local_id(&self) -> &PeerId {
        &self.local
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn dial(&self, peer: &PeerId) -> NetworkResult<Box<dyn DataChannel>> {
        if peer == &self.local {
            return Err(NetworkError::ConnectionFailed("cannot dial self".into()));
        }
        Ok(Box::new(self.network.connect(&self.local, peer)))
    }
}

/// One end of an in-memory session
pub struct MemoryChannel {
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    open: watch::Receiver<bool>,
    closed: watch::Sender<bool>,
}

impl MemoryChannel {
    fn pair(open: watch::Receiver<bool>) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let a = Self {
            tx: Mutex::new(Some(a_tx)),
            rx: tokio::sync::Mutex::new(a_rx),
            open: open.clone(),
            closed: watch::channel(false).0,
        };
        let b = Self {
            tx: Mutex::new(Some(b_tx)),
            rx: tokio::sync::Mutex::new(b_rx),
            open,
            closed: watch::channel(false).0,
        };
        (a, b)
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    async fn opened(&self) -> NetworkResult<()> {
        let mut open = self.open.clone();
        let mut closed = self.closed.subscribe();
        loop {
            if *closed.borrow() {
                return Err(NetworkError::ChannelClosed);
            }
            if *open.borrow() {
                return Ok(());
            }
            tokio::select! {
                changed = open.changed() => {
                    if changed.is_err() {
                        let is_open = *open.borrow();
                        return if is_open {
                            Ok(())
                        } else {
                            Err(NetworkError::ConnectionFailed("session abandoned".into()))
                        };
                    }
                }
                _ = closed.changed() => {}
            }
        }
    }

    async fn send(&self, data: Bytes) -> NetworkResult<()> {
        if !*self.open.borrow() {
            return Err(NetworkError::NotConnected);
        }
        match lock(&self.tx).as_ref() {
            Some(tx) => tx.send(data).map_err(|_| NetworkError::ChannelClosed),
            None => Err(NetworkError::ChannelClosed),
        }
    }

    async fn recv(&self) -> Option<Bytes> {
        if self.is_closed() {
            return None;
        }
        let mut closed = self.closed.subscribe();
        let mut rx = self.rx.lock().await;
        tokio::select! {
            data = rx.recv() => data,
            _ = closed.wait_for(|c| *c) => None,
        }
    }

    async fn close(&self) {
        lock(&self.tx).take();
        self.closed.send_replace(true);
    }
}

type ServerClients = HashMap<PeerId, mpsc::UnboundedSender<SignalingMessage>>;

/// In-process rendezvous servers, addressed by URL
#[derive(Clone, Default)]
pub struct MemorySignaling {
    servers: Arc<Mutex<HashMap<String, ServerClients>>>,
}

impl MemorySignaling {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring a server up at `url`
    pub fn add_server(&self, url: impl Into<String>) {
        lock(&self.servers).entry(url.into()).or_default();
    }

    /// Peers currently registered at `url`
    pub fn registered(&self, url: &str) -> Vec<PeerId> {
        lock(&self.servers)
            .get(url)
            .map(|clients| clients.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn route(
        &self,
        server: &str,
        reply: &mpsc::UnboundedSender<SignalingMessage>,
        msg: SignalingMessage,
    ) -> NetworkResult<Option<PeerId>> {
        let mut servers = lock(&self.servers);
        let clients = servers
            .get_mut(server)
            .ok_or_else(|| NetworkError::Signaling(format!("server {} is down", server)))?;

        match &msg {
            SignalingMessage::Register(payload) => {
                let from = payload.from.clone();
                for (id, client) in clients.iter() {
                    if id == &from {
                        continue;
                    }
                    let _ = client.send(msg.clone());
                    let _ = reply.send(SignalingMessage::register(id.clone()));
                }
                clients.insert(from.clone(), reply.clone());
                Ok(Some(from))
            }
            _ => {
                let Some(to) = msg.recipient() else {
                    return Ok(None);
                };
                match clients.get(to) {
                    Some(client) => {
                        let _ = client.send(msg.clone());
                    }
                    None => {
                        let _ = reply.send(SignalingMessage::Error(SignalingErrorPayload {
                            from: None,
                            to: msg.sender().cloned(),
                            message: format!("peer {} is not registered", to),
                        }));
                    }
                }
                Ok(None)
            }
        }
    }

    fn leave(&self, server: &str, id: &PeerId) {
        if let Some(clients) = lock(&self.servers).get_mut(server) {
            clients.remove(id);
        }
    }
}

#[async_trait]
impl SignalingConnector for MemorySignaling {
    async fn connect(&self, server: &str) -> NetworkResult<Box<dyn SignalingChannel>> {
        if !lock(&self.servers).contains_key(server) {
            return Err(NetworkError::Signaling(format!("no server at {}", server)));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Box::new(MemorySignalingChannel {
            hub: self.clone(),
            server: server.to_string(),
            tx,
            rx: tokio::sync::Mutex::new(rx),
            registered: Mutex::new(None),
            closed: watch::channel(false).0,
        }))
    }
}

struct MemorySignalingChannel {
    hub: MemorySignaling,
    server: String,
    tx: mpsc::UnboundedSender<SignalingMessage>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SignalingMessage>>,
    registered: Mutex<Option<PeerId>>,
    closed: watch::Sender<bool>,
}

#[async_trait]
impl SignalingChannel for MemorySignalingChannel {
    async fn send(&self, msg: SignalingMessage) -> NetworkResult<()> {
        if *self.closed.borrow() {
            return Err(NetworkError::ChannelClosed);
        }
        if let Some(id) = self.hub.route(&self.server, &self.tx, msg)? {
            *lock(&self.registered) = Some(id);
        }
        Ok(())
    }

    async fn recv(&self) -> Option<SignalingMessage> {
        if *self.closed.borrow() {
            return None;
        }
        let mut closed = self.closed.subscribe();
        let mut rx = self.rx.lock().await;
        tokio::select! {
            msg = rx.recv() => msg,
            _ = closed.wait_for(|c| *c) => None,
        }
    }

    async fn close(&self) {
        if let Some(id) = lock(&self.registered).take() {
            self.hub.leave(&self.server, &id);
        }
        self.closed.send_replace(true);
    }
}
