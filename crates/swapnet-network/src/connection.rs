//! Connection Management
//!
//! A [`Connection`] wraps one transport session to a named peer and its data
//! channel. It only ever moves forward through
//! `New -> Connecting -> Connected -> {Disconnected, Failed} -> Closed`;
//! owners retry by creating a fresh instance.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::error::{NetworkError, NetworkResult};
use crate::protocol::{encode_frame, PeerId};
use crate::transport::{AcceptedTransport, DataChannel, IncomingChannel, Transport};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier
pub type ConnectionId = u64;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, connect not called yet
    New,
    /// Session being established
    Connecting,
    /// Data channel open
    Connected,
    /// Remote side went away
    Disconnected,
    /// Did not become ready
    Failed,
    /// Resources released
    Closed,
}

/// Lifecycle notification from a connection
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub connection_id: ConnectionId,
    pub peer_id: PeerId,
    pub kind: ConnectionEventKind,
}

#[derive(Debug, Clone)]
pub enum ConnectionEventKind {
    /// Data channel is open
    Connected,
    /// Remote side closed the session
    Disconnected,
    /// Connection attempt failed
    Error(NetworkError),
    /// Frame received
    Message(Bytes),
}

/// Sending half of the lifecycle channel an owner hands to its connections
pub type ConnectionEventSender = mpsc::UnboundedSender<ConnectionEvent>;

struct Inner {
    state: ConnectionState,
    channel: Option<Arc<dyn DataChannel>>,
    /// Frames sent before the channel opened
    queue: VecDeque<Bytes>,
    reader: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    /// Connect latency (microseconds, 0 = unknown)
    latency_us: AtomicU64,
}

/// A connection to a peer
pub struct Connection {
    id: ConnectionId,
    peer_id: PeerId,
    transport: Arc<dyn Transport>,
    connect_timeout: Duration,
    events: ConnectionEventSender,
    inner: Arc<Mutex<Inner>>,
    /// Serializes sends on the open channel without holding `inner`
    send_lock: Mutex<()>,
    attempt: OnceCell<NetworkResult<()>>,
    counters: Arc<Counters>,
}

impl Connection {
    /// Create a new connection
    pub fn new(
        peer_id: PeerId,
        transport: Arc<dyn Transport>,
        connect_timeout: Duration,
        events: ConnectionEventSender,
    ) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer_id,
            transport,
            connect_timeout,
            events,
            inner: Arc::new(Mutex::new(Inner {
                state: ConnectionState::New,
                channel: None,
                queue: VecDeque::new(),
                reader: None,
            })),
            send_lock: Mutex::new(()),
            attempt: OnceCell::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Wrap a channel a remote peer opened to us
    pub fn accept(
        incoming: IncomingChannel,
        connect_timeout: Duration,
        events: ConnectionEventSender,
    ) -> Self {
        let peer_id = incoming.remote.clone();
        Self::new(
            peer_id,
            Arc::new(AcceptedTransport::new(incoming)),
            connect_timeout,
            events,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Get connection state
    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    /// Time it took the channel to open
    pub fn latency(&self) -> Option<Duration> {
        match self.counters.latency_us.load(Ordering::Relaxed) {
            0 => None,
            us => Some(Duration::from_micros(us)),
        }
    }

    pub fn bytes_sent(&self) -> u64 {
        self.counters.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.counters.bytes_received.load(Ordering::Relaxed)
    }

    /// Establish the session.
    ///
    /// Resolves immediately when already connected. Concurrent callers share
    /// the single attempt this instance makes.
    pub async fn connect(&self) -> NetworkResult<()> {
        match self.state().await {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::New | ConnectionState::Connecting => {}
            _ => {
                return match self.attempt.get() {
                    Some(Err(e)) => Err(e.clone()),
                    _ => Err(NetworkError::NotConnected),
                }
            }
        }

        self.attempt.get_or_init(|| self.establish()).await.clone()
    }

    async fn establish(&self) -> NetworkResult<()> {
        {
            let mut inner = self.inner.lock().await;
            if inner.state != ConnectionState::New {
                return Err(NetworkError::NotConnected);
            }
            inner.state = ConnectionState::Connecting;
        }
        debug!("Connecting to {}", self.peer_id);

        let started = Instant::now();
        let opening = async {
            let channel: Arc<dyn DataChannel> = Arc::from(self.transport.dial(&self.peer_id).await?);
            {
                let mut inner = self.inner.lock().await;
                if inner.state != ConnectionState::Connecting {
                    drop(inner);
                    channel.close().await;
                    return Err(NetworkError::NotConnected);
                }
                inner.channel = Some(channel.clone());
            }
            channel.opened().await?;
            Ok::<_, NetworkError>(channel)
        };

        let channel = match timeout(self.connect_timeout, opening).await {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => {
                self.fail(e.clone()).await;
                return Err(e);
            }
            Err(_) => {
                let e = NetworkError::TimeoutWithMessage(format!(
                    "{} not ready after {:?}",
                    self.peer_id, self.connect_timeout
                ));
                self.fail(e.clone()).await;
                return Err(e);
            }
        };

        let mut inner = self.inner.lock().await;
        if inner.state != ConnectionState::Connecting {
            // Closed while the channel was opening
            return Err(NetworkError::NotConnected);
        }

        while let Some(data) = inner.queue.pop_front() {
            let len = data.len() as u64;
            if let Err(e) = channel.send(data).await {
                drop(inner);
                self.fail(e.clone()).await;
                return Err(e);
            }
            self.counters.bytes_sent.fetch_add(len, Ordering::Relaxed);
        }

        let latency = started.elapsed();
        self.counters
            .latency_us
            .store(latency.as_micros().max(1) as u64, Ordering::Relaxed);
        inner.state = ConnectionState::Connected;
        inner.reader = Some(self.spawn_reader(channel));
        drop(inner);

        debug!("Connected to {} in {:?}", self.peer_id, latency);
        self.emit(ConnectionEventKind::Connected);
        Ok(())
    }

    async fn fail(&self, error: NetworkError) {
        let was_connecting = {
            let mut inner = self.inner.lock().await;
            if inner.state == ConnectionState::Connecting {
                inner.state = ConnectionState::Failed;
                true
            } else {
                false
            }
        };

        if was_connecting {
            warn!("Connection to {} failed: {}", self.peer_id, error);
            self.emit(ConnectionEventKind::Error(error));
            self.disconnect().await;
        }
    }

    fn spawn_reader(&self, channel: Arc<dyn DataChannel>) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let counters = self.counters.clone();
        let events = self.events.clone();
        let connection_id = self.id;
        let peer_id = self.peer_id.clone();

        tokio::spawn(async move {
            while let Some(data) = channel.recv().await {
                trace!("Received {} bytes from {}", data.len(), peer_id);
                counters
                    .bytes_received
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                let _ = events.send(ConnectionEvent {
                    connection_id,
                    peer_id: peer_id.clone(),
                    kind: ConnectionEventKind::Message(data),
                });
            }

            let mut inner = inner.lock().await;
            if inner.state == ConnectionState::Connected {
                inner.state = ConnectionState::Disconnected;
                inner.channel = None;
                inner.reader = None;
                drop(inner);
                debug!("Remote side closed connection to {}", peer_id);
                let _ = events.send(ConnectionEvent {
                    connection_id,
                    peer_id,
                    kind: ConnectionEventKind::Disconnected,
                });
            }
        })
    }

    /// Send one frame, queueing it while the session is still opening
    pub async fn send(&self, data: Bytes) -> NetworkResult<()> {
        // Held across the send so frames leave in call order
        let _sending = self.send_lock.lock().await;
        let channel = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                ConnectionState::New | ConnectionState::Connecting => {
                    trace!("Queueing {} bytes for {}", data.len(), self.peer_id);
                    inner.queue.push_back(data);
                    return Ok(());
                }
                ConnectionState::Connected => {
                    inner.channel.clone().ok_or(NetworkError::NotConnected)?
                }
                _ => return Err(NetworkError::NotConnected),
            }
        };

        let len = data.len() as u64;
        channel.send(data).await?;
        self.counters.bytes_sent.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    /// Serialize and send a message
    pub async fn send_json<T: Serialize + ?Sized>(&self, msg: &T) -> NetworkResult<()> {
        self.send(encode_frame(msg)?).await
    }

    /// Release the session. Idempotent; always ends in `Closed`.
    pub async fn disconnect(&self) {
        let channel = {
            let mut inner = self.inner.lock().await;
            if inner.state == ConnectionState::Closed {
                return;
            }
            debug!("Connection {} state: {:?} -> Closed", self.peer_id, inner.state);
            inner.state = ConnectionState::Closed;
            inner.queue.clear();
            if let Some(reader) = inner.reader.take() {
                reader.abort();
            }
            inner.channel.take()
        };

        if let Some(channel) = channel {
            channel.close().await;
        }
    }

    fn emit(&self, kind: ConnectionEventKind) {
        let _ = self.events.send(ConnectionEvent {
            connection_id: self.id,
            peer_id: self.peer_id.clone(),
            kind,
        });
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;

    fn setup(timeout: Duration) -> (
        MemoryNetwork,
        Connection,
        mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        let network = MemoryNetwork::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::new(
            PeerId::new("b"),
            Arc::new(network.transport("a")),
            timeout,
            tx,
        );
        (network, conn, rx)
    }

    #[tokio::test]
    async fn test_connection_lifecycle() {
        let (network, conn, mut events) = setup(Duration::from_secs(5));
        let mut incoming = network.listen(&PeerId::new("b"));

        assert_eq!(conn.state().await, ConnectionState::New);
        conn.connect().await.unwrap();
        assert_eq!(conn.state().await, ConnectionState::Connected);
        assert!(conn.latency().is_some());
        assert!(matches!(events.recv().await.unwrap().kind, ConnectionEventKind::Connected));

        // Already connected resolves immediately
        conn.connect().await.unwrap();

        let remote = incoming.recv().await.unwrap();
        remote.channel.send(Bytes::from_static(b"hi")).await.unwrap();
        match events.recv().await.unwrap().kind {
            ConnectionEventKind::Message(data) => assert_eq!(data, Bytes::from_static(b"hi")),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(conn.bytes_received(), 2);

        conn.disconnect().await;
        conn.disconnect().await;
        assert_eq!(conn.state().await, ConnectionState::Closed);
        assert!(remote.channel.recv().await.is_none());
        assert!(matches!(conn.send(Bytes::new()).await, Err(NetworkError::NotConnected)));
    }

    #[tokio::test]
    async fn test_queued_sends_flush_in_order() {
        let (network, conn, _events) = setup(Duration::from_secs(5));
        let b = PeerId::new("b");
        let mut incoming = network.listen(&b);
        network.hold(&b);

        let conn = Arc::new(conn);
        let connecting = tokio::spawn({
            let conn = conn.clone();
            async move { conn.connect().await }
        });

        while conn.state().await != ConnectionState::Connecting {
            tokio::task::yield_now().await;
        }
        for i in 0..5u8 {
            conn.send(Bytes::from(vec![i])).await.unwrap();
        }

        network.release(&b);
        connecting.await.unwrap().unwrap();
        conn.send(Bytes::from(vec![5u8])).await.unwrap();

        let remote = incoming.recv().await.unwrap();
        for i in 0..6u8 {
            assert_eq!(remote.channel.recv().await.unwrap(), Bytes::from(vec![i]));
        }
        assert_eq!(conn.bytes_sent(), 6);
    }

    #[tokio::test]
    async fn test_concurrent_connect_shares_attempt() {
        let (network, conn, _events) = setup(Duration::from_secs(5));
        let b = PeerId::new("b");
        let _incoming = network.listen(&b);
        network.hold(&b);

        let conn = Arc::new(conn);
        let first = tokio::spawn({
            let conn = conn.clone();
            async move { conn.connect().await }
        });
        let second = tokio::spawn({
            let conn = conn.clone();
            async move { conn.connect().await }
        });

        while network.dial_count(&b) == 0 {
            tokio::task::yield_now().await;
        }
        network.release(&b);

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(network.dial_count(&b), 1);
    }

    #[tokio::test]
    async fn test_timeout_fails_and_closes() {
        let (_network, conn, mut events) = setup(Duration::from_millis(50));

        let result = conn.connect().await;
        assert!(matches!(result, Err(NetworkError::TimeoutWithMessage(_))));
        assert_eq!(conn.state().await, ConnectionState::Closed);
        assert!(matches!(
            events.recv().await.unwrap().kind,
            ConnectionEventKind::Error(NetworkError::TimeoutWithMessage(_))
        ));

        // A finished instance reports its failure again
        assert!(matches!(conn.connect().await, Err(NetworkError::TimeoutWithMessage(_))));
    }

    #[tokio::test]
    async fn test_remote_close_marks_disconnected() {
        let (network, conn, mut events) = setup(Duration::from_secs(5));
        let mut incoming = network.listen(&PeerId::new("b"));
        conn.connect().await.unwrap();
        let _ = events.recv().await;

        let remote = incoming.recv().await.unwrap();
        remote.channel.close().await;

        let event = events.recv().await.unwrap();
        assert!(matches!(event.kind, ConnectionEventKind::Disconnected));
        assert_eq!(event.connection_id, conn.id());
        assert_eq!(conn.state().await, ConnectionState::Disconnected);

        conn.disconnect().await;
        assert_eq!(conn.state().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_accepted_connection() {
        let network = MemoryNetwork::new();
        let b = PeerId::new("b");
        let mut incoming = network.listen(&b);
        let (a_tx, _a_events) = mpsc::unbounded_channel();
        let dialer = Connection::new(b.clone(), Arc::new(network.transport("a")), Duration::from_secs(5), a_tx);
        dialer.connect().await.unwrap();

        let (b_tx, mut b_events) = mpsc::unbounded_channel();
        let accepted = Connection::accept(incoming.recv().await.unwrap(), Duration::from_secs(5), b_tx);
        assert_eq!(accepted.peer_id(), &PeerId::new("a"));
        accepted.connect().await.unwrap();
        assert!(matches!(b_events.recv().await.unwrap().kind, ConnectionEventKind::Connected));

        dialer.send(Bytes::from_static(b"hello")).await.unwrap();
        match b_events.recv().await.unwrap().kind {
            ConnectionEventKind::Message(data) => assert_eq!(data, Bytes::from_static(b"hello")),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnect_while_connecting() {
        let (network, conn, _events) = setup(Duration::from_secs(5));
        let b = PeerId::new("b");
        let _incoming = network.listen(&b);
        network.hold(&b);

        let conn = Arc::new(conn);
        let connecting = tokio::spawn({
            let conn = conn.clone();
            async move { conn.connect().await }
        });
        while network.dial_count(&b) == 0 {
            tokio::task::yield_now().await;
        }

        conn.disconnect().await;
        network.release(&b);
        assert!(connecting.await.unwrap().is_err());
        assert_eq!(conn.state().await, ConnectionState::Closed);
    }

    /// Channel whose sends hang until it is closed
    struct StalledChannel {
        gate: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl DataChannel for StalledChannel {
        async fn opened(&self) -> NetworkResult<()> {
            Ok(())
        }

        async fn send(&self, _data: Bytes) -> NetworkResult<()> {
            self.gate.notified().await;
            Err(NetworkError::ChannelClosed)
        }

        async fn recv(&self) -> Option<Bytes> {
            std::future::pending().await
        }

        async fn close(&self) {
            self.gate.notify_waiters();
        }
    }

    struct StalledTransport;

    #[async_trait::async_trait]
    impl Transport for StalledTransport {
        async fn dial(&self, _peer: &PeerId) -> NetworkResult<Box<dyn DataChannel>> {
            Ok(Box::new(StalledChannel {
                gate: tokio::sync::Notify::new(),
            }))
        }
    }

    #[tokio::test]
    async fn test_stalled_send_leaves_state_readable() {
        let (tx, _events) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection::new(
            PeerId::new("b"),
            Arc::new(StalledTransport),
            Duration::from_secs(1),
            tx,
        ));
        conn.connect().await.unwrap();

        let sending = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(Bytes::from_static(b"order")).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!sending.is_finished());

        let state = timeout(Duration::from_millis(200), conn.state()).await.unwrap();
        assert_eq!(state, ConnectionState::Connected);
        timeout(Duration::from_millis(200), conn.disconnect()).await.unwrap();

        assert!(sending.await.unwrap().is_err());
        assert_eq!(conn.state().await, ConnectionState::Closed);
    }
}
