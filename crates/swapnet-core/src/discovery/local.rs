//! Local network discovery
//!
//! Broadcasts a small JSON beacon over UDP and reports every beacon heard
//! from another node running the same service.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use swapnet_network::{NetworkError, PeerId};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::source::{DiscoverySource, FoundPeer, FoundPeerSink};
use crate::error::CoreResult;
use crate::registry::PeerType;

/// Service name carried in every beacon
pub const BEACON_SERVICE: &str = "swapnet";

const MAX_BEACON_SIZE: usize = 1024;

/// Pause after a transient receive error
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Receive errors the socket recovers from on its own, such as ICMP
/// port-unreachable surfacing as a reset
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Beacon {
    service: String,
    peer_id: PeerId,
}

struct Running {
    socket: Arc<UdpSocket>,
    reader: JoinHandle<()>,
}

pub struct LocalNetworkDiscovery {
    local_id: PeerId,
    bind_addr: SocketAddr,
    announce_addr: SocketAddr,
    running: Mutex<Option<Running>>,
}

impl LocalNetworkDiscovery {
    pub fn new(local_id: PeerId, bind_addr: SocketAddr, announce_addr: SocketAddr) -> Self {
        Self {
            local_id,
            bind_addr,
            announce_addr,
            running: Mutex::new(None),
        }
    }

    /// Listen on all interfaces and broadcast to the subnet on `port`
    pub fn on_port(local_id: PeerId, port: u16) -> Self {
        Self::new(
            local_id,
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)),
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, port)),
        )
    }

    /// Address the socket is bound to, once started
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let running = self.running.lock().await;
        running.as_ref().and_then(|r| r.socket.local_addr().ok())
    }

    fn beacon(&self) -> CoreResult<Vec<u8>> {
        Ok(serde_json::to_vec(&Beacon {
            service: BEACON_SERVICE.to_string(),
            peer_id: self.local_id.clone(),
        })?)
    }

    async fn send_beacon(&self, socket: &UdpSocket) -> CoreResult<()> {
        let beacon = self.beacon()?;
        socket
            .send_to(&beacon, self.announce_addr)
            .await
            .map_err(NetworkError::from)?;
        trace!("Beacon sent to {}", self.announce_addr);
        Ok(())
    }
}

#[async_trait]
impl DiscoverySource for LocalNetworkDiscovery {
    fn name(&self) -> &str {
        "local_network"
    }

    fn peer_type(&self) -> PeerType {
        PeerType::LocalNetwork
    }

    async fn start(&self, sink: FoundPeerSink) -> CoreResult<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let socket = UdpSocket::bind(self.bind_addr)
            .await
            .map_err(|e| NetworkError::BindError(format!("{}: {}", self.bind_addr, e)))?;
        socket.set_broadcast(true).map_err(NetworkError::from)?;
        let socket = Arc::new(socket);
        info!("Local discovery listening on {}", self.bind_addr);

        let local_id = self.local_id.clone();
        let reader_socket = socket.clone();
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; MAX_BEACON_SIZE];
            loop {
                let (len, from) = match reader_socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) if is_transient(&e) => {
                        debug!("Local discovery receive error: {}", e);
                        tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                        continue;
                    }
                    Err(e) => {
                        warn!("Local discovery socket failed, stopping reader: {}", e);
                        break;
                    }
                };
                let beacon: Beacon = match serde_json::from_slice(&buf[..len]) {
                    Ok(beacon) => beacon,
                    Err(_) => continue,
                };
                if beacon.service != BEACON_SERVICE || beacon.peer_id == local_id {
                    continue;
                }
                debug!("Beacon from {} at {}", beacon.peer_id, from);
                let found = FoundPeer::new(beacon.peer_id, PeerType::LocalNetwork)
                    .with_meta("address", from.to_string());
                if sink.send(found).is_err() {
                    break;
                }
            }
        });

        if let Err(e) = self.send_beacon(&socket).await {
            warn!("Initial beacon failed: {}", e);
        }
        *running = Some(Running { socket, reader });
        Ok(())
    }

    async fn announce(&self) -> CoreResult<()> {
        let socket = match self.running.lock().await.as_ref() {
            Some(running) => running.socket.clone(),
            None => return Ok(()),
        };
        self.send_beacon(&socket).await
    }

    async fn stop(&self) {
        if let Some(running) = self.running.lock().await.take() {
            running.reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    #[tokio::test]
    async fn test_beacon_between_two_nodes() {
        // b listens on an ephemeral port; a announces straight to it
        let b = LocalNetworkDiscovery::new(PeerId::new("b"), loopback(0), loopback(9));
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        b.start(b_tx).await.unwrap();
        let b_addr = b.local_addr().await.unwrap();

        let a = LocalNetworkDiscovery::new(PeerId::new("a"), loopback(0), b_addr);
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        a.start(a_tx).await.unwrap();

        let found = tokio::time::timeout(Duration::from_secs(2), b_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.peer_id, PeerId::new("a"));
        assert_eq!(found.peer_type, PeerType::LocalNetwork);
        assert!(found.metadata.contains_key("address"));

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_own_and_foreign_beacons_ignored() {
        let node = LocalNetworkDiscovery::new(PeerId::new("me"), loopback(0), loopback(9));
        let (tx, mut rx) = mpsc::unbounded_channel();
        node.start(tx).await.unwrap();
        let addr = node.local_addr().await.unwrap();

        let sender = UdpSocket::bind(loopback(0)).await.unwrap();
        sender
            .send_to(br#"{"service":"swapnet","peer_id":"me"}"#, addr)
            .await
            .unwrap();
        sender
            .send_to(br#"{"service":"other","peer_id":"x"}"#, addr)
            .await
            .unwrap();
        sender
            .send_to(br#"{"service":"swapnet","peer_id":"y"}"#, addr)
            .await
            .unwrap();

        let found = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.peer_id, PeerId::new("y"));
    }

    #[test]
    fn test_receive_error_classification() {
        // Windows reports ICMP port-unreachable on the next recv
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(!is_transient(&io::Error::new(io::ErrorKind::Other, "socket closed")));
    }

    #[test]
    fn test_on_port_uses_broadcast() {
        let node = LocalNetworkDiscovery::on_port(PeerId::new("a"), 41234);
        assert_eq!(node.announce_addr.port(), 41234);
        assert!(node.bind_addr.ip().is_unspecified());
    }
}
