//! Transport Abstraction
//!
//! The concrete peer-to-peer transport (WebRTC in the browser build, the
//! in-memory network in tests and the simulator) is reached only through
//! these two traits.

use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{NetworkError, NetworkResult};
use crate::protocol::PeerId;

/// One reliable, ordered data channel to a remote peer
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Resolves once the channel can carry data
    async fn opened(&self) -> NetworkResult<()>;

    /// Send one frame
    async fn send(&self, data: Bytes) -> NetworkResult<()>;

    /// Receive the next frame, `None` once the remote side has closed
    async fn recv(&self) -> Option<Bytes>;

    /// Close the channel and release the session
    async fn close(&self);
}

/// Factory for outgoing data channels
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start a session to `peer`. The returned channel may not be open yet.
    async fn dial(&self, peer: &PeerId) -> NetworkResult<Box<dyn DataChannel>>;
}

/// A data channel opened by a remote peer
pub struct IncomingChannel {
    /// Who dialed us
    pub remote: PeerId,
    /// The channel itself
    pub channel: Box<dyn DataChannel>,
}

impl std::fmt::Debug for IncomingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingChannel")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

/// Transport that hands out one already accepted channel.
///
/// Lets an incoming session go through the same [`Connection`](crate::Connection)
/// lifecycle as an outgoing one.
pub struct AcceptedTransport {
    remote: PeerId,
    channel: Mutex<Option<Box<dyn DataChannel>>>,
}

impl AcceptedTransport {
    pub fn new(incoming: IncomingChannel) -> Self {
        Self {
            remote: incoming.remote,
            channel: Mutex::new(Some(incoming.channel)),
        }
    }
}

#[async_trait]
impl Transport for AcceptedTransport {
    async fn dial(&self, peer: &PeerId) -> NetworkResult<Box<dyn DataChannel>> {
        if peer != &self.remote {
            return Err(NetworkError::PeerNotFound(peer.to_string()));
        }
        self.channel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| NetworkError::ConnectionFailed("accepted channel already used".into()))
    }
}
