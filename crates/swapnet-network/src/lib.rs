//! swapnet Network Layer
//!
//! Provides the transport-facing primitives of the exchange's peer layer:
//! - Peer identifiers and JSON framing
//! - Transport / data channel abstraction
//! - Connection lifecycle with send queueing and timeouts
//! - Rendezvous signaling envelopes
//! - In-memory network for tests and simulation

pub mod error;
pub mod protocol;
pub mod transport;
pub mod connection;
pub mod signaling;
pub mod memory;

pub use error::{NetworkError, NetworkResult};
pub use protocol::{decode_frame, encode_frame, PeerId};
pub use transport::{AcceptedTransport, DataChannel, IncomingChannel, Transport};
pub use connection::{
    Connection, ConnectionEvent, ConnectionEventKind, ConnectionEventSender, ConnectionId,
    ConnectionState,
};
pub use signaling::{SignalingChannel, SignalingConnector, SignalingMessage};
pub use memory::{MemoryNetwork, MemorySignaling, MemoryTransport};
