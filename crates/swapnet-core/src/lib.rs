//! swapnet Core
//!
//! Peer connectivity for the exchange:
//! - Peer registry and multi-source peer discovery
//! - Relay registry and route management for NAT traversal
//! - Relay-side forwarding server
//! - Typed event bus shared by both engines

pub mod config;
pub mod context;
pub mod discovery;
pub mod error;
pub mod events;
pub mod registry;
pub mod relay;

pub use config::{
    DiscoveryConfig, NetworkConfig, RelayConfig, RelaySelection, RouteEstablishment,
    DEFAULT_BOOTSTRAP_RELAYS, DEFAULT_LOCAL_DISCOVERY_PORT,
};
pub use context::{NetworkContext, PeerPath};
pub use discovery::{
    DiscoveryEvent, DiscoverySource, FoundPeer, LocalNetworkDiscovery, PeerDiscovery,
    RendezvousDiscovery,
};
pub use error::{CoreError, CoreResult};
pub use events::{Event, EventBus, EventKind, ListenerId};
pub use registry::{PeerInfo, PeerRegistry, PeerStatus, PeerType};
pub use relay::{
    RelayEvent, RelayId, RelayInfo, RelayMessage, RelayRouter, RelayServer, RelayType, Route,
    RouteDirection, RouteId,
};
