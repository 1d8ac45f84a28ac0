//! Core configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Relays every node knows about before any user configuration
pub const DEFAULT_BOOTSTRAP_RELAYS: &[&str] = &[
    "wss://relay1.swapnet.exchange/p2p",
    "wss://relay2.swapnet.exchange/p2p",
];

/// UDP port for local-network beacons
pub const DEFAULT_LOCAL_DISCOVERY_PORT: u16 = 41234;

/// Peer discovery configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Rendezvous server addresses
    pub signaling_servers: Vec<String>,

    /// Peers to connect to on start
    pub bootstrap_peers: Vec<String>,

    /// Ask connected peers for their peers every discovery tick
    pub enable_dht: bool,

    /// Broadcast UDP beacons on the local network
    pub enable_local_discovery: bool,

    /// Beacon port for local discovery
    pub local_discovery_port: u16,

    /// Ceiling on connected peers
    pub max_peers: usize,

    /// How long a connection may take to become ready
    pub connection_timeout: Duration,

    /// Interval of the reconnect loop
    pub reconnect_interval: Duration,

    /// Interval of the discovery loop
    pub discovery_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            signaling_servers: Vec::new(),
            bootstrap_peers: Vec::new(),
            enable_dht: false,
            enable_local_discovery: false,
            local_discovery_port: DEFAULT_LOCAL_DISCOVERY_PORT,
            max_peers: 10,
            connection_timeout: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(60),
            discovery_interval: Duration::from_secs(30),
        }
    }
}

impl DiscoveryConfig {
    /// Validate configuration
    pub fn validate(&self) -> CoreResult<()> {
        if self.max_peers == 0 {
            return Err(CoreError::Config("max_peers must be at least 1".into()));
        }
        if self.connection_timeout.is_zero() {
            return Err(CoreError::Config("connection_timeout must be non-zero".into()));
        }
        if self.reconnect_interval.is_zero() || self.discovery_interval.is_zero() {
            return Err(CoreError::Config("discovery intervals must be non-zero".into()));
        }
        Ok(())
    }
}

/// How the router picks a relay for a new route
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelaySelection {
    /// First connected relay in registration order
    #[default]
    FirstAvailable,
    /// Connected relay with the lowest measured connect latency
    LowestLatency,
}

/// When a requested route counts as established
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteEstablishment {
    /// Active as soon as the request is handed to the relay
    #[default]
    Optimistic,
    /// Active only after a successful route response
    AwaitAcknowledgment,
}

/// Relay router configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayConfig {
    /// User-supplied relay addresses
    pub relays: Vec<String>,

    /// Built-in relay addresses
    pub bootstrap_relays: Vec<String>,

    /// Ceiling on connected relays
    pub max_relays: usize,

    /// How long a relay connection (or route acknowledgment) may take
    pub connection_timeout: Duration,

    /// Interval of the relay maintenance loop
    pub reconnect_interval: Duration,

    /// Routes idle for longer than this are closed
    pub route_timeout: Duration,

    /// Connect to relays as soon as they are added
    pub enable_auto_relay: bool,

    /// Relay selection policy
    pub selection: RelaySelection,

    /// Route establishment policy
    pub establishment: RouteEstablishment,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            bootstrap_relays: DEFAULT_BOOTSTRAP_RELAYS.iter().map(|s| s.to_string()).collect(),
            max_relays: 3,
            connection_timeout: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(60),
            route_timeout: Duration::from_secs(300),
            enable_auto_relay: true,
            selection: RelaySelection::FirstAvailable,
            establishment: RouteEstablishment::Optimistic,
        }
    }
}

impl RelayConfig {
    /// Only the given relays, none of the built-in ones
    pub fn with_relays(relays: Vec<String>) -> Self {
        Self {
            relays,
            bootstrap_relays: Vec::new(),
            ..Default::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> CoreResult<()> {
        if self.max_relays == 0 {
            return Err(CoreError::Config("max_relays must be at least 1".into()));
        }
        if self.connection_timeout.is_zero() || self.reconnect_interval.is_zero() {
            return Err(CoreError::Config("relay timeouts must be non-zero".into()));
        }
        if self.route_timeout.is_zero() {
            return Err(CoreError::Config("route_timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Configuration for a whole node
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub discovery: DiscoveryConfig,
    pub relay: RelayConfig,
}

impl NetworkConfig {
    pub fn validate(&self) -> CoreResult<()> {
        self.discovery.validate()?;
        self.relay.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let discovery = DiscoveryConfig::default();
        assert_eq!(discovery.max_peers, 10);
        assert_eq!(discovery.connection_timeout, Duration::from_secs(30));
        assert_eq!(discovery.reconnect_interval, Duration::from_secs(60));
        assert_eq!(discovery.discovery_interval, Duration::from_secs(30));

        let relay = RelayConfig::default();
        assert_eq!(relay.max_relays, 3);
        assert!(relay.enable_auto_relay);
        assert_eq!(relay.selection, RelaySelection::FirstAvailable);
        assert_eq!(relay.establishment, RouteEstablishment::Optimistic);
        assert_eq!(relay.bootstrap_relays.len(), DEFAULT_BOOTSTRAP_RELAYS.len());

        assert!(NetworkConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_caps() {
        let discovery = DiscoveryConfig {
            max_peers: 0,
            ..Default::default()
        };
        assert!(discovery.validate().is_err());

        let relay = RelayConfig {
            max_relays: 0,
            ..Default::default()
        };
        assert!(relay.validate().is_err());
    }

    #[test]
    fn test_with_relays_skips_builtin() {
        let relay = RelayConfig::with_relays(vec!["relay-a".into()]);
        assert!(relay.bootstrap_relays.is_empty());
        assert_eq!(relay.relays, vec!["relay-a".to_string()]);
    }
}
