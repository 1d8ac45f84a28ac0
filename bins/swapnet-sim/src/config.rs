//! Simulation configuration

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use swapnet_core::{
    DiscoveryConfig, NetworkConfig, RelayConfig, RelaySelection, RouteEstablishment,
};

/// Address of the in-process rendezvous server
pub const RENDEZVOUS_URL: &str = "memory://rendezvous";

/// Main simulation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    /// Mesh layout
    pub simulation: SimulationSection,
    /// Per-node discovery settings
    pub discovery: DiscoverySection,
    /// Per-node relay settings
    pub relay: RelaySection,
}

/// Mesh layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSection {
    /// Number of exchange nodes
    pub nodes: usize,
    /// Number of relay servers
    pub relays: usize,
    /// Nodes that accept no direct sessions, as if behind a NAT
    pub nat_nodes: usize,
    /// How long the mesh runs (seconds)
    pub duration_secs: u64,
    /// Bandwidth relays advertise (bytes/sec)
    pub relay_bandwidth: Option<u64>,
}

/// Discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySection {
    pub max_peers: usize,
    pub enable_dht: bool,
    pub connection_timeout_ms: u64,
    pub reconnect_interval_ms: u64,
    pub discovery_interval_ms: u64,
}

/// Relay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySection {
    pub max_relays: usize,
    pub connection_timeout_ms: u64,
    pub reconnect_interval_ms: u64,
    pub route_timeout_ms: u64,
    pub selection: RelaySelection,
    pub establishment: RouteEstablishment,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            simulation: SimulationSection {
                nodes: 4,
                relays: 1,
                nat_nodes: 1,
                duration_secs: 5,
                relay_bandwidth: Some(10 * 1024 * 1024),
            },
            discovery: DiscoverySection {
                max_peers: 10,
                enable_dht: true,
                connection_timeout_ms: 1_000,
                reconnect_interval_ms: 2_000,
                discovery_interval_ms: 1_000,
            },
            relay: RelaySection {
                max_relays: 3,
                connection_timeout_ms: 1_000,
                reconnect_interval_ms: 2_000,
                route_timeout_ms: 30_000,
                selection: RelaySelection::FirstAvailable,
                establishment: RouteEstablishment::Optimistic,
            },
        }
    }
}

impl SimConfig {
    /// Load configuration from file
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        toml::from_str(&contents).context("Failed to parse config file")
    }

    /// Load or create default configuration
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path).await
        } else {
            let config = Self::default();
            config.save(path).await?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let contents = toml::to_string_pretty(self)?;
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.simulation.nodes < 2 {
            anyhow::bail!("a simulation needs at least 2 nodes");
        }
        if self.simulation.nat_nodes >= self.simulation.nodes {
            anyhow::bail!("at least one node must accept direct sessions");
        }
        if self.simulation.nat_nodes > 0 && self.simulation.relays == 0 {
            anyhow::bail!("nodes behind NAT need at least one relay");
        }
        if self.simulation.duration_secs == 0 {
            anyhow::bail!("duration_secs must be at least 1");
        }

        // Same checks the nodes themselves run
        self.network_config(Vec::new())
            .validate()
            .context("Invalid node configuration")?;
        Ok(())
    }

    /// Node configuration for a mesh whose relays live at `relays`
    pub fn network_config(&self, relays: Vec<String>) -> NetworkConfig {
        let discovery = DiscoveryConfig {
            signaling_servers: vec![RENDEZVOUS_URL.to_string()],
            enable_dht: self.discovery.enable_dht,
            max_peers: self.discovery.max_peers,
            connection_timeout: Duration::from_millis(self.discovery.connection_timeout_ms),
            reconnect_interval: Duration::from_millis(self.discovery.reconnect_interval_ms),
            discovery_interval: Duration::from_millis(self.discovery.discovery_interval_ms),
            ..Default::default()
        };
        let relay = RelayConfig {
            max_relays: self.relay.max_relays,
            connection_timeout: Duration::from_millis(self.relay.connection_timeout_ms),
            reconnect_interval: Duration::from_millis(self.relay.reconnect_interval_ms),
            route_timeout: Duration::from_millis(self.relay.route_timeout_ms),
            selection: self.relay.selection,
            establishment: self.relay.establishment,
            ..RelayConfig::with_relays(relays)
        };
        NetworkConfig { discovery, relay }
    }
}
