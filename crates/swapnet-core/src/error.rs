//! Core errors

use thiserror::Error;

use crate::relay::RouteId;

/// Core errors
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration rejected
    #[error("Configuration error: {0}")]
    Config(String),

    /// No connected relay to build a route through
    #[error("No relays available")]
    NoRelaysAvailable,

    /// Route not known
    #[error("Route not found: {0}")]
    RouteNotFound(RouteId),

    /// Relay or target refused a route
    #[error("Route {route_id} rejected: {reason}")]
    RouteRejected { route_id: RouteId, reason: String },

    /// Could not hand a routed payload to the relay
    #[error("Route send failure: {0}")]
    RouteSendFailure(String),

    /// A discovery source could not start
    #[error("Discovery source {source_name} failed: {message}")]
    DiscoverySource { source_name: String, message: String },

    /// Timeout
    #[error("Operation timed out")]
    Timeout,

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Network error
    #[error("Network error: {0}")]
    Network(#[from] swapnet_network::NetworkError),
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
