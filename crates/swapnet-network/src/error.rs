//! Network error types

use thiserror::Error;

/// Network layer errors
///
/// Cloneable so that one in-flight connection attempt can hand the same
/// outcome to every caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    /// Connection did not become ready in time
    #[error("Connection timeout: {0}")]
    TimeoutWithMessage(String),

    /// Transport-level connection failure
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected
    #[error("Not connected")]
    NotConnected,

    /// Data channel closed underneath us
    #[error("Channel closed")]
    ChannelClosed,

    /// Peer not found
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Signaling server error
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// IO error (string form)
    #[error("IO error: {0}")]
    IoError(String),

    /// Bind error
    #[error("Bind error: {0}")]
    BindError(String),
}

impl From<std::io::Error> for NetworkError {
    fn from(e: std::io::Error) -> Self {
        NetworkError::IoError(e.to_string())
    }
}

impl From<serde_json::Error> for NetworkError {
    fn from(e: serde_json::Error) -> Self {
        NetworkError::SerializationError(e.to_string())
    }
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;
