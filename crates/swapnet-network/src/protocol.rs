//! Peer identity and JSON framing
//!
//! Everything that crosses a data channel or a signaling server is a JSON
//! document. This module owns the peer identifier and the helpers that turn
//! typed messages into frames and back.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::NetworkResult;

/// Opaque peer identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for log lines
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(12) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Serialize a message into a frame
pub fn encode_frame<T: Serialize + ?Sized>(msg: &T) -> NetworkResult<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(msg)?))
}

/// Deserialize a frame into a message
pub fn decode_frame<T: DeserializeOwned>(data: &[u8]) -> NetworkResult<T> {
    Ok(serde_json::from_slice(data)?)
}
