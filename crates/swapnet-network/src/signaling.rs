//! Rendezvous Signaling
//!
//! Envelope types exchanged with rendezvous servers before a direct session
//! exists. On the wire every message is `{"type": ..., "payload": {...}}`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::NetworkResult;
use crate::protocol::PeerId;

/// Registration with a rendezvous server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub from: PeerId,
}

/// SDP offer or answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub from: PeerId,
    pub to: PeerId,
    pub sdp: String,
}

/// Trickled ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidatePayload {
    pub from: PeerId,
    pub to: PeerId,
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

/// Error reported by the server or a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingErrorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerId>,
    pub message: String,
}

/// Signaling envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SignalingMessage {
    Register(RegisterPayload),
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidatePayload),
    Error(SignalingErrorPayload),
}

impl SignalingMessage {
    pub fn register(from: PeerId) -> Self {
        SignalingMessage::Register(RegisterPayload { from })
    }

    /// Peer that originated the message, if any
    pub fn sender(&self) -> Option<&PeerId> {
        match self {
            SignalingMessage::Register(p) => Some(&p.from),
            SignalingMessage::Offer(p) | SignalingMessage::Answer(p) => Some(&p.from),
            SignalingMessage::IceCandidate(p) => Some(&p.from),
            SignalingMessage::Error(p) => p.from.as_ref(),
        }
    }

    /// Addressed recipient; `None` for server-wide messages
    pub fn recipient(&self) -> Option<&PeerId> {
        match self {
            SignalingMessage::Register(_) => None,
            SignalingMessage::Offer(p) | SignalingMessage::Answer(p) => Some(&p.to),
            SignalingMessage::IceCandidate(p) => Some(&p.to),
            SignalingMessage::Error(p) => p.to.as_ref(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            SignalingMessage::Register(_) => "register",
            SignalingMessage::Offer(_) => "offer",
            SignalingMessage::Answer(_) => "answer",
            SignalingMessage::IceCandidate(_) => "ice_candidate",
            SignalingMessage::Error(_) => "error",
        }
    }

    pub fn to_json(&self) -> NetworkResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> NetworkResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Duplex connection to one rendezvous server
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send(&self, msg: SignalingMessage) -> NetworkResult<()>;

    /// Next message from the server, `None` once the connection is gone
    async fn recv(&self) -> Option<SignalingMessage>;

    async fn close(&self);
}

/// Opens signaling channels by server address
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(&self, server: &str) -> NetworkResult<Box<dyn SignalingChannel>>;
}
