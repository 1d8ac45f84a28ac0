//! Relay wire protocol
//!
//! Exchanged between a node and a relay over the relay connection. The relay
//! forwards each message to the other end of the route it names.

use serde::{Deserialize, Serialize};
use swapnet_network::PeerId;

use super::RouteId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    /// Ask the relay to open a route to `target_peer_id`
    RouteRequest {
        route_id: RouteId,
        source_peer_id: PeerId,
        target_peer_id: PeerId,
    },
    /// Answer to a route request
    RouteResponse {
        route_id: RouteId,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Bandwidth the relay advertises, bytes per second
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bandwidth: Option<u64>,
    },
    /// Application payload on a route
    RouteData {
        route_id: RouteId,
        data: serde_json::Value,
    },
    /// Route torn down by one end or by the relay
    RouteClose { route_id: RouteId },
    /// Any type this build does not know
    #[serde(other)]
    Unknown,
}

impl RelayMessage {
    pub fn accepted(route_id: RouteId) -> Self {
        RelayMessage::RouteResponse {
            route_id,
            success: true,
            error: None,
            bandwidth: None,
        }
    }

    pub fn rejected(route_id: RouteId, error: impl Into<String>) -> Self {
        RelayMessage::RouteResponse {
            route_id,
            success: false,
            error: Some(error.into()),
            bandwidth: None,
        }
    }

    pub fn route_id(&self) -> Option<&RouteId> {
        match self {
            RelayMessage::RouteRequest { route_id, .. }
            | RelayMessage::RouteResponse { route_id, .. }
            | RelayMessage::RouteData { route_id, .. }
            | RelayMessage::RouteClose { route_id } => Some(route_id),
            RelayMessage::Unknown => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            RelayMessage::RouteRequest { .. } => "route_request",
            RelayMessage::RouteResponse { .. } => "route_response",
            RelayMessage::RouteData { .. } => "route_data",
            RelayMessage::RouteClose { .. } => "route_close",
            RelayMessage::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_request_wire_format() {
        let msg = RelayMessage::RouteRequest {
            route_id: RouteId::from("route_1"),
            source_peer_id: PeerId::new("a"),
            target_peer_id: PeerId::new("b"),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "route_request");
        assert_eq!(json["route_id"], "route_1");
        assert_eq!(json["source_peer_id"], "a");
        assert_eq!(json["target_peer_id"], "b");
    }

    #[test]
    fn test_response_optional_fields() {
        let msg: RelayMessage =
            serde_json::from_str(r#"{"type":"route_response","route_id":"r","success":true}"#).unwrap();
        assert_eq!(msg, RelayMessage::accepted(RouteId::from("r")));

        let json = serde_json::to_value(RelayMessage::rejected(RouteId::from("r"), "no peer")).unwrap();
        assert_eq!(json["error"], "no peer");
        assert!(json.get("bandwidth").is_none());
    }

    #[test]
    fn test_unknown_type_tolerated() {
        let msg: RelayMessage =
            serde_json::from_str(r#"{"type":"relay_stats","load":3}"#).unwrap();
        assert_eq!(msg, RelayMessage::Unknown);
        assert!(msg.route_id().is_none());
    }
}
