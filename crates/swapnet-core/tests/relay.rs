#[macro_use]
mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use swapnet_core::{
    CoreError, RelayConfig, RelayEvent, RelayId, RelayRouter, RelaySelection, RelayServer,
    RouteDirection, RouteEstablishment,
};
use swapnet_network::{DataChannel, MemoryNetwork, PeerId, Transport};

const RELAY: &str = "relay-1";

fn config(establishment: RouteEstablishment) -> RelayConfig {
    RelayConfig {
        connection_timeout: Duration::from_millis(300),
        establishment,
        ..RelayConfig::with_relays(vec![RELAY.into()])
    }
}

fn relay_server(network: &MemoryNetwork, address: &str, bandwidth: Option<u64>) -> Arc<RelayServer> {
    let server = RelayServer::with_bandwidth(address, bandwidth);
    server.serve(network.listen(&PeerId::new(address)));
    server
}

async fn router(network: &MemoryNetwork, id: &str, config: RelayConfig) -> Arc<RelayRouter> {
    let router = RelayRouter::new(id, config, Arc::new(network.transport(id)));
    router.start().await;
    router
}

/// Attach `id` to the relay with a bare channel that never answers
async fn silent_client(network: &MemoryNetwork, id: &str) -> Box<dyn DataChannel> {
    let channel = network.transport(id).dial(&PeerId::new(RELAY)).await.unwrap();
    channel.opened().await.unwrap();
    channel
}

fn record(router: &RelayRouter) -> Arc<Mutex<Vec<RelayEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    router.events().on(move |event| sink.lock().unwrap().push(event.kind.clone()));
    seen
}

fn names(seen: &Mutex<Vec<RelayEvent>>) -> Vec<&'static str> {
    use swapnet_core::EventKind;
    seen.lock().unwrap().iter().map(|e| e.name()).collect()
}

#[tokio::test]
async fn test_relayed_messaging_end_to_end() {
    let network = MemoryNetwork::new();
    let server = relay_server(&network, RELAY, Some(1_000_000));
    let a = router(&network, "a", config(RouteEstablishment::Optimistic)).await;
    let b = router(&network, "b", config(RouteEstablishment::Optimistic)).await;
    let b_seen = record(&b);
    let a_seen = record(&a);
    eventually!("both clients attached", server.client_count().await == 2);

    let route_id = a.create_route("b").await.unwrap();
    let route = a.get_route(&route_id).await.unwrap();
    assert!(route.active);
    assert_eq!(route.direction, RouteDirection::Outbound);
    assert_eq!(route.relay_id, RelayId::from_address(RELAY));

    eventually!("inbound route at b", b.get_route(&route_id).await.is_some());
    let inbound = b.get_route(&route_id).await.unwrap();
    assert_eq!(inbound.direction, RouteDirection::Inbound);
    assert_eq!(inbound.source_peer_id, PeerId::new("a"));

    assert!(a.send_message_through_route(&route_id, &serde_json::json!({"order": 7})).await);
    eventually!("message at b", names(&b_seen).contains(&"message_received"));
    let delivered = b_seen.lock().unwrap().iter().find_map(|e| match e {
        RelayEvent::MessageReceived { route_id, from, data } => {
            Some((route_id.clone(), from.clone(), data.clone()))
        }
        _ => None,
    });
    assert_eq!(
        delivered,
        Some((route_id.clone(), PeerId::new("a"), serde_json::json!({"order": 7})))
    );

    // Reply on the inbound side of the same route
    assert!(b.send_message_through_route(&route_id, &serde_json::json!({"fill": 7})).await);
    eventually!("reply at a", names(&a_seen).contains(&"message_received"));

    // The acknowledgment carried the relay's advertised bandwidth
    let relay = a.get_relay(&RelayId::from_address(RELAY)).await.unwrap();
    assert_eq!(relay.bandwidth, Some(1_000_000));
    assert_eq!(server.route_count().await, 1);
}

#[tokio::test]
async fn test_acknowledged_routes() {
    let network = MemoryNetwork::new();
    let server = relay_server(&network, RELAY, None);
    let a = router(&network, "a", config(RouteEstablishment::AwaitAcknowledgment)).await;
    let _b = router(&network, "b", config(RouteEstablishment::Optimistic)).await;
    let seen = record(&a);
    eventually!("both clients attached", server.client_count().await == 2);

    let route_id = a.create_route("b").await.unwrap();
    assert!(a.get_route(&route_id).await.unwrap().active);

    match a.create_route("nobody").await {
        Err(CoreError::RouteRejected { reason, .. }) => assert!(reason.contains("nobody")),
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(a.list_routes().await.len(), 1);
    assert_eq!(names(&seen), vec!["route_established"]);
}

#[tokio::test]
async fn test_no_relays_available() {
    let network = MemoryNetwork::new();
    let a = router(&network, "a", RelayConfig::with_relays(Vec::new())).await;
    let seen = record(&a);

    assert!(matches!(a.create_route("b").await, Err(CoreError::NoRelaysAvailable)));
    assert!(a.list_routes().await.is_empty());
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_disconnect_relay_closes_its_routes() {
    let network = MemoryNetwork::new();
    let server = relay_server(&network, RELAY, None);
    let a = router(&network, "a", config(RouteEstablishment::Optimistic)).await;
    let mut peers = Vec::new();
    for peer in ["p1", "p2", "p3", "p4"] {
        peers.push(router(&network, peer, config(RouteEstablishment::Optimistic)).await);
    }
    eventually!("all clients attached", server.client_count().await == 5);
    let relay_id = RelayId::from_address(RELAY);
    assert!(a.get_relay(&relay_id).await.unwrap().is_connected);

    let routes: Vec<_> = {
        let mut routes = Vec::new();
        for peer in ["p1", "p2", "p3", "p4"] {
            routes.push(a.create_route(peer).await.unwrap());
        }
        routes
    };
    assert_eq!(a.routes_via(&relay_id).await.len(), 4);
    let seen = record(&a);

    a.disconnect_from_relay(&relay_id).await;

    let events = seen.lock().unwrap().clone();
    let closed: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            RelayEvent::RouteClosed { route_id, relay_id: via } => {
                assert_eq!(via, &relay_id);
                Some(route_id.clone())
            }
            _ => None,
        })
        .collect();
    assert_eq!(closed.len(), routes.len());
    for route_id in &routes {
        assert!(closed.contains(route_id));
        assert!(!a.send_message_through_route(route_id, &serde_json::json!({})).await);
    }
    assert!(matches!(events.last(), Some(RelayEvent::RelayDisconnected { .. })));

    assert!(a.routes_via(&relay_id).await.is_empty());
    assert!(!a.get_relay(&relay_id).await.unwrap().is_connected);
    assert_eq!(a.connected_count().await, 0);
    for peer in &peers {
        eventually!("far end closed", peer.list_routes().await.is_empty());
    }
}

#[tokio::test]
async fn test_relay_shutdown_seen_by_nodes() {
    let network = MemoryNetwork::new();
    let server = relay_server(&network, RELAY, None);
    let a = router(&network, "a", config(RouteEstablishment::Optimistic)).await;
    let _b = router(&network, "b", config(RouteEstablishment::Optimistic)).await;
    eventually!("both clients attached", server.client_count().await == 2);
    let route_id = a.create_route("b").await.unwrap();
    let seen = record(&a);

    server.shutdown().await;

    eventually!(
        "relay disconnected",
        names(&seen).contains(&"relay_disconnected")
    );
    assert_eq!(names(&seen), vec!["route_closed", "relay_disconnected"]);
    assert!(a.get_route(&route_id).await.is_none());
    assert!(!a.get_relay(&RelayId::from_address(RELAY)).await.unwrap().is_connected);
}

#[tokio::test]
async fn test_maintenance_reconnects_and_expires_routes() {
    let network = MemoryNetwork::new();
    let server = relay_server(&network, RELAY, None);
    let a = router(
        &network,
        "a",
        RelayConfig {
            reconnect_interval: Duration::from_millis(30),
            route_timeout: Duration::from_millis(60),
            ..config(RouteEstablishment::Optimistic)
        },
    )
    .await;
    let _b = router(&network, "b", config(RouteEstablishment::Optimistic)).await;
    eventually!("both clients attached", server.client_count().await == 2);
    let relay_id = RelayId::from_address(RELAY);

    let route_id = a.create_route("b").await.unwrap();
    eventually!("idle route closed", a.get_route(&route_id).await.is_none());

    server.shutdown().await;
    eventually!(
        "relay lost",
        !a.get_relay(&relay_id).await.unwrap().is_connected
    );

    let _replacement = relay_server(&network, RELAY, None);
    eventually!(
        "relay back",
        a.get_relay(&relay_id).await.unwrap().is_connected
    );
    a.stop().await;
}

#[tokio::test]
async fn test_peer_closing_route_reaches_initiator() {
    let network = MemoryNetwork::new();
    let server = relay_server(&network, RELAY, None);
    let a = router(&network, "a", config(RouteEstablishment::Optimistic)).await;
    let b = router(&network, "b", config(RouteEstablishment::Optimistic)).await;
    eventually!("both clients attached", server.client_count().await == 2);

    let route_id = a.create_route("b").await.unwrap();
    eventually!("inbound route at b", b.get_route(&route_id).await.is_some());

    assert!(b.close_route(&route_id).await);
    eventually!("route closed at a", a.get_route(&route_id).await.is_none());
    eventually!("relay forgot route", server.route_count().await == 0);
}

#[tokio::test]
async fn test_first_available_relay_wins() {
    let network = MemoryNetwork::new();
    let first = relay_server(&network, "relay-1", None);
    let _second = relay_server(&network, "relay-2", None);
    let a = router(
        &network,
        "a",
        RelayConfig {
            connection_timeout: Duration::from_millis(300),
            ..RelayConfig::with_relays(vec!["relay-1".into(), "relay-2".into()])
        },
    )
    .await;
    assert_eq!(a.connected_count().await, 2);
    let _b = router(&network, "b", config(RouteEstablishment::Optimistic)).await;
    eventually!("both clients attached", first.client_count().await == 2);

    let route_id = a.create_route("b").await.unwrap();
    assert_eq!(
        a.get_route(&route_id).await.unwrap().relay_id,
        RelayId::from_address("relay-1")
    );

    a.stop().await;
    assert_eq!(a.connected_count().await, 0);
    assert!(a.list_routes().await.is_empty());
}

#[tokio::test]
async fn test_unacknowledged_route_closes_quietly() {
    let network = MemoryNetwork::new();
    let server = relay_server(&network, RELAY, None);
    let a = router(
        &network,
        "a",
        RelayConfig {
            connection_timeout: Duration::from_secs(1),
            ..config(RouteEstablishment::AwaitAcknowledgment)
        },
    )
    .await;
    let _silent = silent_client(&network, "b").await;
    eventually!("both clients attached", server.client_count().await == 2);
    let seen = record(&a);

    let creating = tokio::spawn({
        let a = a.clone();
        async move { a.create_route("b").await }
    });
    eventually!("pending route", a.list_routes().await.len() == 1);
    assert!(a.active_routes().await.is_empty());

    a.disconnect_from_relay(&RelayId::from_address(RELAY)).await;

    assert!(matches!(
        creating.await.unwrap(),
        Err(CoreError::RouteRejected { .. })
    ));
    assert!(a.list_routes().await.is_empty());
    assert_eq!(names(&seen), vec!["relay_disconnected"]);
}

#[tokio::test]
async fn test_idle_pending_route_expires_quietly() {
    let network = MemoryNetwork::new();
    let server = relay_server(&network, RELAY, None);
    let a = router(
        &network,
        "a",
        RelayConfig {
            connection_timeout: Duration::from_secs(1),
            reconnect_interval: Duration::from_millis(20),
            route_timeout: Duration::from_millis(40),
            ..config(RouteEstablishment::AwaitAcknowledgment)
        },
    )
    .await;
    let _silent = silent_client(&network, "b").await;
    eventually!("both clients attached", server.client_count().await == 2);
    let seen = record(&a);

    // The maintenance loop drops the route long before the acknowledgment timeout
    assert!(matches!(
        a.create_route("b").await,
        Err(CoreError::RouteRejected { .. })
    ));
    assert!(a.list_routes().await.is_empty());
    assert!(names(&seen).is_empty());
    a.stop().await;
}

#[tokio::test]
async fn test_stop_while_connecting_relays() {
    let network = MemoryNetwork::new();
    let _first = relay_server(&network, "relay-1", None);
    let _second = relay_server(&network, "relay-2", None);
    let relay_1 = PeerId::new("relay-1");
    network.hold(&relay_1);

    let a = RelayRouter::new(
        "a",
        RelayConfig {
            connection_timeout: Duration::from_millis(300),
            reconnect_interval: Duration::from_millis(20),
            ..RelayConfig::with_relays(vec!["relay-1".into(), "relay-2".into()])
        },
        Arc::new(network.transport("a")),
    );
    let starting = tokio::spawn({
        let a = a.clone();
        async move { a.start().await }
    });
    eventually!("dialing first relay", network.dial_count(&relay_1) == 1);

    a.stop().await;
    network.release(&relay_1);
    starting.await.unwrap();

    // Several maintenance periods
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!a.is_running());
    assert_eq!(a.connected_count().await, 0);
    assert_eq!(network.dial_count(&relay_1), 1);
    assert_eq!(network.dial_count(&PeerId::new("relay-2")), 0);
}

#[tokio::test]
async fn test_lowest_latency_relay_preferred() {
    let network = MemoryNetwork::new();
    let _slow = relay_server(&network, "relay-1", None);
    let fast = relay_server(&network, "relay-2", None);
    let relay_1 = PeerId::new("relay-1");
    network.hold(&relay_1);

    let a = RelayRouter::new(
        "a",
        RelayConfig {
            connection_timeout: Duration::from_secs(1),
            selection: RelaySelection::LowestLatency,
            ..RelayConfig::with_relays(vec!["relay-1".into(), "relay-2".into()])
        },
        Arc::new(network.transport("a")),
    );
    let starting = tokio::spawn({
        let a = a.clone();
        async move { a.start().await }
    });
    eventually!("dialing first relay", network.dial_count(&relay_1) == 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    network.release(&relay_1);
    starting.await.unwrap();
    assert_eq!(a.connected_count().await, 2);

    let slow_latency = a.get_relay(&RelayId::from_address("relay-1")).await.unwrap().latency.unwrap();
    let fast_latency = a.get_relay(&RelayId::from_address("relay-2")).await.unwrap().latency.unwrap();
    assert!(fast_latency < slow_latency);

    let _b = router(
        &network,
        "b",
        RelayConfig::with_relays(vec!["relay-2".into()]),
    )
    .await;
    eventually!("both clients on fast relay", fast.client_count().await == 2);

    // First in order is relay-1, latency picks relay-2
    let route_id = a.create_route("b").await.unwrap();
    assert_eq!(
        a.get_route(&route_id).await.unwrap().relay_id,
        RelayId::from_address("relay-2")
    );
    a.stop().await;
}
