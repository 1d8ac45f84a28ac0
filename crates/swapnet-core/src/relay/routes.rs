//! Route table
//!
//! Routes are indexed both by ID and by the relay that carries them, so a
//! relay going away closes exactly its own routes without a full scan.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use swapnet_network::PeerId;

use super::{RelayId, RouteId};

/// Who asked for the route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteDirection {
    /// Requested by this node
    Outbound,
    /// Requested by a remote peer through a relay
    Inbound,
}

/// A path to a peer through a relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub route_id: RouteId,
    pub source_peer_id: PeerId,
    pub target_peer_id: PeerId,
    pub relay_id: RelayId,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub active: bool,
    pub direction: RouteDirection,
}

impl Route {
    pub fn new(
        route_id: RouteId,
        source_peer_id: PeerId,
        target_peer_id: PeerId,
        relay_id: RelayId,
        direction: RouteDirection,
    ) -> Self {
        let now = Utc::now();
        Self {
            route_id,
            source_peer_id,
            target_peer_id,
            relay_id,
            created_at: now,
            last_activity: now,
            active: false,
            direction,
        }
    }

    /// The peer at the far end of the route
    pub fn remote_peer(&self) -> &PeerId {
        match self.direction {
            RouteDirection::Outbound => &self.target_peer_id,
            RouteDirection::Inbound => &self.source_peer_id,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Whether the route saw no traffic for longer than `timeout`
    pub fn is_idle(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        (now - self.last_activity)
            .to_std()
            .map(|elapsed| elapsed > timeout)
            .unwrap_or(false)
    }
}

#[derive(Debug, Default)]
pub struct RouteTable {
    routes: HashMap<RouteId, Route>,
    by_relay: HashMap<RelayId, HashSet<RouteId>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a route, replacing any route with the same ID
    pub fn insert(&mut self, route: Route) -> Option<Route> {
        let previous = self.remove(&route.route_id);
        self.by_relay
            .entry(route.relay_id.clone())
            .or_default()
            .insert(route.route_id.clone());
        self.routes.insert(route.route_id.clone(), route);
        previous
    }

    pub fn remove(&mut self, route_id: &RouteId) -> Option<Route> {
        let route = self.routes.remove(route_id)?;
        if let Some(ids) = self.by_relay.get_mut(&route.relay_id) {
            ids.remove(route_id);
            if ids.is_empty() {
                self.by_relay.remove(&route.relay_id);
            }
        }
        Some(route)
    }

    pub fn get(&self, route_id: &RouteId) -> Option<&Route> {
        self.routes.get(route_id)
    }

    pub fn get_mut(&mut self, route_id: &RouteId) -> Option<&mut Route> {
        self.routes.get_mut(route_id)
    }

    /// Remove and return every route carried by `relay_id`
    pub fn remove_by_relay(&mut self, relay_id: &RelayId) -> Vec<Route> {
        let ids = self.by_relay.remove(relay_id).unwrap_or_default();
        ids.iter().filter_map(|id| self.routes.remove(id)).collect()
    }

    /// IDs of the routes carried by `relay_id`
    pub fn routes_via(&self, relay_id: &RelayId) -> Vec<RouteId> {
        self.by_relay
            .get(relay_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn active(&self) -> Vec<Route> {
        self.routes.values().filter(|r| r.active).cloned().collect()
    }

    /// Routes idle for longer than `timeout`
    pub fn idle(&self, timeout: Duration) -> Vec<RouteId> {
        let now = Utc::now();
        self.routes
            .values()
            .filter(|r| r.is_idle(now, timeout))
            .map(|r| r.route_id.clone())
            .collect()
    }

    pub fn all(&self) -> Vec<Route> {
        self.routes.values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<RouteId> {
        self.routes.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
