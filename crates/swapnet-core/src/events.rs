//! Event Bus
//!
//! Observer registry shared by the discovery engine and the relay router.
//! Listeners are called synchronously in registration order; a panicking
//! listener is logged and skipped. Async consumers can take a broadcast
//! receiver instead.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::error;

const BROADCAST_CAPACITY: usize = 256;

/// Closed set of event variants
pub trait EventKind: Clone + Send + Sync + 'static {
    /// Wire name of the variant, e.g. `peer_found`
    fn name(&self) -> &'static str;
}

/// An emitted event
#[derive(Debug, Clone, Serialize)]
pub struct Event<K> {
    #[serde(flatten)]
    pub kind: K,
    pub timestamp: DateTime<Utc>,
}

impl<K: EventKind> Event<K> {
    pub fn new(kind: K) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

/// Handle returned by [`EventBus::on`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<K> = Arc<dyn Fn(&Event<K>) + Send + Sync>;

pub struct EventBus<K> {
    listeners: RwLock<Vec<(ListenerId, Listener<K>)>>,
    next_id: AtomicU64,
    broadcast: broadcast::Sender<Event<K>>,
}

impl<K: EventKind> EventBus<K> {
    pub fn new() -> Self {
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            broadcast,
        }
    }

    /// Register a listener
    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Event<K>) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener; returns whether it was registered
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Event<K>> {
        self.broadcast.subscribe()
    }

    pub fn emit(&self, kind: K) {
        let event = Event::new(kind);

        // Snapshot so listeners may register or remove listeners themselves
        let listeners: Vec<Listener<K>> = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(_, l)| l.clone())
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                error!(event = event.name(), "Event listener panicked");
            }
        }

        let _ = self.broadcast.send(event);
    }
}

impl<K: EventKind> Default for EventBus<K> {
    fn default() -> Self {
        Self::new()
    }
}
