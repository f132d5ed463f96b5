//! In-process event bus.
//!
//! Handlers subscribe by [`EventPattern`] and receive every [`EventRecord`]
//! whose name matches, whether it was emitted locally or arrived from the
//! network. Handlers run synchronously inside `emit`, in subscription order.

use serde::{Serialize, Deserialize};
use serde_json::Value;

use crate::core::listeners::{Listeners, Subscription};
use super::pattern::EventPattern;

/// Where an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    /// Emitted by this process.
    Local,
    /// Received from a peer.
    Network,
}

/// One event as delivered to handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Event name.
    pub name: String,
    /// Event data.
    pub payload: Value,
    /// Emission id.
    pub event_id: String,
    /// Local or network.
    pub origin: EventOrigin,
}

impl EventRecord {
    /// True for events received from a peer.
    pub fn is_remote(&self) -> bool {
        self.origin == EventOrigin::Network
    }
}

/// Pattern-matched publish/subscribe. Clones share handlers.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Listeners<EventRecord>,
}

impl EventBus {
    /// Create a bus with no handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events matching `pattern`.
    pub fn on<F>(&self, pattern: impl Into<EventPattern>, handler: F) -> Subscription
    where
        F: Fn(&EventRecord) + Send + Sync + 'static,
    {
        let pattern = pattern.into();
        self.listeners.subscribe(move |record: &EventRecord| {
            if pattern.matches(&record.name) {
                handler(record);
            }
        })
    }

    /// Deliver to matching handlers.
    pub fn emit(&self, record: &EventRecord) {
        self.listeners.notify(record);
    }

    /// Number of live handlers.
    pub fn handler_count(&self) -> usize {
        self.listeners.len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    fn record(name: &str) -> EventRecord {
        EventRecord {
            name: name.into(),
            payload: json!({}),
            event_id: format!("{}-0-00000000", name),
            origin: EventOrigin::Local,
        }
    }

    #[test]
    fn test_pattern_routing() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        let _players = bus.on("player.*", move |r| s.lock().push(format!("players:{}", r.name)));
        let s = seen.clone();
        let _chat = bus.on("chat", move |r| s.lock().push(format!("chat:{}", r.name)));

        bus.emit(&record("player.joined"));
        bus.emit(&record("chat"));
        bus.emit(&record("world.tick"));

        assert_eq!(*seen.lock(), vec!["players:player.joined", "chat:chat"]);
    }

    #[test]
    fn test_dropped_subscription_stops_delivery() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));
        let h = hits.clone();
        let sub = bus.on("*", move |_| *h.lock() += 1);

        bus.emit(&record("a"));
        drop(sub);
        bus.emit(&record("a"));
        assert_eq!(*hits.lock(), 1);
        assert_eq!(bus.handler_count(), 0);
    }
}
