//! Event Bridge
//!
//! Decides which local events cross the network and keeps locally
//! originated events from coming back as new information.
//!
//! ## Flow
//!
//! ```text
//! emit_local(name, data)
//!   ├─ record id in echo window
//!   ├─ EventBus::emit (origin = Local)           always, same call
//!   └─ policy syncable && filter accepts?
//!        └─ ConnectionManager::send("event", {name, data, id, timestamp})
//!
//! receive_network(payload)
//!   ├─ id in echo window? -> drop, count
//!   └─ EventBus::emit (origin = Network)
//! ```
//!
//! Policy resolution: an exact-name registration wins, then wildcard
//! patterns in registration order. Names with no policy stay local.

use std::collections::HashMap;
use std::sync::Arc;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Serialize, Deserialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::clock::{Millis, SharedClock};
use crate::core::listeners::Subscription;
use crate::core::ttl::TtlSet;
use crate::network::connection::{ConnectionManager, MessagePriority};
use crate::network::protocol::{message_types, Envelope, EventPayload};
use super::bus::{EventBus, EventOrigin, EventRecord};
use super::pattern::EventPattern;

/// Payload predicate deciding whether a syncable event is sent.
pub type EventFilter = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// How long a locally emitted id is remembered for echo suppression.
    pub echo_window_ms: Millis,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self { echo_window_ms: 5_000 }
    }
}

/// Per-event network policy.
#[derive(Clone)]
pub struct EventPolicy {
    /// Send over the network.
    pub syncable: bool,
    /// Outbound queue priority.
    pub priority: MessagePriority,
    /// Optional payload gate.
    pub filter: Option<EventFilter>,
}

impl Default for EventPolicy {
    fn default() -> Self {
        Self::syncable()
    }
}

impl EventPolicy {
    /// Send with normal priority.
    pub fn syncable() -> Self {
        Self {
            syncable: true,
            priority: MessagePriority::Normal,
            filter: None,
        }
    }

    /// Never send.
    pub fn local_only() -> Self {
        Self {
            syncable: false,
            priority: MessagePriority::Normal,
            filter: None,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Only send payloads `filter` accepts.
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    fn accepts(&self, payload: &Value) -> bool {
        self.filter.as_ref().map(|f| f(payload)).unwrap_or(true)
    }
}

impl std::fmt::Debug for EventPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPolicy")
            .field("syncable", &self.syncable)
            .field("priority", &self.priority)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

/// Bridge counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    /// `emit_local` calls.
    pub emitted_local: u64,
    /// Events handed to the connection.
    pub sent: u64,
    /// Network events received (including echoes).
    pub received: u64,
    /// Network events dropped as echoes.
    pub echoes_suppressed: u64,
    /// Syncable events a filter rejected.
    pub filtered: u64,
    /// Events with no syncable policy.
    pub not_syncable: u64,
    /// Inbound event envelopes that failed to parse.
    pub malformed: u64,
}

struct BridgeInner {
    exact: HashMap<String, EventPolicy>,
    patterns: Vec<(EventPattern, EventPolicy)>,
    local_ids: TtlSet<String>,
    stats: BridgeStats,
}

impl BridgeInner {
    fn resolve(&self, name: &str) -> Option<EventPolicy> {
        if let Some(policy) = self.exact.get(name) {
            return Some(policy.clone());
        }
        self.patterns
            .iter()
            .find(|(pattern, _)| pattern.matches(name))
            .map(|(_, policy)| policy.clone())
    }
}

/// Handle to the event bridge. Clones share state.
#[derive(Clone)]
pub struct EventBridge {
    inner: Arc<Mutex<BridgeInner>>,
    bus: EventBus,
    connection: ConnectionManager,
    clock: SharedClock,
}

impl EventBridge {
    /// Create a bridge between `bus` and `connection`.
    pub fn new(config: BridgeConfig, bus: EventBus, connection: ConnectionManager, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BridgeInner {
                exact: HashMap::new(),
                patterns: Vec::new(),
                local_ids: TtlSet::new(config.echo_window_ms),
                stats: BridgeStats::default(),
            })),
            bus,
            connection,
            clock,
        }
    }

    /// Declare the policy for an event name or wildcard pattern.
    /// Re-registering the same pattern replaces its policy.
    pub fn register_event(&self, pattern: impl Into<EventPattern>, policy: EventPolicy) {
        let pattern = pattern.into();
        let mut inner = self.inner.lock();
        if pattern.is_exact() {
            inner.exact.insert(pattern.as_str().to_string(), policy);
        } else if let Some(slot) = inner.patterns.iter_mut().find(|(p, _)| *p == pattern) {
            slot.1 = policy;
        } else {
            inner.patterns.push((pattern, policy));
        }
    }

    /// Policy that applies to `name`, if any.
    pub fn policy_for(&self, name: &str) -> Option<EventPolicy> {
        self.inner.lock().resolve(name)
    }

    /// Emit an event locally and, if its policy allows, to the network.
    /// Returns the event id (generated when `event_id` is `None`).
    pub fn emit_local(&self, name: &str, payload: Value, event_id: Option<String>) -> String {
        let now = self.clock.now_ms();
        let id = event_id.unwrap_or_else(|| generate_event_id(name, now));

        let policy = {
            let mut inner = self.inner.lock();
            inner.stats.emitted_local += 1;
            inner.local_ids.insert(id.clone(), now);
            inner.resolve(name)
        };

        let record = EventRecord {
            name: name.to_string(),
            payload,
            event_id: id.clone(),
            origin: EventOrigin::Local,
        };
        self.bus.emit(&record);

        let policy = match policy {
            Some(policy) if policy.syncable => policy,
            _ => {
                self.inner.lock().stats.not_syncable += 1;
                return id;
            }
        };

        if !policy.accepts(&record.payload) {
            self.inner.lock().stats.filtered += 1;
            debug!("event '{}' rejected by filter", name);
            return id;
        }

        let wire = EventPayload::new(name, &record.payload, id.clone(), now);
        match serde_json::to_value(&wire) {
            Ok(data) => {
                self.connection.send_with_priority(message_types::EVENT, data, policy.priority);
                self.inner.lock().stats.sent += 1;
                debug!("event '{}' forwarded ({})", name, id);
            }
            Err(e) => warn!("Failed to encode event '{}': {}", name, e),
        }
        id
    }

    /// Handle an event from the network. Returns true if it was re-emitted
    /// locally, false if it was an echo of a local emission.
    pub fn receive_network(&self, payload: EventPayload) -> bool {
        let now = self.clock.now_ms();
        {
            let mut inner = self.inner.lock();
            inner.stats.received += 1;
            if inner.local_ids.contains(&payload.id, now) {
                inner.stats.echoes_suppressed += 1;
                debug!("echo suppressed: {} ({})", payload.name, payload.id);
                return false;
            }
        }

        self.bus.emit(&EventRecord {
            name: payload.name,
            payload: payload.data,
            event_id: payload.id,
            origin: EventOrigin::Network,
        });
        true
    }

    /// Route an inbound envelope. Non-event envelopes are ignored and
    /// malformed event payloads are skipped. Returns true if an event was
    /// re-emitted.
    pub fn handle_envelope(&self, envelope: &Envelope) -> bool {
        if envelope.msg_type != message_types::EVENT {
            return false;
        }
        match EventPayload::from_envelope(envelope) {
            Ok(payload) => self.receive_network(payload),
            Err(e) => {
                self.inner.lock().stats.malformed += 1;
                warn!("Skipping malformed event payload: {}", e);
                false
            }
        }
    }

    /// Subscribe to local and network events matching `pattern`.
    pub fn on<F>(&self, pattern: impl Into<EventPattern>, handler: F) -> Subscription
    where
        F: Fn(&EventRecord) + Send + Sync + 'static,
    {
        self.bus.on(pattern, handler)
    }

    /// True while `event_id` is inside the echo window.
    pub fn is_local_origin(&self, event_id: &str) -> bool {
        let now = self.clock.now_ms();
        self.inner.lock().local_ids.contains(&event_id.to_string(), now)
    }

    /// Ids currently remembered for echo suppression.
    pub fn tracked_ids(&self) -> usize {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        inner.local_ids.purge_expired(now);
        inner.local_ids.len()
    }

    /// Counters.
    pub fn stats(&self) -> BridgeStats {
        self.inner.lock().stats
    }

    /// Local event bus.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Underlying connection.
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }
}

impl std::fmt::Debug for EventBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("EventBridge")
            .field("exact", &inner.exact.len())
            .field("patterns", &inner.patterns.len())
            .field("stats", &inner.stats)
            .finish()
    }
}

/// `"{name}-{timestamp}-{8 hex chars}"`.
pub fn generate_event_id(name: &str, now: Millis) -> String {
    let salt: [u8; 4] = rand::thread_rng().gen();
    format!("{}-{}-{}", name, now, hex::encode(salt))
}
