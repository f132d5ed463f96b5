//! Synchronization Coordinator
//!
//! Glues connection, bridge and reconciler into one per-domain policy
//! (players by default). Owns the local identity, the join announcement and
//! the set of tracked remote entities.
//!
//! ## Domain events
//!
//! | Event            | Data                 |
//! |------------------|----------------------|
//! | `{domain}.joined`| `{ id }`             |
//! | `{domain}.state` | `{ id, state }`      |
//! | `{domain}.left`  | `{ id }`             |
//!
//! Remote entities move `unknown -> tracked -> removed`. State for an entity
//! that is not tracked is ignored.
//!
//! Everything happens inside [`SyncCoordinator::tick`]: bus and connection
//! callbacks only append to an inbox that `tick` drains.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use parking_lot::Mutex;
use serde::{Serialize, Deserialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::core::clock::{Millis, SharedClock};
use crate::core::listeners::Subscription;
use crate::events::bridge::{EventBridge, EventPolicy};
use crate::events::bus::{EventBus, EventOrigin, EventRecord};
use crate::network::connection::{ConnectionEvent, ConnectionManager, MessagePriority};
use crate::network::transport::TransportRegistry;
use super::reconciler::StateReconciler;
use super::state::{EntityId, EntityState, StatePayload};

/// Owner of the authoritative local entity and the remote avatars.
pub trait EntityManager: Send {
    /// Current state of the local entity, if it exists yet.
    fn local_state(&self) -> Option<EntityState>;

    /// Show `state` on a remote entity.
    fn apply_remote_state(&mut self, id: &EntityId, state: &EntityState);

    /// A remote entity appeared.
    fn add_remote(&mut self, id: &EntityId);

    /// A remote entity went away.
    fn remove_remote(&mut self, id: &EntityId);
}

/// Coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Render remote entities this far behind the present.
    pub interpolation_delay_ms: Millis,
    /// Event name prefix.
    pub domain: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            interpolation_delay_ms: 100,
            domain: "player".into(),
        }
    }
}

/// Lifecycle of a remote entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    /// Never announced.
    Unknown,
    /// Joined and receiving state.
    Tracked,
    /// Left or disposed.
    Removed,
}

enum InboxItem {
    Event(EventRecord),
    SessionUp,
    SessionDown,
}

/// Per-domain synchronization.
pub struct SyncCoordinator<M: EntityManager> {
    config: CoordinatorConfig,
    bridge: EventBridge,
    connection: ConnectionManager,
    reconciler: StateReconciler,
    manager: M,
    clock: SharedClock,
    local_id: Option<EntityId>,
    joined: bool,
    remotes: HashMap<EntityId, RemoteStatus>,
    inbox: Arc<Mutex<VecDeque<InboxItem>>>,
    session_time: f64,
    _subscriptions: Vec<Subscription>,
}

impl<M: EntityManager> SyncCoordinator<M> {
    /// Wire a coordinator onto an existing bridge and reconciler.
    pub fn new(
        config: CoordinatorConfig,
        bridge: EventBridge,
        reconciler: StateReconciler,
        manager: M,
        clock: SharedClock,
    ) -> Self {
        let connection = bridge.connection().clone();

        bridge.register_event(
            format!("{}.joined", config.domain),
            EventPolicy::syncable().with_priority(MessagePriority::High),
        );
        bridge.register_event(
            format!("{}.left", config.domain),
            EventPolicy::syncable().with_priority(MessagePriority::High),
        );
        bridge.register_event(format!("{}.state", config.domain), EventPolicy::syncable());

        let inbox: Arc<Mutex<VecDeque<InboxItem>>> = Arc::new(Mutex::new(VecDeque::new()));

        let events_inbox = inbox.clone();
        let events_sub = bridge.on(format!("{}.*", config.domain), move |record| {
            if record.origin == EventOrigin::Network {
                events_inbox.lock().push_back(InboxItem::Event(record.clone()));
            }
        });

        let session_inbox = inbox.clone();
        let session_sub = connection.subscribe(move |event| match event {
            ConnectionEvent::Connected => session_inbox.lock().push_back(InboxItem::SessionUp),
            ConnectionEvent::Disconnected { .. } => session_inbox.lock().push_back(InboxItem::SessionDown),
            _ => {}
        });

        Self {
            config,
            bridge,
            connection,
            reconciler,
            manager,
            clock,
            local_id: None,
            joined: false,
            remotes: HashMap::new(),
            inbox,
            session_time: 0.0,
            _subscriptions: vec![events_sub, session_sub],
        }
    }

    /// Build the whole stack (connection, bus, bridge, reconciler) from one
    /// config. Does not connect.
    pub fn from_config(config: &SyncConfig, registry: TransportRegistry, manager: M, clock: SharedClock) -> Self {
        let connection = ConnectionManager::new(config.connection.clone(), registry, clock.clone());
        let bridge = EventBridge::new(config.bridge.clone(), EventBus::new(), connection, clock.clone());
        let reconciler = StateReconciler::new(config.reconciler.clone(), clock.clone());
        Self::new(config.coordinator.clone(), bridge, reconciler, manager, clock)
    }

    fn event_name(&self, kind: &str) -> String {
        format!("{}.{}", self.config.domain, kind)
    }

    // =========================================================================
    // IDENTITY
    // =========================================================================

    /// Set the id that tags outbound state. Setting the same id again does
    /// nothing; a new id starts over with a fresh announcement.
    pub fn set_local_identity(&mut self, id: EntityId) {
        if self.local_id.as_ref() == Some(&id) {
            return;
        }
        if let Some(old) = self.local_id.take() {
            info!("Local identity changed {} -> {}", old, id);
            self.reconciler.reset_local(&old);
            self.joined = false;
        }
        self.local_id = Some(id);
    }

    /// Assign a random identity if none is set. Returns the active identity.
    pub fn ensure_local_identity(&mut self) -> EntityId {
        if let Some(id) = &self.local_id {
            return id.clone();
        }
        let id = EntityId::random();
        self.set_local_identity(id.clone());
        id
    }

    /// Current local identity.
    pub fn local_identity(&self) -> Option<&EntityId> {
        self.local_id.as_ref()
    }

    // =========================================================================
    // FRAME
    // =========================================================================

    /// Per-frame update: inbound traffic, remote join/leave/state, outbound
    /// local state, then interpolated remote state into the entity manager.
    pub fn tick(&mut self, dt: f32) {
        self.session_time += f64::from(dt.max(0.0));

        for envelope in self.connection.poll() {
            if !self.bridge.handle_envelope(&envelope) {
                debug!("ignoring '{}' message", envelope.msg_type);
            }
        }

        let pending: Vec<InboxItem> = self.inbox.lock().drain(..).collect();
        for item in pending {
            match item {
                InboxItem::Event(record) => self.handle_event(&record),
                InboxItem::SessionUp => debug!("session up; next update announces {:?}", self.local_id),
                InboxItem::SessionDown => self.reset_session(),
            }
        }

        self.send_local_state();
        self.apply_remote_states();
    }

    fn reset_session(&mut self) {
        if let Some(id) = &self.local_id {
            self.reconciler.reset_local(id);
        }
        if self.joined {
            info!("Session ended; will re-announce on reconnect");
        }
        self.joined = false;
        self.session_time = 0.0;
    }

    fn send_local_state(&mut self) {
        let Some(id) = self.local_id.clone() else {
            return;
        };
        if !self.connection.is_connected() {
            return;
        }
        let Some(mut state) = self.manager.local_state() else {
            return;
        };
        state.timestamp = self.clock.now_ms();

        let Some(payload) = self.reconciler.update_local_state(&id, &state) else {
            return;
        };
        let encoded = match payload.to_value() {
            Ok(v) => v,
            Err(e) => {
                warn!("Failed to encode state for {}: {}", id, e);
                return;
            }
        };

        if !self.joined {
            info!("Announcing {} as {}", id, self.event_name("joined"));
            self.bridge.emit_local(&self.event_name("joined"), json!({ "id": id }), None);
            self.joined = true;
        }

        debug!("sending {} state for {}", if payload.is_full() { "full" } else { "delta" }, id);
        self.bridge
            .emit_local(&self.event_name("state"), json!({ "id": id, "state": encoded }), None);
    }

    fn apply_remote_states(&mut self) {
        let target = self
            .clock
            .now_ms()
            .saturating_sub(self.config.interpolation_delay_ms);
        for (id, status) in &self.remotes {
            if *status != RemoteStatus::Tracked {
                continue;
            }
            if let Some(state) = self.reconciler.get_interpolated_state(id, target) {
                self.manager.apply_remote_state(id, &state);
            }
        }
    }

    // =========================================================================
    // INBOUND EVENTS
    // =========================================================================

    fn handle_event(&mut self, record: &EventRecord) {
        let Some(id) = record.payload.get("id").and_then(Value::as_str).map(EntityId::from) else {
            warn!("'{}' event without an id; skipped", record.name);
            return;
        };
        if self.local_id.as_ref() == Some(&id) {
            return;
        }

        let kind = record
            .name
            .strip_prefix(&self.config.domain)
            .and_then(|rest| rest.strip_prefix('.'))
            .unwrap_or("");

        match kind {
            "joined" => self.on_remote_join(id),
            "left" => self.on_remote_leave(id),
            "state" => self.on_remote_state(id, &record.payload),
            other => debug!("unhandled domain event '{}'", other),
        }
    }

    fn on_remote_join(&mut self, id: EntityId) {
        if self.remote_status(&id) == RemoteStatus::Tracked {
            debug!("{} already tracked", id);
            return;
        }
        info!("Remote {} joined", id);
        self.remotes.insert(id.clone(), RemoteStatus::Tracked);
        self.manager.add_remote(&id);
    }

    fn on_remote_leave(&mut self, id: EntityId) {
        if self.remote_status(&id) != RemoteStatus::Tracked {
            debug!("leave for untracked {}", id);
            return;
        }
        info!("Remote {} left", id);
        self.remotes.insert(id.clone(), RemoteStatus::Removed);
        self.reconciler.clear_entity(&id);
        self.manager.remove_remote(&id);
    }

    fn on_remote_state(&mut self, id: EntityId, data: &Value) {
        if self.remote_status(&id) != RemoteStatus::Tracked {
            debug!("state for untracked {}; ignored", id);
            return;
        }
        let Some(raw) = data.get("state") else {
            warn!("state event for {} without payload", id);
            return;
        };
        match StatePayload::from_value(raw) {
            Ok(payload) => {
                let timestamp = payload.timestamp().unwrap_or_else(|| self.clock.now_ms());
                self.reconciler.receive_remote_state(&id, &payload, timestamp);
            }
            Err(e) => warn!("Bad state payload for {}: {}", id, e),
        }
    }

    // =========================================================================
    // TEARDOWN
    // =========================================================================

    /// Announce departure, disconnect, and dispose every remote entity.
    pub fn shutdown(&mut self) {
        if self.joined && self.connection.is_connected() {
            if let Some(id) = &self.local_id {
                self.bridge.emit_local(&self.event_name("left"), json!({ "id": id }), None);
            }
        }
        self.joined = false;
        self.connection.disconnect();

        let tracked: Vec<EntityId> = self
            .remotes
            .iter()
            .filter(|(_, s)| **s == RemoteStatus::Tracked)
            .map(|(id, _)| id.clone())
            .collect();
        for id in tracked {
            self.manager.remove_remote(&id);
            self.remotes.insert(id, RemoteStatus::Removed);
        }
        self.reconciler.clear_all();
        self.inbox.lock().clear();
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    /// Status of a remote entity.
    pub fn remote_status(&self, id: &EntityId) -> RemoteStatus {
        self.remotes.get(id).copied().unwrap_or(RemoteStatus::Unknown)
    }

    /// Tracked remote entities, sorted.
    pub fn tracked_remotes(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self
            .remotes
            .iter()
            .filter(|(_, s)| **s == RemoteStatus::Tracked)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// True once this session's join announcement went out.
    pub fn has_joined(&self) -> bool {
        self.joined
    }

    /// Seconds of `tick` time since the session (re)started.
    pub fn session_time(&self) -> f64 {
        self.session_time
    }

    /// Entity manager.
    pub fn manager(&self) -> &M {
        &self.manager
    }

    /// Entity manager, mutably.
    pub fn manager_mut(&mut self) -> &mut M {
        &mut self.manager
    }

    /// Read-only reconciler access.
    pub fn reconciler(&self) -> &StateReconciler {
        &self.reconciler
    }

    /// Event bridge.
    pub fn bridge(&self) -> &EventBridge {
        &self.bridge
    }

    /// Connection.
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Configuration.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }
}
