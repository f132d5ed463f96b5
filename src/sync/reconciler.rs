//! State Reconciler
//!
//! Per-entity state synchronization.
//!
//! Outbound: [`StateReconciler::update_local_state`] turns the current local
//! state into a full snapshot (first time) or a delta against the last state
//! *sent*, rate-limited per entity.
//!
//! Inbound: [`StateReconciler::receive_remote_state`] reconstructs full
//! snapshots from full or partial payloads and buffers them;
//! [`StateReconciler::get_interpolated_state`] reads the buffer at a target
//! time for rendering.

use std::collections::HashMap;
use serde::{Serialize, Deserialize};
use tracing::{debug, warn};

use crate::config::env_parse;
use crate::core::clock::{Millis, SharedClock};
use crate::core::listeners::{Listeners, Subscription};
use super::buffer::{Bracket, StateBuffer};
use super::state::{EntityId, EntityState, StatePayload};

/// Reconciler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Maximum outbound updates per second per entity (0 = unlimited).
    pub update_rate_hz: u32,
    /// Snapshots kept per remote entity.
    pub buffer_capacity: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            update_rate_hz: 20,
            buffer_capacity: 32,
        }
    }
}

impl ReconcilerConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            update_rate_hz: env_parse("RUNE_SYNC_UPDATE_HZ", d.update_rate_hz),
            buffer_capacity: env_parse("RUNE_SYNC_BUFFER_CAP", d.buffer_capacity),
        }
    }

    /// Minimum time between outbound updates for one entity.
    pub fn min_interval_ms(&self) -> Millis {
        if self.update_rate_hz == 0 {
            0
        } else {
            1_000 / Millis::from(self.update_rate_hz)
        }
    }
}

/// Notification for every remote snapshot folded into a buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct StateUpdate {
    /// Entity updated.
    pub entity: EntityId,
    /// Reconstructed full state.
    pub state: EntityState,
    /// Buffer timestamp.
    pub timestamp: Millis,
    /// Payload was a full snapshot.
    pub was_full: bool,
}

#[derive(Debug, Default)]
struct LocalTrack {
    last_sent: Option<EntityState>,
    last_update_at: Option<Millis>,
}

/// Owns outbound baselines and inbound buffers.
pub struct StateReconciler {
    config: ReconcilerConfig,
    clock: SharedClock,
    local: HashMap<EntityId, LocalTrack>,
    remote: HashMap<EntityId, StateBuffer>,
    listeners: Listeners<StateUpdate>,
}

impl StateReconciler {
    /// Create a reconciler.
    pub fn new(config: ReconcilerConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            local: HashMap::new(),
            remote: HashMap::new(),
            listeners: Listeners::new(),
        }
    }

    // =========================================================================
    // OUTBOUND
    // =========================================================================

    /// Compute what to send for a locally owned entity.
    ///
    /// Returns `None` inside the rate-limit window or when nothing changed.
    /// The first call for an entity returns the full state. Any payload
    /// returned becomes the new baseline.
    pub fn update_local_state(&mut self, entity: &EntityId, current: &EntityState) -> Option<StatePayload> {
        let now = self.clock.now_ms();
        let interval = self.config.min_interval_ms();
        let track = self.local.entry(entity.clone()).or_default();

        if let Some(last) = track.last_update_at {
            if now.saturating_sub(last) < interval {
                return None;
            }
        }
        track.last_update_at = Some(now);

        let payload = match &track.last_sent {
            None => StatePayload::Full(current.clone()),
            Some(base) => {
                let delta = current.diff(base);
                if !delta.has_changes() {
                    return None;
                }
                StatePayload::Delta(delta)
            }
        };

        track.last_sent = Some(current.clone());
        Some(payload)
    }

    /// Forget the baseline and rate-limit window for a local entity, so
    /// the next update is a full snapshot.
    pub fn reset_local(&mut self, entity: &EntityId) {
        self.local.remove(entity);
    }

    /// True if a baseline exists for a local entity.
    pub fn has_baseline(&self, entity: &EntityId) -> bool {
        self.local
            .get(entity)
            .map(|t| t.last_sent.is_some())
            .unwrap_or(false)
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    /// Fold a remote payload into the entity's buffer and return the
    /// reconstructed snapshot. A delta with no prior snapshot is applied onto
    /// defaults.
    pub fn receive_remote_state(&mut self, entity: &EntityId, payload: &StatePayload, timestamp: Millis) -> EntityState {
        let capacity = self.config.buffer_capacity;
        let buffer = self
            .remote
            .entry(entity.clone())
            .or_insert_with(|| StateBuffer::new(capacity));

        let base = buffer.latest().map(|e| &e.state);
        if base.is_none() && !payload.is_full() {
            warn!("Delta for {} with no prior snapshot; applying to defaults", entity);
        }
        let state = payload.resolve(base);

        if buffer.push(state.clone(), timestamp).is_some() {
            debug!("state buffer for {} full; evicted oldest", entity);
        }
        let timestamp = buffer.latest().map(|e| e.timestamp).unwrap_or(timestamp);

        self.listeners.notify(&StateUpdate {
            entity: entity.clone(),
            state: state.clone(),
            timestamp,
            was_full: payload.is_full(),
        });
        state
    }

    /// State of a remote entity at `target` time.
    ///
    /// Fewer than two usable samples: the nearest one, unmodified.
    /// Otherwise interpolates between the bracketing pair with the factor
    /// clamped to [0, 1]; at a factor of exactly 0 or 1 the buffered snapshot
    /// is returned as is.
    pub fn get_interpolated_state(&self, entity: &EntityId, target: Millis) -> Option<EntityState> {
        let buffer = self.remote.get(entity)?;
        match buffer.bracket(target) {
            Bracket::Empty => None,
            Bracket::Single(entry) => Some(entry.state.clone()),
            Bracket::Pair { from, to } => {
                let span = to.timestamp.saturating_sub(from.timestamp);
                let factor = if span == 0 {
                    1.0
                } else {
                    (target.saturating_sub(from.timestamp) as f64 / span as f64).clamp(0.0, 1.0) as f32
                };

                if factor <= 0.0 {
                    Some(from.state.clone())
                } else if factor >= 1.0 {
                    Some(to.state.clone())
                } else {
                    Some(interpolate(&from.state, &to.state, factor))
                }
            }
        }
    }

    /// Latest buffered snapshot for a remote entity.
    pub fn latest_state(&self, entity: &EntityId) -> Option<&EntityState> {
        self.remote.get(entity)?.latest().map(|e| &e.state)
    }

    /// Read-only view of a remote entity's buffer.
    pub fn buffer(&self, entity: &EntityId) -> Option<&StateBuffer> {
        self.remote.get(entity)
    }

    /// Remote entities with buffered state.
    pub fn remote_entities(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.remote.keys().cloned().collect();
        ids.sort();
        ids
    }

    // =========================================================================
    // CONFLICTS / LIFECYCLE
    // =========================================================================

    /// Last write wins by timestamp; on a tie `a` wins.
    pub fn resolve_conflict<'a>(&self, entity: &EntityId, a: &'a EntityState, b: &'a EntityState) -> &'a EntityState {
        if b.timestamp > a.timestamp {
            debug!("conflict on {}: later update ({}) wins", entity, b.timestamp);
            b
        } else {
            a
        }
    }

    /// Drop the buffer and baseline for one entity.
    pub fn clear_entity(&mut self, entity: &EntityId) {
        self.remote.remove(entity);
        self.local.remove(entity);
    }

    /// Drop everything.
    pub fn clear_all(&mut self) {
        self.remote.clear();
        self.local.clear();
    }

    /// Called for every remote snapshot buffered.
    pub fn on_state_update<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&StateUpdate) + Send + Sync + 'static,
    {
        self.listeners.subscribe(handler)
    }

    /// Active configuration.
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }
}

impl std::fmt::Debug for StateReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateReconciler")
            .field("config", &self.config)
            .field("local", &self.local.len())
            .field("remote", &self.remote.len())
            .finish()
    }
}

/// Blend two snapshots. Position and velocity are linear, rotation takes the
/// shortest arc. Discrete fields come from `a`.
pub fn interpolate(a: &EntityState, b: &EntityState, t: f32) -> EntityState {
    let t = t.clamp(0.0, 1.0);
    let span = b.timestamp.saturating_sub(a.timestamp) as f64;
    EntityState {
        position: a.position.lerp(b.position, t),
        rotation: a.rotation.slerp(b.rotation, t),
        velocity: a.velocity.lerp(b.velocity, t),
        timestamp: a.timestamp + (span * f64::from(t)).round() as Millis,
        ..a.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use parking_lot::Mutex;
    use crate::core::clock::ManualClock;
    use crate::core::quat::Quat;
    use crate::core::vec3::Vec3;
    use crate::sync::state::{EntityDelta, MotionMode};

    fn reconciler() -> (StateReconciler, ManualClock) {
        let clock = ManualClock::new(0);
        let r = StateReconciler::new(ReconcilerConfig::default(), Arc::new(clock.clone()));
        (r, clock)
    }

    fn p1() -> EntityId {
        EntityId::from("p1")
    }

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn test_first_update_is_full() {
        let (mut r, _) = reconciler();
        let s = EntityState::at(Vec3::ZERO, 0.0);
        assert_eq!(r.update_local_state(&p1(), &s), Some(StatePayload::Full(s)));
        assert!(r.has_baseline(&p1()));
    }

    #[test]
    fn test_rate_limit_window() {
        let (mut r, clock) = reconciler();
        let mut s = EntityState::at(Vec3::ZERO, 0.0);
        assert!(r.update_local_state(&p1(), &s).is_some());

        // 20 Hz: nothing until 50ms have passed, however much changed.
        for step in 1..5 {
            clock.set(step * 10);
            s.position.x = step as f32;
            assert!(r.update_local_state(&p1(), &s).is_none());
        }

        clock.set(50);
        assert!(r.update_local_state(&p1(), &s).is_some());
    }

    #[test]
    fn test_rate_limit_is_per_entity() {
        let (mut r, _) = reconciler();
        let s = EntityState::default();
        assert!(r.update_local_state(&p1(), &s).is_some());
        assert!(r.update_local_state(&EntityId::from("p2"), &s).is_some());
    }

    #[test]
    fn test_delta_is_relative_to_last_sent() {
        let (mut r, clock) = reconciler();
        let mut s = EntityState::at(Vec3::ZERO, 0.0);
        r.update_local_state(&p1(), &s);

        // Change inside the window is not sent and does not move the baseline.
        clock.set(10);
        s.position.x = 1.0;
        assert!(r.update_local_state(&p1(), &s).is_none());

        clock.set(60);
        s.position.x = 2.0;
        match r.update_local_state(&p1(), &s) {
            Some(StatePayload::Delta(d)) => {
                assert_eq!(d.position, Some(Vec3::new(2.0, 0.0, 0.0)));
                assert_eq!(d.field_count(), 1);
            }
            other => panic!("expected delta, got {:?}", other),
        }

        // Unchanged: no payload.
        clock.set(200);
        assert!(r.update_local_state(&p1(), &s).is_none());
    }

    #[test]
    fn test_reset_local_bootstraps_again() {
        let (mut r, clock) = reconciler();
        let s = EntityState::default();
        r.update_local_state(&p1(), &s);
        r.reset_local(&p1());
        clock.set(1);
        assert!(matches!(r.update_local_state(&p1(), &s), Some(StatePayload::Full(_))));
    }

    #[test]
    fn test_partial_overlays_latest() {
        let (mut r, _) = reconciler();
        let mut full = EntityState::at(Vec3::new(0.0, 0.0, 0.0), 1.0);
        full.grounded = true;
        full.mode = MotionMode::Walking;
        r.receive_remote_state(&p1(), &StatePayload::Full(full.clone()), 0);

        let delta = EntityDelta {
            position: Some(Vec3::new(5.0, 0.0, 0.0)),
            grounded: Some(false),
            ..EntityDelta::default()
        };
        let merged = r.receive_remote_state(&p1(), &StatePayload::Delta(delta), 50);

        assert_eq!(merged.position, Vec3::new(5.0, 0.0, 0.0));
        assert!(!merged.grounded);
        assert_eq!(merged.mode, MotionMode::Walking);
        assert_eq!(merged.rotation, full.rotation);
        assert_eq!(r.buffer(&p1()).unwrap().len(), 2);
    }

    #[test]
    fn test_partial_without_history_synthesizes() {
        let (mut r, _) = reconciler();
        let delta = EntityDelta {
            velocity: Some(Vec3::X),
            ..EntityDelta::default()
        };
        let s = r.receive_remote_state(&p1(), &StatePayload::Delta(delta), 10);
        assert_eq!(s.velocity, Vec3::X);
        assert_eq!(s.position, Vec3::ZERO);
        assert_eq!(r.latest_state(&p1()), Some(&s));
    }

    #[test]
    fn test_buffer_capacity_respected() {
        let clock = ManualClock::new(0);
        let config = ReconcilerConfig {
            buffer_capacity: 3,
            ..ReconcilerConfig::default()
        };
        let mut r = StateReconciler::new(config, Arc::new(clock));
        for i in 0..10u64 {
            let s = EntityState::at(Vec3::new(i as f32, 0.0, 0.0), 0.0);
            r.receive_remote_state(&p1(), &StatePayload::Full(s), i * 10);
        }
        let buf = r.buffer(&p1()).unwrap();
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.oldest().unwrap().state.position.x, 7.0);
    }

    #[test]
    fn test_interpolation_midpoint() {
        let (mut r, _) = reconciler();
        let a = EntityState::at(Vec3::new(0.0, 0.0, 0.0), 0.0);
        let b = EntityState::at(Vec3::new(10.0, 0.0, 0.0), 1.0);
        r.receive_remote_state(&p1(), &StatePayload::Full(a), 100);
        r.receive_remote_state(&p1(), &StatePayload::Full(b), 200);

        let mid = r.get_interpolated_state(&p1(), 150).unwrap();
        assert!(approx(mid.position.x, 5.0));
        assert!(approx(mid.rotation.yaw(), 0.5));
    }

    #[test]
    fn test_interpolation_exact_at_buffered_timestamps() {
        let (mut r, _) = reconciler();
        let mut a = EntityState::at(Vec3::new(1.0, 2.0, 3.0), 0.3);
        a.timestamp = 100;
        let mut b = EntityState::at(Vec3::new(4.0, 5.0, 6.0), 0.9);
        b.timestamp = 200;
        r.receive_remote_state(&p1(), &StatePayload::Full(a.clone()), 100);
        r.receive_remote_state(&p1(), &StatePayload::Full(b.clone()), 200);

        assert_eq!(r.get_interpolated_state(&p1(), 100), Some(a.clone()));
        assert_eq!(r.get_interpolated_state(&p1(), 200), Some(b.clone()));
        // Outside the range: nearest sample, no extrapolation.
        assert_eq!(r.get_interpolated_state(&p1(), 10), Some(a));
        assert_eq!(r.get_interpolated_state(&p1(), 900), Some(b));
    }

    #[test]
    fn test_interpolation_single_sample() {
        let (mut r, _) = reconciler();
        assert!(r.get_interpolated_state(&p1(), 0).is_none());
        let s = EntityState::at(Vec3::Y, 0.0);
        r.receive_remote_state(&p1(), &StatePayload::Full(s.clone()), 100);
        assert_eq!(r.get_interpolated_state(&p1(), 500), Some(s));
    }

    #[test]
    fn test_interpolation_takes_short_arc() {
        let a = EntityState::at(Vec3::ZERO, 170f32.to_radians());
        let b = EntityState::at(Vec3::ZERO, (-170f32).to_radians());
        let mid = interpolate(&a, &b, 0.5);
        assert!((mid.rotation.yaw().abs() - std::f32::consts::PI).abs() < 1e-3);
    }

    #[test]
    fn test_discrete_fields_from_earlier_sample() {
        let mut a = EntityState::default();
        a.mode = MotionMode::Walking;
        let mut b = EntityState::default();
        b.mode = MotionMode::Jumping;
        b.timestamp = 100;
        let mid = interpolate(&a, &b, 0.9);
        assert_eq!(mid.mode, MotionMode::Walking);
        assert_eq!(mid.timestamp, 90);
    }

    #[test]
    fn test_conflict_last_write_wins() {
        let (r, _) = reconciler();
        let mut a = EntityState::default();
        let mut b = EntityState::at(Vec3::X, 0.0);
        a.timestamp = 10;
        b.timestamp = 20;
        assert_eq!(r.resolve_conflict(&p1(), &a, &b), &b);
        assert_eq!(r.resolve_conflict(&p1(), &b, &a), &b);

        b.timestamp = 10;
        assert_eq!(r.resolve_conflict(&p1(), &a, &b), &a);
        assert_eq!(r.resolve_conflict(&p1(), &b, &a), &b);
    }

    #[test]
    fn test_clear_entity_and_all() {
        let (mut r, _) = reconciler();
        let s = EntityState::default();
        r.receive_remote_state(&p1(), &StatePayload::Full(s.clone()), 0);
        r.receive_remote_state(&EntityId::from("p2"), &StatePayload::Full(s.clone()), 0);
        r.update_local_state(&p1(), &s);

        r.clear_entity(&p1());
        assert!(r.buffer(&p1()).is_none());
        assert!(!r.has_baseline(&p1()));
        assert_eq!(r.remote_entities(), vec![EntityId::from("p2")]);

        r.clear_all();
        assert!(r.remote_entities().is_empty());
    }

    #[test]
    fn test_state_update_callback() {
        let (mut r, _) = reconciler();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = r.on_state_update(move |u| sink.lock().push((u.entity.clone(), u.was_full)));

        r.receive_remote_state(&p1(), &StatePayload::Full(EntityState::default()), 0);
        r.receive_remote_state(&p1(), &StatePayload::Delta(EntityDelta::default()), 5);
        assert_eq!(*seen.lock(), vec![(p1(), true), (p1(), false)]);
    }

    #[test]
    fn test_rotation_identity_default() {
        assert_eq!(EntityState::default().rotation, Quat::IDENTITY);
    }
}
