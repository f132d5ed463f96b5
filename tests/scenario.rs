//! End-to-end synchronization over the in-process relay.
//!
//! Two coordinators (`p1` and `peer`) share a `MemoryHub` and a manual clock,
//! so every timer (rate limit, backoff, interpolation delay) is deterministic.

use std::collections::HashMap;
use std::sync::Arc;
use parking_lot::Mutex;

use rune_sync::{
    network::{ConnectionEvent, ConnectionState, Envelope, EventPayload, MemoryTransport, Transport, TransportEvent, MEMORY},
    sync::RemoteStatus,
    EntityId, EntityManager, EntityState, ManualClock, MemoryHub, Quat, SharedClock, StatePayload, SyncConfig,
    SyncCoordinator, TransportRegistry, Vec3,
};

#[derive(Default)]
struct World {
    local: Option<EntityState>,
    remotes: HashMap<EntityId, EntityState>,
}

impl EntityManager for World {
    fn local_state(&self) -> Option<EntityState> {
        self.local.clone()
    }
    fn apply_remote_state(&mut self, id: &EntityId, state: &EntityState) {
        self.remotes.insert(id.clone(), state.clone());
    }
    fn add_remote(&mut self, id: &EntityId) {
        self.remotes.insert(id.clone(), EntityState::default());
    }
    fn remove_remote(&mut self, id: &EntityId) {
        self.remotes.remove(id);
    }
}

fn config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.connection.transport = MEMORY.into();
    config.connection.url = "mem://room".into();
    config.connection.reconnect_base_delay_ms = 1_000;
    config.connection.max_reconnect_attempts = 3;
    config
}

fn client(hub: &MemoryHub, label: &str, clock: &ManualClock) -> SyncCoordinator<World> {
    let mut registry = TransportRegistry::empty();
    registry.register_factory(MEMORY, hub.factory(label));
    let shared: SharedClock = Arc::new(clock.clone());
    let mut coordinator = SyncCoordinator::from_config(&config(), registry, World::default(), shared);
    coordinator.set_local_identity(EntityId::from(label));
    coordinator
}

/// `{x, y, heading}` from the scenario, mapped onto the ground plane.
fn pose(x: f32, y: f32, heading: f32) -> EntityState {
    EntityState {
        position: Vec3::new(x, 0.0, y),
        rotation: Quat::from_yaw(heading),
        ..EntityState::default()
    }
}

fn wire_states(observer: &mut MemoryTransport) -> Vec<serde_json::Value> {
    std::iter::from_fn(|| observer.poll_event())
        .filter_map(|e| match e {
            TransportEvent::Message(frame) => Envelope::from_json(&frame).ok(),
            _ => None,
        })
        .filter_map(|env| EventPayload::from_envelope(&env).ok())
        .filter(|p| p.name == "player.state")
        .map(|p| p.data["state"].clone())
        .collect()
}

#[test]
fn full_then_delta_then_drop_until_give_up() {
    let hub = MemoryHub::new();
    let clock = ManualClock::new(0);
    let p1_id = EntityId::from("p1");

    let mut peer = client(&hub, "peer", &clock);
    peer.connection().connect();
    peer.tick(0.0);
    assert!(peer.connection().is_connected());

    let mut observer = hub.transport();
    observer.open().unwrap();

    let mut p1 = client(&hub, "p1", &clock);
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let _sub = p1.connection().subscribe(move |e| sink.lock().push(e.clone()));
    p1.connection().connect();

    // t=0: bootstrap sends the full state.
    p1.manager_mut().local = Some(pose(0.0, 0.0, 0.0));
    p1.tick(0.0);
    peer.tick(0.0);
    assert_eq!(peer.remote_status(&p1_id), RemoteStatus::Tracked);
    assert_eq!(peer.reconciler().buffer(&p1_id).map(|b| b.len()), Some(1));

    // t=50: only x changed.
    clock.set(50);
    p1.manager_mut().local = Some(pose(5.0, 0.0, 0.0));
    p1.tick(0.05);
    peer.tick(0.05);

    let sent = wire_states(&mut observer);
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0]["kind"], "full");
    assert_eq!(sent[1]["kind"], "delta");
    assert!(sent[1].get("position").is_some());
    assert!(sent[1].get("rotation").is_none());

    let rebuilt = peer.reconciler().latest_state(&p1_id).unwrap();
    assert_eq!(rebuilt.position, Vec3::new(5.0, 0.0, 0.0));
    assert_eq!(rebuilt.rotation, Quat::from_yaw(0.0));
    assert_eq!(peer.reconciler().buffer(&p1_id).map(|b| b.len()), Some(2));

    // t=100: p1 is cut off and the server stops accepting it.
    clock.set(100);
    hub.set_refusing(true);
    assert!(hub.drop_peer("p1"));
    p1.tick(0.05);

    assert_eq!(p1.connection().state(), ConnectionState::Disconnected);
    assert_eq!(p1.connection().reconnect_attempts(), 1);
    assert_eq!(p1.connection().pending_reconnect_at(), Some(1_100));
    assert!(events
        .lock()
        .contains(&ConnectionEvent::ReconnectScheduled { attempt: 1, delay_ms: 1_000 }));

    // Run frames until the connection gives up.
    for _ in 0..200 {
        clock.advance(50);
        p1.tick(0.05);
        peer.tick(0.05);
    }

    assert_eq!(p1.connection().state(), ConnectionState::Error);
    assert!(p1.connection().has_given_up());
    assert!(p1.connection().pending_reconnect_at().is_none());

    let delays: Vec<u64> = events
        .lock()
        .iter()
        .filter_map(|e| match e {
            ConnectionEvent::ReconnectScheduled { delay_ms, .. } => Some(*delay_ms),
            _ => None,
        })
        .collect();
    assert_eq!(delays, vec![1_000, 2_000, 4_000]);
    assert!(events.lock().contains(&ConnectionEvent::GaveUp { attempts: 3 }));

    // Stays put without an explicit connect.
    clock.advance(60_000);
    p1.tick(0.05);
    assert_eq!(p1.connection().state(), ConnectionState::Error);
}

#[test]
fn reconnect_resets_attempts_and_reannounces() {
    let hub = MemoryHub::new();
    let clock = ManualClock::new(0);

    let mut peer = client(&hub, "peer", &clock);
    peer.connection().connect();
    peer.tick(0.0);

    let mut p1 = client(&hub, "p1", &clock);
    p1.connection().connect();
    p1.manager_mut().local = Some(pose(1.0, 2.0, 0.5));
    p1.tick(0.0);
    peer.tick(0.0);

    hub.set_refusing(true);
    hub.drop_peer("p1");
    p1.tick(0.0);

    // Attempt 1 refused at t=1000; attempt 2 scheduled for t=3000.
    clock.set(1_000);
    p1.tick(0.0);
    p1.tick(0.0);
    assert_eq!(p1.connection().reconnect_attempts(), 2);
    assert_eq!(p1.connection().pending_reconnect_at(), Some(3_000));

    hub.set_refusing(false);
    clock.set(3_000);
    p1.tick(0.0);
    p1.tick(0.0);
    assert!(p1.connection().is_connected());
    assert_eq!(p1.connection().reconnect_attempts(), 0);
    assert!(p1.has_joined());

    // The peer gets a fresh full snapshot after the reconnect.
    peer.tick(0.0);
    let buffer = peer.reconciler().buffer(&EntityId::from("p1")).unwrap();
    assert_eq!(buffer.len(), 2);
    assert_eq!(buffer.latest().unwrap().state.position, Vec3::new(1.0, 0.0, 2.0));
}

#[test]
fn peer_renders_interpolated_state_behind_present() {
    let hub = MemoryHub::new();
    let clock = ManualClock::new(1_000);

    let mut peer = client(&hub, "peer", &clock);
    peer.connection().connect();
    peer.tick(0.0);

    let mut p1 = client(&hub, "p1", &clock);
    p1.connection().connect();

    // p1 moves +1 on x every 50ms.
    for step in 0..6 {
        p1.manager_mut().local = Some(pose(step as f32, 0.0, 0.0));
        p1.tick(0.05);
        peer.tick(0.05);
        clock.advance(50);
    }

    // Latest sample at t=1250 (x=5); peer renders t=1300-100=1200, i.e. x=4.
    peer.tick(0.0);
    let shown = peer.manager().remotes.get(&EntityId::from("p1")).unwrap();
    assert!((shown.position.x - 4.0).abs() < 1e-4);

    // Halfway between samples.
    clock.set(1_225 + 100);
    peer.tick(0.0);
    let shown = peer.manager().remotes.get(&EntityId::from("p1")).unwrap();
    assert!((shown.position.x - 4.5).abs() < 1e-4);
}

#[test]
fn echoed_events_are_not_reobserved() {
    let hub = MemoryHub::new();
    hub.set_echo_to_sender(true);
    let clock = ManualClock::new(0);

    let mut p1 = client(&hub, "p1", &clock);
    p1.connection().connect();
    p1.manager_mut().local = Some(pose(0.0, 0.0, 0.0));
    p1.tick(0.0);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _sub = p1.bridge().on("player.*", move |r| sink.lock().push((r.name.clone(), r.origin)));

    // The relay hands p1's join and state straight back.
    p1.tick(0.0);
    assert!(seen.lock().is_empty());
    assert_eq!(p1.bridge().stats().echoes_suppressed, 2);
    assert!(p1.tracked_remotes().is_empty());
}

#[test]
fn leave_removes_remote_on_peer() {
    let hub = MemoryHub::new();
    let clock = ManualClock::new(0);

    let mut peer = client(&hub, "peer", &clock);
    peer.connection().connect();
    peer.tick(0.0);

    let mut p1 = client(&hub, "p1", &clock);
    p1.connection().connect();
    p1.manager_mut().local = Some(pose(0.0, 0.0, 0.0));
    p1.tick(0.0);
    peer.tick(0.0);
    assert!(peer.manager().remotes.contains_key(&EntityId::from("p1")));

    p1.shutdown();
    peer.tick(0.0);
    assert_eq!(peer.remote_status(&EntityId::from("p1")), RemoteStatus::Removed);
    assert!(peer.manager().remotes.is_empty());
    assert!(peer.reconciler().buffer(&EntityId::from("p1")).is_none());
}

#[test]
fn untagged_full_payload_from_older_client_is_accepted() {
    let hub = MemoryHub::new();
    let clock = ManualClock::new(0);

    let mut peer = client(&hub, "peer", &clock);
    peer.connection().connect();
    peer.tick(0.0);

    let mut legacy = hub.transport();
    legacy.open().unwrap();
    let send = |t: &mut MemoryTransport, name: &str, data: serde_json::Value, id: &str| {
        let env = EventPayload::new(name, &data, id, 0).into_envelope().unwrap();
        t.send(env.to_json().unwrap()).unwrap();
    };

    send(&mut legacy, "player.joined", serde_json::json!({"id": "old"}), "l-1");
    send(
        &mut legacy,
        "player.state",
        serde_json::json!({"id": "old", "state": {
            "position": {"x": 2.0, "y": 0.0, "z": 0.0},
            "rotation": {"x": 0.0, "y": 0.0, "z": 0.0, "w": 1.0},
            "timestamp": 0
        }}),
        "l-2",
    );
    peer.tick(0.0);

    let latest = peer.reconciler().latest_state(&EntityId::from("old")).unwrap();
    assert_eq!(latest.position.x, 2.0);
    assert!(matches!(
        StatePayload::from_value(&serde_json::json!({"position": {"x": 1.0, "y": 0.0, "z": 0.0}})),
        Ok(StatePayload::Delta(_))
    ));
}
