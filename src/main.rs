//! Rune Relic Sync demo
//!
//! Two clients share an in-process relay. Alice walks in a circle; Bob
//! renders her interpolated position. Halfway through Alice's connection is
//! cut and comes back on its own.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use rune_sync::{
    network::MEMORY,
    sync::MotionMode,
    EntityId, EntityManager, EntityState, ManualClock, MemoryHub, SharedClock, SyncConfig,
    SyncCoordinator, TransportRegistry, Vec3, VERSION,
};

/// Frame length (ms).
const FRAME_MS: u64 = 16;

/// Frames to simulate.
const FRAMES: u64 = 240;

/// Frame at which Alice's connection is dropped.
const DROP_AT_FRAME: u64 = 100;

/// Minimal entity collection: one walking local avatar plus remote avatars.
#[derive(Default)]
struct Avatars {
    local: Option<EntityState>,
    remotes: HashMap<EntityId, EntityState>,
}

impl EntityManager for Avatars {
    fn local_state(&self) -> Option<EntityState> {
        self.local.clone()
    }

    fn apply_remote_state(&mut self, id: &EntityId, state: &EntityState) {
        self.remotes.insert(id.clone(), state.clone());
    }

    fn add_remote(&mut self, id: &EntityId) {
        info!("avatar spawned for {}", id);
        self.remotes.insert(id.clone(), EntityState::default());
    }

    fn remove_remote(&mut self, id: &EntityId) {
        info!("avatar removed for {}", id);
        self.remotes.remove(id);
    }
}

fn client(hub: &MemoryHub, label: &str, config: &SyncConfig, clock: SharedClock) -> SyncCoordinator<Avatars> {
    let mut registry = TransportRegistry::with_defaults();
    registry.register_factory(MEMORY, hub.factory(label));
    let mut coordinator = SyncCoordinator::from_config(config, registry, Avatars::default(), clock);
    coordinator.set_local_identity(EntityId::from(label));
    coordinator
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Rune Relic Sync demo v{}", VERSION);

    let mut config = SyncConfig::from_env();
    config.connection.transport = MEMORY.into();
    config.connection.url = "mem://demo".into();
    config.connection.reconnect_base_delay_ms = 250;
    config.validate()?;

    let hub = MemoryHub::new();
    let clock = ManualClock::new(0);
    let shared: SharedClock = Arc::new(clock.clone());

    let mut alice = client(&hub, "alice", &config, shared.clone());
    let mut bob = client(&hub, "bob", &config, shared);

    bob.connection().connect();
    bob.tick(0.0);
    alice.connection().connect();

    let alice_id = EntityId::from("alice");
    let dt = FRAME_MS as f32 / 1_000.0;

    for frame in 0..FRAMES {
        clock.advance(FRAME_MS);

        let angle = frame as f32 * 0.05;
        let mut state = EntityState::at(Vec3::new(angle.cos() * 5.0, 0.0, angle.sin() * 5.0), angle);
        state.velocity = Vec3::new(-angle.sin(), 0.0, angle.cos()).scale(5.0 * 0.05 / dt);
        state.mode = MotionMode::Walking;
        state.grounded = true;
        alice.manager_mut().local = Some(state);

        if frame == DROP_AT_FRAME {
            info!("--- cutting alice's connection ---");
            hub.drop_peer("alice");
        }

        alice.tick(dt);
        bob.tick(dt);

        if frame % 30 == 0 {
            match bob.manager().remotes.get(&alice_id) {
                Some(seen) => info!(
                    "frame {:>3}: bob sees alice at {} ({:?}), alice is {:?}",
                    frame,
                    seen.position,
                    seen.mode,
                    alice.connection().state()
                ),
                None => info!("frame {:>3}: bob does not see alice yet", frame),
            }
        }
    }

    alice.shutdown();
    bob.tick(dt);
    info!("bob tracks {} remote(s) after alice left", bob.tracked_remotes().len());

    let stats = alice.connection().stats();
    info!(
        "alice: sent={} queued={} reconnects={} heartbeats={}",
        stats.sent, stats.queued, stats.reconnects, stats.heartbeats
    );
    let bridge = bob.bridge().stats();
    info!("bob bridge: received={} echoes={}", bridge.received, bridge.echoes_suppressed);

    bob.shutdown();
    Ok(())
}
