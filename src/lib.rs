//! # Rune Relic Sync
//!
//! Real-time multiplayer state synchronization for Rune Relic clients.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     RUNE RELIC SYNC                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/            - Primitives                               │
//! │  ├── vec3.rs      - f32 3D vector                            │
//! │  ├── quat.rs      - Rotation with shortest-arc slerp         │
//! │  ├── clock.rs     - Injectable time source                   │
//! │  ├── listeners.rs - Callback registry + Subscription         │
//! │  └── ttl.rs       - Time-to-live set                         │
//! │                                                              │
//! │  network/         - Connection Manager                       │
//! │  ├── protocol.rs  - Wire envelope and event payload          │
//! │  ├── transport.rs - Transport trait, registry, memory relay  │
//! │  ├── websocket.rs - tokio-tungstenite adapter                │
//! │  └── connection.rs- Lifecycle, backoff, heartbeat, queue     │
//! │                                                              │
//! │  events/          - Event Bridge                             │
//! │  ├── pattern.rs   - Wildcard event names                     │
//! │  ├── bus.rs       - Local publish/subscribe                  │
//! │  └── bridge.rs    - Policies, forwarding, echo suppression   │
//! │                                                              │
//! │  sync/            - State Reconciler + Coordinator           │
//! │  ├── state.rs     - Entity state, delta, wire payload        │
//! │  ├── buffer.rs    - Bounded snapshot history                 │
//! │  ├── reconciler.rs- Delta encode, rebuild, interpolation     │
//! │  └── coordinator.rs- Identity, join/leave, per-frame tick    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Data flow
//!
//! Outbound: `SyncCoordinator::tick` → `StateReconciler::update_local_state`
//! → `EventBridge::emit_local` → `ConnectionManager::send` → transport.
//!
//! Inbound: transport → `ConnectionManager::poll` → `EventBridge::handle_envelope`
//! → `EventBus` (network origin) → coordinator inbox → `StateReconciler`.
//!
//! ## Threading
//!
//! Everything is driven from the host frame loop. Nothing blocks; the
//! WebSocket transport does its I/O on a Tokio task and hands frames over
//! through channels that `poll` drains. All timers read an injected
//! [`Clock`](core::Clock).

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod config;
pub mod network;
pub mod events;
pub mod sync;

// Re-export commonly used types
pub use crate::core::{Clock, ManualClock, Millis, Quat, SharedClock, Subscription, SystemClock, Vec3};
pub use config::{ConfigError, SyncConfig};
pub use network::{ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionState, MemoryHub, TransportRegistry};
pub use events::{EventBridge, EventBus, EventPolicy, EventRecord};
pub use sync::{EntityId, EntityManager, EntityState, StatePayload, StateReconciler, SyncCoordinator};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
