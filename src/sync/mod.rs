//! State Synchronization
//!
//! Entity state, its wire forms, the per-entity snapshot buffer, the
//! reconciler that owns them, and the per-domain coordinator on top.

pub mod state;
pub mod buffer;
pub mod reconciler;
pub mod coordinator;

pub use state::{Appearance, EntityDelta, EntityId, EntityState, MotionMode, StatePayload};
pub use buffer::{Bracket, BufferedState, StateBuffer};
pub use reconciler::{interpolate, ReconcilerConfig, StateReconciler, StateUpdate};
pub use coordinator::{CoordinatorConfig, EntityManager, RemoteStatus, SyncCoordinator};
