//! Core primitives.
//!
//! Math types for synchronized state, the injectable clock that drives every
//! timer, and the small containers (listener registry, TTL set) the
//! components are built from.

pub mod vec3;
pub mod quat;
pub mod clock;
pub mod listeners;
pub mod ttl;

// Re-export core types
pub use vec3::Vec3;
pub use quat::Quat;
pub use clock::{Clock, ManualClock, Millis, SharedClock, SystemClock, system_clock};
pub use listeners::{Listeners, Subscription};
pub use ttl::TtlSet;
