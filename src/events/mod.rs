//! Events
//!
//! Process-local publish/subscribe and the bridge that carries selected
//! events across the network.

pub mod pattern;
pub mod bus;
pub mod bridge;

pub use pattern::EventPattern;
pub use bus::{EventBus, EventOrigin, EventRecord};
pub use bridge::{BridgeConfig, BridgeStats, EventBridge, EventFilter, EventPolicy, generate_event_id};
