//! Entity State
//!
//! Synchronizable state of one entity and its two wire representations:
//! a full snapshot and a field-level delta. Delta fields are present or
//! absent, never null.

use std::fmt;
use serde::{Serialize, Deserialize};
use serde_json::Value;

use crate::core::clock::Millis;
use crate::core::quat::Quat;
use crate::core::vec3::Vec3;
use crate::network::protocol::ProtocolError;

// =============================================================================
// ENTITY ID
// =============================================================================

/// Entity identifier.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Wrap an id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random (UUID v4) id.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow as `&str`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// DISCRETE FIELDS
// =============================================================================

/// Locomotion mode. Never interpolated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionMode {
    /// Standing still
    #[default]
    Idle,
    /// Walking
    Walking,
    /// Running
    Running,
    /// Airborne, going up
    Jumping,
    /// Airborne, going down
    Falling,
    /// In water
    Swimming,
}

/// Visual identity of an avatar.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Appearance {
    /// Model / skin name.
    pub model: String,
    /// Tint as `#rrggbb`.
    pub color: String,
    /// Uniform scale.
    pub scale: f32,
}

impl Default for Appearance {
    fn default() -> Self {
        Self {
            model: "default".into(),
            color: "#ffffff".into(),
            scale: 1.0,
        }
    }
}

// =============================================================================
// FULL STATE
// =============================================================================

/// Full snapshot of one entity.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityState {
    /// World position.
    pub position: Vec3,
    /// Orientation.
    pub rotation: Quat,
    /// Linear velocity.
    pub velocity: Vec3,
    /// Locomotion mode.
    pub mode: MotionMode,
    /// Standing on something.
    pub grounded: bool,
    /// Sprint modifier held.
    pub sprinting: bool,
    /// Visual identity.
    pub appearance: Appearance,
    /// Sender time of this snapshot (ms).
    pub timestamp: Millis,
}

impl EntityState {
    /// Snapshot at `position` facing `yaw`, everything else default.
    pub fn at(position: Vec3, yaw: f32) -> Self {
        Self {
            position,
            rotation: Quat::from_yaw(yaw),
            ..Self::default()
        }
    }

    /// Field-level difference from `base` to `self`.
    pub fn diff(&self, base: &EntityState) -> EntityDelta {
        fn changed<T: Clone + PartialEq>(new: &T, old: &T) -> Option<T> {
            (new != old).then(|| new.clone())
        }

        EntityDelta {
            position: changed(&self.position, &base.position),
            rotation: changed(&self.rotation, &base.rotation),
            velocity: changed(&self.velocity, &base.velocity),
            mode: changed(&self.mode, &base.mode),
            grounded: changed(&self.grounded, &base.grounded),
            sprinting: changed(&self.sprinting, &base.sprinting),
            appearance: changed(&self.appearance, &base.appearance),
            timestamp: changed(&self.timestamp, &base.timestamp),
        }
    }

    /// Overlay every field present in `delta`.
    pub fn apply(&mut self, delta: &EntityDelta) {
        if let Some(v) = delta.position {
            self.position = v;
        }
        if let Some(v) = delta.rotation {
            self.rotation = v;
        }
        if let Some(v) = delta.velocity {
            self.velocity = v;
        }
        if let Some(v) = delta.mode {
            self.mode = v;
        }
        if let Some(v) = delta.grounded {
            self.grounded = v;
        }
        if let Some(v) = delta.sprinting {
            self.sprinting = v;
        }
        if let Some(v) = &delta.appearance {
            self.appearance = v.clone();
        }
        if let Some(v) = delta.timestamp {
            self.timestamp = v;
        }
    }

    /// Copy with `delta` applied.
    pub fn with_delta(&self, delta: &EntityDelta) -> Self {
        let mut next = self.clone();
        next.apply(delta);
        next
    }
}

// =============================================================================
// DELTA
// =============================================================================

/// Fields changed since the last snapshot sent for an entity.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct EntityDelta {
    /// World position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Vec3>,
    /// Orientation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<Quat>,
    /// Linear velocity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity: Option<Vec3>,
    /// Locomotion mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<MotionMode>,
    /// Standing on something.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grounded: Option<bool>,
    /// Sprint modifier held.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sprinting: Option<bool>,
    /// Visual identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appearance: Option<Appearance>,
    /// Sender time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Millis>,
}

impl EntityDelta {
    /// True if any synchronized field changed. The timestamp alone does not count.
    pub fn has_changes(&self) -> bool {
        self.position.is_some()
            || self.rotation.is_some()
            || self.velocity.is_some()
            || self.mode.is_some()
            || self.grounded.is_some()
            || self.sprinting.is_some()
            || self.appearance.is_some()
    }

    /// True if nothing at all is present.
    pub fn is_empty(&self) -> bool {
        !self.has_changes() && self.timestamp.is_none()
    }

    /// Number of synchronized fields present.
    pub fn field_count(&self) -> usize {
        [
            self.position.is_some(),
            self.rotation.is_some(),
            self.velocity.is_some(),
            self.mode.is_some(),
            self.grounded.is_some(),
            self.sprinting.is_some(),
            self.appearance.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count()
    }
}

// =============================================================================
// WIRE PAYLOAD
// =============================================================================

/// Full or delta state as sent on the wire, tagged with `kind`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatePayload {
    /// Every field.
    Full(EntityState),
    /// Changed fields only.
    Delta(EntityDelta),
}

impl StatePayload {
    /// True for full snapshots.
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }

    /// Sender time carried by the payload, if any.
    pub fn timestamp(&self) -> Option<Millis> {
        match self {
            Self::Full(state) => Some(state.timestamp),
            Self::Delta(delta) => delta.timestamp,
        }
    }

    /// Encode as JSON value.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Decode from JSON. Payloads without a `kind` tag are classified by
    /// field presence: both `position` and `rotation` present means full.
    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let object = value
            .as_object()
            .ok_or_else(|| ProtocolError::InvalidPayload("state payload is not an object".into()))?;

        if object.contains_key("kind") {
            return Ok(serde_json::from_value(value.clone())?);
        }

        if object.contains_key("position") && object.contains_key("rotation") {
            Ok(Self::Full(serde_json::from_value(value.clone())?))
        } else {
            Ok(Self::Delta(serde_json::from_value(value.clone())?))
        }
    }

    /// Resolve against the latest known state for the entity.
    /// A delta with no base is applied onto a default snapshot.
    pub fn resolve(&self, base: Option<&EntityState>) -> EntityState {
        match self {
            Self::Full(state) => state.clone(),
            Self::Delta(delta) => base.cloned().unwrap_or_default().with_delta(delta),
        }
    }
}
