//! Protocol Messages
//!
//! Wire format between peers. Every frame on the transport is one JSON
//! [`Envelope`]; event-bridge traffic rides inside envelopes of type
//! [`message_types::EVENT`] as an [`EventPayload`].

use serde::{Serialize, Deserialize};
use serde_json::{Map, Value};

use crate::core::clock::Millis;

/// Reserved envelope types.
pub mod message_types {
    /// Heartbeat. Carries no data and is never surfaced to the application.
    pub const PING: &str = "ping";
    /// Event bridge payload.
    pub const EVENT: &str = "event";
}

/// Prefix marking an event-data key as process-internal.
pub const INTERNAL_FIELD_PREFIX: char = '_';

/// Protocol errors. A bad frame from a peer is skipped, never fatal.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Frame was not valid JSON for the expected shape.
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    /// Envelope carried a different type than expected.
    #[error("unexpected message type: expected {expected}, got {actual}")]
    UnexpectedType {
        /// Type the caller asked for.
        expected: &'static str,
        /// Type found on the wire.
        actual: String,
    },

    /// A required field was absent.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// Payload had the right shape but unusable content.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

// =============================================================================
// ENVELOPE
// =============================================================================

/// Outer frame: `{ type, data, timestamp }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type (`"ping"`, `"event"`, or application-defined).
    #[serde(rename = "type")]
    pub msg_type: String,
    /// Message body.
    #[serde(default = "empty_object")]
    pub data: Value,
    /// Sender's clock when the frame was built (ms).
    #[serde(default)]
    pub timestamp: Millis,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Envelope {
    /// Build an envelope.
    pub fn new(msg_type: impl Into<String>, data: Value, timestamp: Millis) -> Self {
        Self {
            msg_type: msg_type.into(),
            data,
            timestamp,
        }
    }

    /// Heartbeat frame.
    pub fn ping(timestamp: Millis) -> Self {
        Self::new(message_types::PING, empty_object(), timestamp)
    }

    /// True for heartbeat frames.
    pub fn is_ping(&self) -> bool {
        self.msg_type == message_types::PING
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(s)?)
    }
}

// =============================================================================
// EVENT PAYLOAD
// =============================================================================

/// Event bridge body: `{ name, data, id, timestamp }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    /// Event name, e.g. `player.state`.
    pub name: String,
    /// Event data with internal fields stripped.
    #[serde(default = "empty_object")]
    pub data: Value,
    /// Emission id used for echo suppression.
    pub id: String,
    /// Emission time (ms).
    #[serde(default)]
    pub timestamp: Millis,
}

impl EventPayload {
    /// Build a payload, stripping internal fields from `data`.
    pub fn new(name: impl Into<String>, data: &Value, id: impl Into<String>, timestamp: Millis) -> Self {
        Self {
            name: name.into(),
            data: strip_internal_fields(data),
            id: id.into(),
            timestamp,
        }
    }

    /// Wrap in an `"event"` envelope.
    pub fn into_envelope(self) -> Result<Envelope, serde_json::Error> {
        let timestamp = self.timestamp;
        Ok(Envelope::new(message_types::EVENT, serde_json::to_value(self)?, timestamp))
    }

    /// Unwrap from an `"event"` envelope.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        if envelope.msg_type != message_types::EVENT {
            return Err(ProtocolError::UnexpectedType {
                expected: message_types::EVENT,
                actual: envelope.msg_type.clone(),
            });
        }
        let payload: EventPayload = serde_json::from_value(envelope.data.clone())?;
        if payload.name.is_empty() {
            return Err(ProtocolError::MissingField("name"));
        }
        if payload.id.is_empty() {
            return Err(ProtocolError::MissingField("id"));
        }
        Ok(payload)
    }
}

/// Remove top-level object keys beginning with `_`. Non-objects pass through.
pub fn strip_internal_fields(data: &Value) -> Value {
    match data {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !k.starts_with(INTERNAL_FIELD_PREFIX))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}
