//! Configuration
//!
//! Each component has its own config struct with `Default` and, where it
//! makes sense, `from_env()`. [`SyncConfig`] bundles them for hosts that
//! load everything at once from the environment or a JSON document.

use std::fmt::Display;
use std::str::FromStr;
use serde::{Serialize, Deserialize};
use tracing::warn;

use crate::events::bridge::BridgeConfig;
use crate::network::connection::ConnectionConfig;
use crate::sync::coordinator::CoordinatorConfig;
use crate::sync::reconciler::ReconcilerConfig;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Document was not valid JSON for the config shape.
    #[error("invalid config document: {0}")]
    Json(#[from] serde_json::Error),

    /// A value is out of range.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// All component settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Connection Manager.
    pub connection: ConnectionConfig,
    /// Event Bridge.
    pub bridge: BridgeConfig,
    /// State Reconciler.
    pub reconciler: ReconcilerConfig,
    /// Synchronization Coordinator.
    pub coordinator: CoordinatorConfig,
}

impl SyncConfig {
    /// Read every `RUNE_SYNC_*` variable, defaulting the rest.
    pub fn from_env() -> Self {
        Self {
            connection: ConnectionConfig::from_env(),
            bridge: BridgeConfig::default(),
            reconciler: ReconcilerConfig::from_env(),
            coordinator: CoordinatorConfig::default(),
        }
    }

    /// Parse and validate a JSON document. Missing sections use defaults.
    pub fn from_json(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject values the components cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection.url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "connection.url",
                reason: "must not be empty".into(),
            });
        }
        if self.connection.transport.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "connection.transport",
                reason: "must not be empty".into(),
            });
        }
        if self.connection.max_queue_len == 0 {
            return Err(ConfigError::Invalid {
                field: "connection.max_queue_len",
                reason: "must be at least 1".into(),
            });
        }
        if self.reconciler.buffer_capacity < 2 {
            return Err(ConfigError::Invalid {
                field: "reconciler.buffer_capacity",
                reason: "interpolation needs at least 2 snapshots".into(),
            });
        }
        if self.coordinator.domain.is_empty() || self.coordinator.domain.contains('*') {
            return Err(ConfigError::Invalid {
                field: "coordinator.domain",
                reason: format!("'{}' is not a usable event prefix", self.coordinator.domain),
            });
        }
        Ok(())
    }
}

/// Parse an environment variable, warning and falling back on bad input.
pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(e) => {
                warn!("Ignoring {}={:?} ({}); using {}", key, raw, e, default);
                default
            }
        },
        Err(_) => default,
    }
}
