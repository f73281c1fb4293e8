//! Connection and Session Configuration
//!
//! Configuration is passed explicitly at construction and is immutable
//! afterwards. Both structs deserialize from JSON with defaults for every
//! omitted field.

use serde::{Deserialize, Serialize};

use crate::errors::{BridgeError, BridgeResult};
use crate::message::{DeliveryMode, DEFAULT_PRIORITY, MAX_PRIORITY};

/// When delivered messages count as consumed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AcknowledgeMode {
    /// Acknowledged as soon as receive returns or the listener returns
    Auto,
    /// Like `Auto`; duplicates are tolerated by the application
    DupsOk,
    /// Acknowledged only by an explicit session acknowledge
    Client,
}

impl AcknowledgeMode {
    /// True for the explicit, application-driven mode
    pub fn is_client(&self) -> bool {
        *self == AcknowledgeMode::Client
    }

    /// Name as used in configuration files
    pub fn as_str(&self) -> &'static str {
        match self {
            AcknowledgeMode::Auto => "auto",
            AcknowledgeMode::DupsOk => "dups-ok",
            AcknowledgeMode::Client => "client",
        }
    }
}

impl std::str::FromStr for AcknowledgeMode {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(AcknowledgeMode::Auto),
            "dups-ok" => Ok(AcknowledgeMode::DupsOk),
            "client" => Ok(AcknowledgeMode::Client),
            other => Err(BridgeError::Configuration(format!(
                "unknown acknowledge mode: {}",
                other
            ))),
        }
    }
}

/// Connection-wide settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Client identifier reported in logs
    #[serde(default)]
    pub client_id: Option<String>,

    /// Priority used by producers unless overridden (0-9)
    #[serde(default = "default_priority")]
    pub default_priority: u8,

    /// Delivery mode used by producers unless overridden
    #[serde(default = "default_delivery_mode")]
    pub default_delivery_mode: DeliveryMode,

    /// Message time-to-live in milliseconds, 0 for unlimited
    #[serde(default)]
    pub default_time_to_live_ms: u64,

    /// Start the connection on creation instead of waiting for `start()`
    #[serde(default)]
    pub start_on_create: bool,
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

fn default_delivery_mode() -> DeliveryMode {
    DeliveryMode::Persistent
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            default_priority: DEFAULT_PRIORITY,
            default_delivery_mode: DeliveryMode::Persistent,
            default_time_to_live_ms: 0,
            start_on_create: false,
        }
    }
}

impl ConnectionConfig {
    /// Parse from JSON and validate
    pub fn from_json(json: &str) -> BridgeResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| BridgeError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> BridgeResult<()> {
        if self.default_priority > MAX_PRIORITY {
            return Err(BridgeError::Configuration(format!(
                "default_priority must be at most {}: {}",
                MAX_PRIORITY, self.default_priority
            )));
        }
        if let Some(id) = &self.client_id {
            if id.trim().is_empty() {
                return Err(BridgeError::Configuration(
                    "client_id must not be blank".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Per-session settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_acknowledge_mode")]
    pub acknowledge_mode: AcknowledgeMode,
}

fn default_acknowledge_mode() -> AcknowledgeMode {
    AcknowledgeMode::Auto
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            acknowledge_mode: AcknowledgeMode::Auto,
        }
    }
}

impl SessionConfig {
    /// Session with the given acknowledgment mode
    pub fn new(acknowledge_mode: AcknowledgeMode) -> Self {
        Self { acknowledge_mode }
    }
}
