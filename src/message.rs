//! # Messages
//!
//! Application-facing message type and its mapping onto the
//! [`MessagePayload`] carried by the facade. Properties travel in the payload
//! header so content filters can inspect them without decoding the body.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::destination::Destination;
use crate::errors::{BridgeError, BridgeResult};
use crate::facade::{InstanceHandle, MessagePayload, PayloadHeader};

/// Lowest message priority
pub const MIN_PRIORITY: u8 = 0;
/// Highest message priority
pub const MAX_PRIORITY: u8 = 9;
/// Priority used when none is given
pub const DEFAULT_PRIORITY: u8 = 4;

/// Delivery mode of a sent message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryMode {
    /// Delivered to currently connected consumers only
    NonPersistent,
    /// Retained for late-joining consumers
    Persistent,
}

impl DeliveryMode {
    /// Raw value of NON_PERSISTENT
    pub const NON_PERSISTENT: i32 = 1;
    /// Raw value of PERSISTENT
    pub const PERSISTENT: i32 = 2;

    /// Raw integer value
    pub fn as_raw(&self) -> i32 {
        match self {
            DeliveryMode::NonPersistent => Self::NON_PERSISTENT,
            DeliveryMode::Persistent => Self::PERSISTENT,
        }
    }
}

impl TryFrom<i32> for DeliveryMode {
    type Error = BridgeError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            Self::NON_PERSISTENT => Ok(DeliveryMode::NonPersistent),
            Self::PERSISTENT => Ok(DeliveryMode::Persistent),
            other => Err(BridgeError::IllegalArgument(format!(
                "unknown delivery mode: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryMode::NonPersistent => write!(f, "NON_PERSISTENT"),
            DeliveryMode::Persistent => write!(f, "PERSISTENT"),
        }
    }
}

/// Typed message property value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum PropertyValue {
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
}

impl PropertyValue {
    /// Numeric view, if the value is a number
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Byte(v) => Some(*v as f64),
            PropertyValue::Short(v) => Some(*v as f64),
            PropertyValue::Int(v) => Some(*v as f64),
            PropertyValue::Long(v) => Some(*v as f64),
            PropertyValue::Float(v) => Some(*v as f64),
            PropertyValue::Double(v) => Some(*v),
            PropertyValue::Boolean(_) | PropertyValue::String(_) => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Boolean(v) => write!(f, "{}", v),
            PropertyValue::Byte(v) => write!(f, "{}", v),
            PropertyValue::Short(v) => write!(f, "{}", v),
            PropertyValue::Int(v) => write!(f, "{}", v),
            PropertyValue::Long(v) => write!(f, "{}", v),
            PropertyValue::Float(v) => write!(f, "{}", v),
            PropertyValue::Double(v) => write!(f, "{}", v),
            PropertyValue::String(v) => write!(f, "'{}'", v),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Boolean(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Long(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Double(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::String(v)
    }
}

/// Message body variants
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum MessageBody {
    #[default]
    Empty,
    Text(String),
    Bytes(Vec<u8>),
    Map(BTreeMap<String, PropertyValue>),
    Stream(Vec<PropertyValue>),
    Object(serde_json::Value),
}

/// A message with its standard headers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub message_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<Destination>,
    pub destination: Option<Destination>,
    pub delivery_mode: DeliveryMode,
    priority: u8,
    /// Expiration time, milliseconds since the epoch, 0 for never
    pub expiration: i64,
    pub redelivered: bool,
    pub message_type: Option<String>,
    pub properties: BTreeMap<String, PropertyValue>,
    pub body: MessageBody,
    #[serde(skip)]
    instance_handle: Option<InstanceHandle>,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            message_id: None,
            timestamp: None,
            correlation_id: None,
            reply_to: None,
            destination: None,
            delivery_mode: DeliveryMode::Persistent,
            priority: DEFAULT_PRIORITY,
            expiration: 0,
            redelivered: false,
            message_type: None,
            properties: BTreeMap::new(),
            body: MessageBody::Empty,
            instance_handle: None,
        }
    }
}

impl Message {
    /// Create a message with the given body
    pub fn new(body: MessageBody) -> Self {
        Self {
            body,
            ..Default::default()
        }
    }

    /// Create a text message
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(MessageBody::Text(text.into()))
    }

    /// Create a bytes message
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(MessageBody::Bytes(bytes.into()))
    }

    /// Create an object message
    pub fn object(value: serde_json::Value) -> Self {
        Self::new(MessageBody::Object(value))
    }

    /// Builder-style property setter
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Set a property
    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<PropertyValue>) {
        self.properties.insert(name.into(), value.into());
    }

    /// Get a property
    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    /// Message priority, 0 (lowest) to 9 (highest)
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Set the priority; values above 9 are rejected
    pub fn set_priority(&mut self, priority: u8) -> BridgeResult<()> {
        validate_priority(priority)?;
        self.priority = priority;
        Ok(())
    }

    /// Text body, if this is a text message
    pub fn text_body(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Handle of the sample this message was built from
    pub fn instance_handle(&self) -> Option<InstanceHandle> {
        self.instance_handle
    }

    /// Encode into a payload; the ordering key is derived from the priority
    pub fn to_payload(&self) -> BridgeResult<MessagePayload> {
        let body = serde_json::to_vec(&self.body)
            .map_err(|e| BridgeError::MalformedPayload(e.to_string()))?;
        Ok(MessagePayload {
            header: PayloadHeader {
                message_id: self.message_id.clone(),
                timestamp: self.timestamp.map(|t| t.timestamp_millis()).unwrap_or(0),
                correlation_id: self.correlation_id.clone(),
                reply_to: self.reply_to.as_ref().map(|d| d.name().to_string()),
                destination: self.destination.as_ref().map(|d| d.name().to_string()),
                delivery_mode: self.delivery_mode.as_raw(),
                priority: self.priority,
                ordering_key: MAX_PRIORITY - self.priority,
                expiration: self.expiration,
                message_type: self.message_type.clone(),
                properties: self.properties.clone(),
            },
            body,
        })
    }

    /// Rebuild a delivered message from a sample payload
    ///
    /// `destination` is the consumer's destination and overrides the header
    /// so received messages always name where they were consumed from.
    pub fn from_payload(
        payload: &MessagePayload,
        handle: InstanceHandle,
        destination: &Destination,
    ) -> BridgeResult<Self> {
        let header = &payload.header;
        let body: MessageBody = serde_json::from_slice(&payload.body)
            .map_err(|e| BridgeError::MalformedPayload(e.to_string()))?;
        let delivery_mode = DeliveryMode::try_from(header.delivery_mode)
            .map_err(|e| BridgeError::MalformedPayload(e.to_string()))?;
        validate_priority(header.priority).map_err(|e| BridgeError::MalformedPayload(e.to_string()))?;

        Ok(Self {
            message_id: header.message_id.clone(),
            timestamp: match header.timestamp {
                0 => None,
                ms => Utc.timestamp_millis_opt(ms).single(),
            },
            correlation_id: header.correlation_id.clone(),
            reply_to: header.reply_to.as_deref().map(Destination::topic),
            destination: Some(destination.clone()),
            delivery_mode,
            priority: header.priority,
            expiration: header.expiration,
            redelivered: false,
            message_type: header.message_type.clone(),
            properties: header.properties.clone(),
            body,
            instance_handle: Some(handle),
        })
    }
}

/// Reject priorities outside 0..=9
pub fn validate_priority(priority: u8) -> BridgeResult<()> {
    if priority > MAX_PRIORITY {
        return Err(BridgeError::IllegalArgument(format!(
            "priority must be between {} and {}: {}",
            MIN_PRIORITY, MAX_PRIORITY, priority
        )));
    }
    Ok(())
}
