//! # Facade Value Types
//!
//! Identifiers, sample state flags and the message payload carried on a topic.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::message::PropertyValue;

/// Opaque handle of one keyed instance inside a reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceHandle(pub u64);

impl InstanceHandle {
    /// The nil handle
    pub const NIL: InstanceHandle = InstanceHandle(0);

    /// True for the nil handle
    pub fn is_nil(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a facade entity (reader, writer, publisher, subscriber)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u64);

/// Identifier of a domain participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticipantId(pub u64);

/// Identifier of a condition (guard or read condition)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConditionId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ConditionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a sample has been read through this reader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleState {
    NotRead,
    Read,
}

/// Whether the instance has been seen before by this reader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    New,
    NotNew,
}

/// Liveliness of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Alive,
    NotAliveDisposed,
    NotAliveNoWriters,
}

/// State predicate; `None` in a slot means "any"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateMask {
    pub sample: Option<SampleState>,
    pub view: Option<ViewState>,
    pub instance: Option<InstanceState>,
}

impl StateMask {
    /// Matches every sample
    pub fn any() -> Self {
        Self::default()
    }

    /// Unread samples of new, alive instances
    pub fn fresh() -> Self {
        Self {
            sample: Some(SampleState::NotRead),
            view: Some(ViewState::New),
            instance: Some(InstanceState::Alive),
        }
    }

    /// Already-read samples of known, alive instances
    pub fn redelivery() -> Self {
        Self {
            sample: Some(SampleState::Read),
            view: Some(ViewState::NotNew),
            instance: Some(InstanceState::Alive),
        }
    }

    /// Check the flags of one sample
    pub fn matches(&self, sample: SampleState, view: ViewState, instance: InstanceState) -> bool {
        self.sample.map_or(true, |s| s == sample)
            && self.view.map_or(true, |v| v == view)
            && self.instance.map_or(true, |i| i == instance)
    }
}

/// ORDER BY clause of a query condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOrder {
    /// Reception order
    Arrival,
    /// `header.ordering_key` ascending, then reception order
    OrderingKey,
}

/// Predicate of a read/query condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadQuery {
    pub mask: StateMask,
    pub order: SampleOrder,
}

impl ReadQuery {
    /// Fresh samples, highest message priority first
    pub fn fresh_by_priority() -> Self {
        Self {
            mask: StateMask::fresh(),
            order: SampleOrder::OrderingKey,
        }
    }
}

/// Header of a message payload
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PayloadHeader {
    pub message_id: Option<String>,
    /// Send time, milliseconds since the epoch
    pub timestamp: i64,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub destination: Option<String>,
    /// Raw delivery mode
    pub delivery_mode: i32,
    pub priority: u8,
    /// `9 - priority`, so ascending order delivers high priority first
    pub ordering_key: u8,
    /// Expiration time, milliseconds since the epoch, 0 for never
    pub expiration: i64,
    pub message_type: Option<String>,
    pub properties: BTreeMap<String, PropertyValue>,
}

/// The data type carried on every bridge topic
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MessagePayload {
    pub header: PayloadHeader,
    /// Encoded message body
    pub body: Vec<u8>,
}

/// Metadata delivered alongside a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleInfo {
    pub instance_handle: InstanceHandle,
    pub sample_state: SampleState,
    pub view_state: ViewState,
    pub instance_state: InstanceState,
    pub publication_participant: ParticipantId,
}

/// One sample and its metadata
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub data: MessagePayload,
    pub info: SampleInfo,
}

/// A named topic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    pub name: String,
}

/// Content filter applied by the facade when a sample reaches a reader
#[derive(Clone)]
pub struct ContentFilter {
    expression: String,
    predicate: Arc<dyn Fn(&MessagePayload) -> bool + Send + Sync>,
}

impl ContentFilter {
    /// Create a filter from its textual form and predicate
    pub fn new<F>(expression: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&MessagePayload) -> bool + Send + Sync + 'static,
    {
        Self {
            expression: expression.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Textual form
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Evaluate against a payload
    pub fn accepts(&self, payload: &MessagePayload) -> bool {
        (self.predicate)(payload)
    }
}

impl fmt::Debug for ContentFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentFilter")
            .field("expression", &self.expression)
            .finish()
    }
}
