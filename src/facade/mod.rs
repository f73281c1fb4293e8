//! # Pub/Sub Facade
//!
//! The narrow surface of the underlying condition-driven publish/subscribe
//! layer that the bridge consumes. Entities are trait objects so a binding to
//! a real transport can be dropped in; [`memory`] is an in-process reference
//! implementation.
//!
//! ## Conditions
//!
//! Conditions are addressed by [`ConditionId`]. Read conditions are created
//! and deleted through the reader that owns them; guard conditions are
//! created through the participant and triggered manually. A [`WaitSet`]
//! blocks until at least one attached condition is true. Guard conditions and
//! wait-sets live until the participant deletes them.

pub mod errors;
pub mod memory;
pub mod qos;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

pub use errors::{FacadeError, FacadeErrorKind, FacadeResult};
pub use qos::{
    DataReaderQos, DataReaderQosPolicy, DataWriterQos, DataWriterQosPolicy, DurabilityKind,
    HistoryKind, ReliabilityKind,
};
pub use types::{
    ConditionId, ContentFilter, EntityId, InstanceHandle, InstanceState, MessagePayload,
    ParticipantId, PayloadHeader, ReadQuery, Sample, SampleInfo, SampleOrder, SampleState,
    StateMask, Topic, ViewState,
};

/// Entry point into one domain
pub trait DomainParticipant: Send + Sync {
    /// Participant identity, used for no-local filtering
    fn id(&self) -> ParticipantId;

    /// Find or create a topic by name
    fn create_topic(&self, name: &str) -> FacadeResult<Topic>;

    /// Create a publisher
    fn create_publisher(&self) -> FacadeResult<Arc<dyn Publisher>>;

    /// Create a subscriber; with `ignore_local` its readers never see
    /// samples published by this participant
    fn create_subscriber(&self, ignore_local: bool) -> FacadeResult<Arc<dyn Subscriber>>;

    /// Create a manually triggered condition, initially false
    fn create_guard_condition(&self) -> FacadeResult<Arc<dyn GuardCondition>>;

    /// Create an empty wait-set
    fn create_wait_set(&self) -> FacadeResult<Arc<dyn WaitSet>>;

    /// Delete a guard condition, detaching it from every wait-set
    fn delete_guard_condition(&self, condition: &dyn GuardCondition) -> FacadeResult<()>;

    /// Delete a wait-set; conditions attached to it are left alive
    fn delete_wait_set(&self, wait_set: &dyn WaitSet) -> FacadeResult<()>;

    /// Delete every entity this participant created
    fn delete_contained_entities(&self) -> FacadeResult<()>;
}

/// Owner of data writers
pub trait Publisher: Send + Sync {
    fn id(&self) -> EntityId;

    /// Default writer QoS of this publisher
    fn default_datawriter_qos(&self) -> DataWriterQos;

    fn create_datawriter(&self, topic: &Topic, qos: DataWriterQos)
        -> FacadeResult<Arc<dyn DataWriter>>;

    fn delete_datawriter(&self, writer: &dyn DataWriter) -> FacadeResult<()>;
}

/// Owner of data readers
pub trait Subscriber: Send + Sync {
    fn id(&self) -> EntityId;

    /// Default reader QoS of this subscriber
    fn default_datareader_qos(&self) -> DataReaderQos;

    fn create_datareader(
        &self,
        topic: &Topic,
        qos: DataReaderQos,
        filter: Option<ContentFilter>,
    ) -> FacadeResult<Arc<dyn DataReader>>;

    fn delete_datareader(&self, reader: &dyn DataReader) -> FacadeResult<()>;
}

/// Publishes payloads on one topic
pub trait DataWriter: Send + Sync {
    fn id(&self) -> EntityId;

    fn qos(&self) -> DataWriterQos;

    fn write(&self, payload: MessagePayload) -> FacadeResult<()>;
}

/// Push callback installed on a reader
pub trait DataReaderListener: Send + Sync {
    /// New data has arrived on `reader`
    fn on_data_available(&self, reader: &dyn DataReader);
}

/// Receives payloads from one topic
pub trait DataReader: Send + Sync {
    fn id(&self) -> EntityId;

    /// Create a query condition over this reader's samples
    fn create_read_condition(&self, query: ReadQuery) -> FacadeResult<ConditionId>;

    fn delete_read_condition(&self, condition: ConditionId) -> FacadeResult<()>;

    /// Read the first sample matching `condition`, moving it out of the
    /// unread set. `Ok(None)` when nothing matches.
    fn read_w_condition(&self, condition: ConditionId) -> FacadeResult<Option<Sample>>;

    /// Read the sample of `handle` if it matches `mask`, leaving it in the reader
    fn read_instance(&self, handle: InstanceHandle, mask: StateMask)
        -> FacadeResult<Option<Sample>>;

    /// Remove the sample of `handle` if it matches `mask`
    fn take_instance(&self, handle: InstanceHandle, mask: StateMask)
        -> FacadeResult<Option<Sample>>;

    /// Install or clear the data-available callback
    fn set_listener(&self, listener: Option<Arc<dyn DataReaderListener>>) -> FacadeResult<()>;
}

/// Manually triggered condition
pub trait GuardCondition: Send + Sync {
    fn id(&self) -> ConditionId;

    fn set_trigger_value(&self, value: bool) -> FacadeResult<()>;

    fn trigger_value(&self) -> bool;
}

/// Aggregates conditions a thread can block on
pub trait WaitSet: Send + Sync {
    fn id(&self) -> EntityId;

    fn attach_condition(&self, condition: ConditionId) -> FacadeResult<()>;

    fn detach_condition(&self, condition: ConditionId) -> FacadeResult<()>;

    /// Block until at least one attached condition is true and return the
    /// triggered ones. `None` waits forever; an elapsed timeout is reported
    /// as a [`FacadeErrorKind::Timeout`] error.
    fn wait(&self, timeout: Option<Duration>) -> FacadeResult<Vec<ConditionId>>;
}
