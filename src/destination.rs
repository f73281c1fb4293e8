//! # Destinations
//!
//! A destination names a topic and optionally carries reader and writer QoS
//! overrides. Destinations are immutable values; equality is by name.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::BridgeResult;
use crate::facade::{
    DataReaderQos, DataReaderQosPolicy, DataWriterQos, DataWriterQosPolicy, DomainParticipant,
    Topic,
};

/// Logical topic plus QoS override policies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Destination {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reader_policy: Option<DataReaderQosPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    writer_policy: Option<DataWriterQosPolicy>,
    /// Connection that owns a temporary destination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    owner: Option<Uuid>,
}

impl PartialEq for Destination {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Destination {}

impl Destination {
    /// A topic destination with no QoS overrides
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reader_policy: None,
            writer_policy: None,
            owner: None,
        }
    }

    /// A uniquely named destination owned by one connection
    pub(crate) fn temporary(owner: Uuid) -> Self {
        Self {
            name: format!("TemporaryTopic-{}", Uuid::new_v4()),
            reader_policy: None,
            writer_policy: None,
            owner: Some(owner),
        }
    }

    /// Attach reader QoS overrides
    pub fn with_reader_policy(mut self, policy: DataReaderQosPolicy) -> Self {
        self.reader_policy = Some(policy);
        self
    }

    /// Attach writer QoS overrides
    pub fn with_writer_policy(mut self, policy: DataWriterQosPolicy) -> Self {
        self.writer_policy = Some(policy);
        self
    }

    /// Topic name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True for temporary destinations
    pub fn is_temporary(&self) -> bool {
        self.owner.is_some()
    }

    /// Connection owning a temporary destination
    pub fn owner(&self) -> Option<Uuid> {
        self.owner
    }

    /// Reader QoS: the destination policy merged over `defaults`
    pub fn reader_qos(&self, defaults: DataReaderQos) -> DataReaderQos {
        let mut qos = defaults;
        if let Some(policy) = &self.reader_policy {
            policy.apply_to(&mut qos);
        }
        qos
    }

    /// Writer QoS: the destination policy merged over `defaults`
    pub fn writer_qos(&self, defaults: DataWriterQos) -> DataWriterQos {
        let mut qos = defaults;
        if let Some(policy) = &self.writer_policy {
            policy.apply_to(&mut qos);
        }
        qos
    }

    /// Find or create the underlying topic
    pub fn create_topic(&self, participant: &dyn DomainParticipant) -> BridgeResult<Topic> {
        Ok(participant.create_topic(&self.name)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::{DurabilityKind, HistoryKind, ReliabilityKind};

    #[test]
    fn test_equality_ignores_policies() {
        let plain = Destination::topic("orders");
        let tuned = Destination::topic("orders").with_reader_policy(DataReaderQosPolicy {
            history: Some(HistoryKind::KeepLast(1)),
            ..Default::default()
        });
        assert_eq!(plain, tuned);
        assert_ne!(plain, Destination::topic("quotes"));
    }

    #[test]
    fn test_policies_merge_over_defaults() {
        let destination = Destination::topic("orders")
            .with_writer_policy(DataWriterQosPolicy {
                reliability: Some(ReliabilityKind::BestEffort),
                ..Default::default()
            })
            .with_reader_policy(DataReaderQosPolicy {
                durability: Some(DurabilityKind::TransientLocal),
                ..Default::default()
            });

        let writer = destination.writer_qos(DataWriterQos::default());
        assert_eq!(writer.reliability, ReliabilityKind::BestEffort);
        assert_eq!(writer.durability, DurabilityKind::Volatile);

        let reader = destination.reader_qos(DataReaderQos::default());
        assert_eq!(reader.durability, DurabilityKind::TransientLocal);
    }

    #[test]
    fn test_temporary_destinations_are_unique_and_owned() {
        let owner = Uuid::new_v4();
        let a = Destination::temporary(owner);
        let b = Destination::temporary(owner);
        assert_ne!(a, b);
        assert!(a.is_temporary());
        assert_eq!(a.owner(), Some(owner));
        assert!(!Destination::topic("x").is_temporary());
    }

    #[test]
    fn test_destination_from_config_json() {
        let destination: Destination = serde_json::from_str(
            r#"{"name":"orders","writer_policy":{"durability":"TRANSIENT_LOCAL"}}"#,
        )
        .unwrap();
        assert_eq!(destination.name(), "orders");
        let qos = destination.writer_qos(DataWriterQos::default());
        assert_eq!(qos.durability, DurabilityKind::TransientLocal);
    }
}
