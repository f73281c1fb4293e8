//! # QoS Values and Override Policies
//!
//! Only the policies the bridge reads or overrides are modelled. A policy
//! carries optional overrides that are merged over the facade defaults.

use serde::{Deserialize, Serialize};

/// Durability QoS kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DurabilityKind {
    /// Only currently matched readers receive data
    Volatile,
    /// Data is kept by the writer for late joiners
    TransientLocal,
    /// Data outlives the writer
    Transient,
    /// Data outlives the process
    Persistent,
}

impl DurabilityKind {
    /// True if data is retained for late-joining readers
    pub fn retains_history(&self) -> bool {
        *self != DurabilityKind::Volatile
    }
}

/// Reliability QoS kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReliabilityKind {
    BestEffort,
    Reliable,
}

/// History QoS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryKind {
    /// Keep the last N samples
    KeepLast(u32),
    /// Keep everything
    KeepAll,
}

/// Data writer QoS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataWriterQos {
    pub durability: DurabilityKind,
    pub reliability: ReliabilityKind,
    pub history: HistoryKind,
    pub transport_priority: i32,
}

impl Default for DataWriterQos {
    fn default() -> Self {
        Self {
            durability: DurabilityKind::Volatile,
            reliability: ReliabilityKind::Reliable,
            history: HistoryKind::KeepAll,
            transport_priority: 0,
        }
    }
}

/// Data reader QoS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataReaderQos {
    pub durability: DurabilityKind,
    pub reliability: ReliabilityKind,
    pub history: HistoryKind,
}

impl Default for DataReaderQos {
    fn default() -> Self {
        Self {
            durability: DurabilityKind::Volatile,
            reliability: ReliabilityKind::Reliable,
            history: HistoryKind::KeepAll,
        }
    }
}

/// Writer-side overrides attached to a destination
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataWriterQosPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durability: Option<DurabilityKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reliability: Option<ReliabilityKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<HistoryKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_priority: Option<i32>,
}

impl DataWriterQosPolicy {
    /// Merge the overrides over `qos`
    pub fn apply_to(&self, qos: &mut DataWriterQos) {
        if let Some(durability) = self.durability {
            qos.durability = durability;
        }
        if let Some(reliability) = self.reliability {
            qos.reliability = reliability;
        }
        if let Some(history) = self.history {
            qos.history = history;
        }
        if let Some(priority) = self.transport_priority {
            qos.transport_priority = priority;
        }
    }
}

/// Reader-side overrides attached to a destination
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataReaderQosPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durability: Option<DurabilityKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reliability: Option<ReliabilityKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<HistoryKind>,
}

impl DataReaderQosPolicy {
    /// Merge the overrides over `qos`
    pub fn apply_to(&self, qos: &mut DataReaderQos) {
        if let Some(durability) = self.durability {
            qos.durability = durability;
        }
        if let Some(reliability) = self.reliability {
            qos.reliability = reliability;
        }
        if let Some(history) = self.history {
            qos.history = history;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_policy_keeps_defaults() {
        let mut qos = DataWriterQos::default();
        DataWriterQosPolicy::default().apply_to(&mut qos);
        assert_eq!(qos, DataWriterQos::default());
    }

    #[test]
    fn test_policy_overrides_only_set_fields() {
        let policy = DataReaderQosPolicy {
            durability: Some(DurabilityKind::TransientLocal),
            ..Default::default()
        };
        let mut qos = DataReaderQos::default();
        policy.apply_to(&mut qos);
        assert_eq!(qos.durability, DurabilityKind::TransientLocal);
        assert_eq!(qos.reliability, ReliabilityKind::Reliable);
    }

    #[test]
    fn test_policy_deserializes_from_json() {
        let policy: DataWriterQosPolicy =
            serde_json::from_str(r#"{"durability":"PERSISTENT","transport_priority":3}"#).unwrap();
        assert_eq!(policy.durability, Some(DurabilityKind::Persistent));
        assert_eq!(policy.transport_priority, Some(3));
        assert!(policy.history.is_none());
    }

    #[test]
    fn test_only_volatile_drops_history() {
        assert!(!DurabilityKind::Volatile.retains_history());
        assert!(DurabilityKind::TransientLocal.retains_history());
        assert!(DurabilityKind::Persistent.retains_history());
    }
}
