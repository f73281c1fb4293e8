//! # Acknowledgment Ledger
//!
//! Per-session record of delivered but unacknowledged samples, grouped by
//! consumer in delivery order.
//!
//! Acknowledging an entry takes the sample out of its reader, which releases
//! it in the facade. Entries whose sample is already gone (reader destroyed,
//! instance disposed and purged) are dropped silently.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::facade::{DataReader, InstanceHandle, StateMask};
use crate::observability::{DeliveryMetrics, Logger};

/// Identity of a consumer within its connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(pub u64);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One delivered sample: the reader it lives in and its instance handle
#[derive(Clone)]
pub struct SampleHandle {
    reader: Arc<dyn DataReader>,
    instance: InstanceHandle,
}

impl SampleHandle {
    pub fn new(reader: Arc<dyn DataReader>, instance: InstanceHandle) -> Self {
        Self { reader, instance }
    }

    pub fn reader(&self) -> &Arc<dyn DataReader> {
        &self.reader
    }

    pub fn instance(&self) -> InstanceHandle {
        self.instance
    }

    /// Take the sample out of its reader. Returns false if it was gone.
    fn release(&self) -> bool {
        match self.reader.take_instance(self.instance, StateMask::any()) {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                Logger::trace(
                    "ACKNOWLEDGE_SKIPPED",
                    &[
                        ("instance", &self.instance.to_string()),
                        ("reason", &e.to_string()),
                    ],
                );
                false
            }
        }
    }
}

impl PartialEq for SampleHandle {
    fn eq(&self, other: &Self) -> bool {
        self.reader.id() == other.reader.id() && self.instance == other.instance
    }
}

impl Eq for SampleHandle {}

impl fmt::Debug for SampleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleHandle")
            .field("reader", &self.reader.id())
            .field("instance", &self.instance)
            .finish()
    }
}

/// Delivered-but-unacknowledged samples of one session
#[derive(Debug)]
pub struct AcknowledgmentLedger {
    pending: Mutex<BTreeMap<ConsumerId, Vec<SampleHandle>>>,
    metrics: Arc<DeliveryMetrics>,
}

impl AcknowledgmentLedger {
    pub fn new(metrics: Arc<DeliveryMetrics>) -> Self {
        Self {
            pending: Mutex::new(BTreeMap::new()),
            metrics,
        }
    }

    fn pending(&self) -> MutexGuard<'_, BTreeMap<ConsumerId, Vec<SampleHandle>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a delivered sample to `consumer`'s list
    pub fn register(&self, consumer: ConsumerId, handle: SampleHandle) {
        self.pending().entry(consumer).or_default().push(handle);
    }

    /// Register and immediately acknowledge one sample, for the automatic
    /// modes. The entry never becomes visible to other ledger calls.
    pub fn register_acknowledged(&self, consumer: ConsumerId, handle: SampleHandle) {
        let released = handle.release();
        if released {
            self.metrics.add_acknowledged(1);
        }
        Logger::trace(
            "MESSAGE_ACKNOWLEDGED",
            &[
                ("consumer", &consumer.to_string()),
                ("instance", &handle.instance.to_string()),
            ],
        );
    }

    /// Acknowledge every pending entry of every consumer, in order
    ///
    /// Returns the number of samples released.
    pub fn acknowledge_all(&self) -> usize {
        let drained = std::mem::take(&mut *self.pending());
        let mut released = 0;
        for handles in drained.values() {
            released += handles.iter().filter(|h| h.release()).count();
        }
        self.metrics.add_acknowledged(released as u64);
        released
    }

    /// Remove every pending entry, grouped by consumer, without touching the
    /// samples. Used by recover.
    pub fn drain(&self) -> BTreeMap<ConsumerId, Vec<SampleHandle>> {
        std::mem::take(&mut *self.pending())
    }

    /// Drop `consumer`'s entries without acknowledging them
    pub fn discard(&self, consumer: ConsumerId) -> usize {
        let dropped = self
            .pending()
            .remove(&consumer)
            .map(|handles| handles.len())
            .unwrap_or(0);
        self.metrics.add_discarded(dropped as u64);
        dropped
    }

    /// Drop every entry without acknowledging them
    pub fn discard_all(&self) -> usize {
        let dropped: usize = self.drain().values().map(Vec::len).sum();
        self.metrics.add_discarded(dropped as u64);
        dropped
    }

    /// Pending entries of one consumer
    pub fn pending_count(&self, consumer: ConsumerId) -> usize {
        self.pending().get(&consumer).map(Vec::len).unwrap_or(0)
    }

    /// Pending entries across the session
    pub fn total_pending(&self) -> usize {
        self.pending().values().map(Vec::len).sum()
    }
}
