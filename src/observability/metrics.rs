//! Delivery metrics
//!
//! - Counters only, monotonic
//! - Relaxed atomics; exactness per counter, no cross-counter consistency

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::message::DeliveryMode;

/// Counters shared by every session of one connection
#[derive(Debug, Default)]
pub struct DeliveryMetrics {
    /// Messages returned by receive calls
    messages_received: AtomicU64,
    /// Messages redelivered after recover
    messages_redelivered: AtomicU64,
    /// Messages handed to listeners
    messages_dispatched: AtomicU64,
    /// Samples released by acknowledgment
    messages_acknowledged: AtomicU64,
    /// Ledger entries dropped when a consumer or session closed
    acknowledgments_discarded: AtomicU64,
    /// Persistent sends
    persistent_sent: AtomicU64,
    /// Non-persistent sends
    non_persistent_sent: AtomicU64,
    /// Receives that returned nothing because the wait elapsed
    receive_timeouts: AtomicU64,
    /// Receives cut short by close
    receives_cancelled: AtomicU64,
}

impl DeliveryMetrics {
    /// Create a registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_redelivered(&self) {
        self.messages_redelivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_dispatched(&self) {
        self.messages_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_acknowledged(&self, count: u64) {
        self.messages_acknowledged.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_discarded(&self, count: u64) {
        self.acknowledgments_discarded.fetch_add(count, Ordering::Relaxed);
    }

    /// Count one send in the given delivery mode
    pub fn increment_sent(&self, mode: DeliveryMode) {
        let counter = match mode {
            DeliveryMode::Persistent => &self.persistent_sent,
            DeliveryMode::NonPersistent => &self.non_persistent_sent,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_timeouts(&self) {
        self.receive_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_cancelled(&self) {
        self.receives_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_redelivered: self.messages_redelivered.load(Ordering::Relaxed),
            messages_dispatched: self.messages_dispatched.load(Ordering::Relaxed),
            messages_acknowledged: self.messages_acknowledged.load(Ordering::Relaxed),
            acknowledgments_discarded: self.acknowledgments_discarded.load(Ordering::Relaxed),
            persistent_sent: self.persistent_sent.load(Ordering::Relaxed),
            non_persistent_sent: self.non_persistent_sent.load(Ordering::Relaxed),
            receive_timeouts: self.receive_timeouts.load(Ordering::Relaxed),
            receives_cancelled: self.receives_cancelled.load(Ordering::Relaxed),
        }
    }
}

/// Serializable copy of [`DeliveryMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub messages_redelivered: u64,
    pub messages_dispatched: u64,
    pub messages_acknowledged: u64,
    pub acknowledgments_discarded: u64,
    pub persistent_sent: u64,
    pub non_persistent_sent: u64,
    pub receive_timeouts: u64,
    pub receives_cancelled: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_new_registry_is_zero() {
        assert_eq!(DeliveryMetrics::new().snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_sent_counts_split_by_mode() {
        let metrics = DeliveryMetrics::new();
        metrics.increment_sent(DeliveryMode::Persistent);
        metrics.increment_sent(DeliveryMode::Persistent);
        metrics.increment_sent(DeliveryMode::NonPersistent);
        let snap = metrics.snapshot();
        assert_eq!(snap.persistent_sent, 2);
        assert_eq!(snap.non_persistent_sent, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = DeliveryMetrics::new();
        metrics.add_acknowledged(3);
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["messages_acknowledged"], 3);
    }

    #[test]
    fn test_thread_safety() {
        let metrics = Arc::new(DeliveryMetrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = Arc::clone(&metrics);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        m.increment_received();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(metrics.snapshot().messages_received, 8000);
    }
}
