//! # Message Producer
//!
//! [`DualDurabilityWriter`] owns one durable and one volatile writer for a
//! destination and routes each send by delivery mode. [`MessageProducer`]
//! stamps the standard headers and writes through it.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use uuid::Uuid;

use crate::destination::Destination;
use crate::errors::{BridgeError, BridgeResult};
use crate::facade::{DataWriter, DomainParticipant, DurabilityKind, Publisher};
use crate::message::{validate_priority, DeliveryMode, Message};
use crate::observability::{DeliveryMetrics, Logger};
use crate::session::SessionCore;

/// A durable and a volatile writer for one destination
pub struct DualDurabilityWriter {
    publisher: Arc<dyn Publisher>,
    durable: Arc<dyn DataWriter>,
    volatile: Arc<dyn DataWriter>,
}

impl DualDurabilityWriter {
    /// Create both writers against the destination's topic.
    ///
    /// Writer QoS is the destination policy merged over the publisher
    /// defaults, with durability forced to PERSISTENT and VOLATILE.
    pub fn new(
        participant: &dyn DomainParticipant,
        publisher: Arc<dyn Publisher>,
        destination: &Destination,
    ) -> BridgeResult<Self> {
        let topic = destination.create_topic(participant)?;

        let mut durable_qos = destination.writer_qos(publisher.default_datawriter_qos());
        durable_qos.durability = DurabilityKind::Persistent;
        let mut volatile_qos = destination.writer_qos(publisher.default_datawriter_qos());
        volatile_qos.durability = DurabilityKind::Volatile;

        let durable = publisher.create_datawriter(&topic, durable_qos)?;
        let volatile = match publisher.create_datawriter(&topic, volatile_qos) {
            Ok(writer) => writer,
            Err(e) => {
                if let Err(cleanup) = publisher.delete_datawriter(durable.as_ref()) {
                    Logger::warn(
                        "DATA_WRITER_LEAKED",
                        &[("writer", &durable.id().to_string()), ("reason", &cleanup.to_string())],
                    );
                }
                return Err(e.into());
            }
        };

        Ok(Self {
            publisher,
            durable,
            volatile,
        })
    }

    /// Writer for a raw delivery mode value
    pub fn get_writer(&self, delivery_mode: i32) -> BridgeResult<&Arc<dyn DataWriter>> {
        DeliveryMode::try_from(delivery_mode).map(|mode| self.writer(mode))
    }

    /// Writer for a delivery mode
    pub fn writer(&self, mode: DeliveryMode) -> &Arc<dyn DataWriter> {
        match mode {
            DeliveryMode::Persistent => &self.durable,
            DeliveryMode::NonPersistent => &self.volatile,
        }
    }

    /// Delete both writers through the publisher
    pub fn destroy(self) -> BridgeResult<()> {
        let durable = self.publisher.delete_datawriter(self.durable.as_ref());
        let volatile = self.publisher.delete_datawriter(self.volatile.as_ref());
        durable?;
        volatile?;
        Ok(())
    }
}

impl fmt::Debug for DualDurabilityWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DualDurabilityWriter")
            .field("publisher", &self.publisher.id())
            .field("durable", &self.durable.id())
            .field("volatile", &self.volatile.id())
            .finish()
    }
}

/// Per-producer send defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SendDefaults {
    delivery_mode: DeliveryMode,
    priority: u8,
    time_to_live_ms: u64,
    disable_message_id: bool,
    disable_timestamp: bool,
}

impl SendDefaults {
    pub(crate) fn new(delivery_mode: DeliveryMode, priority: u8, time_to_live_ms: u64) -> Self {
        Self {
            delivery_mode,
            priority,
            time_to_live_ms,
            disable_message_id: false,
            disable_timestamp: false,
        }
    }
}

/// Application handle to a producer. Clones share the same producer.
#[derive(Clone)]
pub struct MessageProducer {
    inner: Arc<ProducerInner>,
}

pub(crate) struct ProducerInner {
    id: u64,
    destination: Destination,
    writer: Mutex<Option<DualDurabilityWriter>>,
    defaults: Mutex<SendDefaults>,
    session: Arc<SessionCore>,
    metrics: Arc<DeliveryMetrics>,
}

impl ProducerInner {
    pub(crate) fn open(
        id: u64,
        session: Arc<SessionCore>,
        participant: &dyn DomainParticipant,
        publisher: Arc<dyn Publisher>,
        destination: Destination,
        defaults: SendDefaults,
    ) -> BridgeResult<Arc<Self>> {
        validate_priority(defaults.priority)?;
        let writer = DualDurabilityWriter::new(participant, publisher, &destination)?;
        Logger::info(
            "PRODUCER_CREATED",
            &[("producer", &id.to_string()), ("destination", destination.name())],
        );
        let metrics = Arc::clone(&session.metrics);
        Ok(Arc::new(Self {
            id,
            destination,
            writer: Mutex::new(Some(writer)),
            defaults: Mutex::new(defaults),
            session,
            metrics,
        }))
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn writer(&self) -> MutexGuard<'_, Option<DualDurabilityWriter>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn defaults(&self) -> MutexGuard<'_, SendDefaults> {
        self.defaults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(
        &self,
        message: &mut Message,
        mode: DeliveryMode,
        priority: u8,
        time_to_live_ms: u64,
    ) -> BridgeResult<()> {
        if self.writer().is_none() {
            return Err(BridgeError::ClosedProducer);
        }
        validate_priority(priority)?;
        let defaults = *self.defaults();

        let now = Utc::now();
        message.destination = Some(self.destination.clone());
        message.delivery_mode = mode;
        message.set_priority(priority)?;
        message.message_id = if defaults.disable_message_id {
            None
        } else {
            Some(format!("ID:{}", Uuid::new_v4()))
        };
        message.timestamp = if defaults.disable_timestamp {
            None
        } else {
            Some(now)
        };
        message.expiration = match time_to_live_ms {
            0 => 0,
            ttl => now.timestamp_millis().saturating_add(ttl as i64),
        };
        message.redelivered = false;

        let payload = message.to_payload()?;
        let guard = self.writer();
        let writer = guard.as_ref().ok_or(BridgeError::ClosedProducer)?;
        writer.writer(mode).write(payload)?;
        drop(guard);

        self.metrics.increment_sent(mode);
        Logger::trace(
            "MESSAGE_SENT",
            &[
                ("producer", &self.id.to_string()),
                ("destination", self.destination.name()),
                ("delivery_mode", &mode.to_string()),
                ("priority", &priority.to_string()),
            ],
        );
        Ok(())
    }

    pub(crate) fn close(&self) -> BridgeResult<()> {
        let Some(writer) = self.writer().take() else {
            return Ok(());
        };
        self.session.forget_producer(self.id);
        Logger::info(
            "PRODUCER_CLOSED",
            &[("producer", &self.id.to_string()), ("destination", self.destination.name())],
        );
        writer.destroy()
    }
}

impl MessageProducer {
    pub(crate) fn new(inner: Arc<ProducerInner>) -> Self {
        Self { inner }
    }

    fn check_open(&self) -> BridgeResult<()> {
        match self.inner.writer().as_ref() {
            Some(_) => Ok(()),
            None => Err(BridgeError::ClosedProducer),
        }
    }

    /// Destination every send goes to
    pub fn destination(&self) -> &Destination {
        &self.inner.destination
    }

    /// Send with this producer's default mode, priority and time-to-live.
    ///
    /// Message id, timestamp, destination, delivery mode, priority and
    /// expiration are stamped onto `message`.
    pub fn send(&self, message: &mut Message) -> BridgeResult<()> {
        let defaults = *self.inner.defaults();
        self.inner.send(
            message,
            defaults.delivery_mode,
            defaults.priority,
            defaults.time_to_live_ms,
        )
    }

    /// Send with explicit mode, priority and time-to-live
    pub fn send_with(
        &self,
        message: &mut Message,
        mode: DeliveryMode,
        priority: u8,
        time_to_live_ms: u64,
    ) -> BridgeResult<()> {
        self.inner.send(message, mode, priority, time_to_live_ms)
    }

    pub fn delivery_mode(&self) -> BridgeResult<DeliveryMode> {
        self.check_open()?;
        Ok(self.inner.defaults().delivery_mode)
    }

    pub fn set_delivery_mode(&self, mode: DeliveryMode) -> BridgeResult<()> {
        self.check_open()?;
        self.inner.defaults().delivery_mode = mode;
        Ok(())
    }

    pub fn priority(&self) -> BridgeResult<u8> {
        self.check_open()?;
        Ok(self.inner.defaults().priority)
    }

    /// Default priority, 0 to 9
    pub fn set_priority(&self, priority: u8) -> BridgeResult<()> {
        self.check_open()?;
        validate_priority(priority)?;
        self.inner.defaults().priority = priority;
        Ok(())
    }

    pub fn time_to_live(&self) -> BridgeResult<u64> {
        self.check_open()?;
        Ok(self.inner.defaults().time_to_live_ms)
    }

    /// Default time-to-live in milliseconds, 0 for unlimited
    pub fn set_time_to_live(&self, time_to_live_ms: u64) -> BridgeResult<()> {
        self.check_open()?;
        self.inner.defaults().time_to_live_ms = time_to_live_ms;
        Ok(())
    }

    pub fn set_disable_message_id(&self, disable: bool) -> BridgeResult<()> {
        self.check_open()?;
        self.inner.defaults().disable_message_id = disable;
        Ok(())
    }

    pub fn set_disable_timestamp(&self, disable: bool) -> BridgeResult<()> {
        self.check_open()?;
        self.inner.defaults().disable_timestamp = disable;
        Ok(())
    }

    /// Destroy both writers. Idempotent.
    pub fn close(&self) -> BridgeResult<()> {
        self.inner.close()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.writer().is_none()
    }
}

impl fmt::Debug for MessageProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageProducer")
            .field("id", &self.inner.id)
            .field("destination", &self.inner.destination.name())
            .finish()
    }
}
