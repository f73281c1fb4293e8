//! # Session
//!
//! A session owns the acknowledgment ledger and the delivery executor shared
//! by its consumers, and creates consumers and producers on behalf of its
//! connection.
//!
//! Acknowledgment and recovery act on the whole session: `acknowledge`
//! releases every pending delivery of every consumer, `recover` hands every
//! pending delivery back to its consumer for redelivery.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::{AcknowledgeMode, SessionConfig};
use crate::connection::ConnectionInner;
use crate::consumer::{ConsumerInner, ConsumerOptions, MessageConsumer};
use crate::destination::Destination;
use crate::dispatch::DeliveryExecutor;
use crate::errors::{BridgeError, BridgeResult};
use crate::ledger::{AcknowledgmentLedger, ConsumerId, SampleHandle};
use crate::observability::{DeliveryMetrics, Logger, ObservationScope};
use crate::producer::{MessageProducer, ProducerInner, SendDefaults};

/// State shared between a session and its consumers and producers
pub(crate) struct SessionCore {
    id: u64,
    pub(crate) acknowledge_mode: AcknowledgeMode,
    pub(crate) ledger: AcknowledgmentLedger,
    pub(crate) executor: DeliveryExecutor,
    pub(crate) metrics: Arc<DeliveryMetrics>,
    consumers: Mutex<BTreeMap<ConsumerId, Arc<ConsumerInner>>>,
    producers: Mutex<BTreeMap<u64, Arc<ProducerInner>>>,
    closed: AtomicBool,
}

impl SessionCore {
    pub(crate) fn new(
        id: u64,
        acknowledge_mode: AcknowledgeMode,
        metrics: Arc<DeliveryMetrics>,
    ) -> BridgeResult<Arc<Self>> {
        let executor = DeliveryExecutor::spawn(format!("jms-session-{}", id))?;
        Ok(Arc::new(Self {
            id,
            acknowledge_mode,
            ledger: AcknowledgmentLedger::new(Arc::clone(&metrics)),
            executor,
            metrics,
            consumers: Mutex::new(BTreeMap::new()),
            producers: Mutex::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        }))
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn consumer_map(&self) -> MutexGuard<'_, BTreeMap<ConsumerId, Arc<ConsumerInner>>> {
        self.consumers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn producer_map(&self) -> MutexGuard<'_, BTreeMap<u64, Arc<ProducerInner>>> {
        self.producers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a delivery: pending in client mode, acknowledged otherwise
    pub(crate) fn settle(&self, consumer: ConsumerId, handle: SampleHandle) {
        if self.acknowledge_mode.is_client() {
            self.ledger.register(consumer, handle);
        } else {
            self.ledger.register_acknowledged(consumer, handle);
        }
    }

    pub(crate) fn remember_consumer(&self, consumer: Arc<ConsumerInner>) {
        self.consumer_map().insert(consumer.id(), consumer);
    }

    pub(crate) fn forget_consumer(&self, id: ConsumerId) {
        self.consumer_map().remove(&id);
    }

    pub(crate) fn remember_producer(&self, producer: Arc<ProducerInner>) {
        self.producer_map().insert(producer.id(), producer);
    }

    pub(crate) fn forget_producer(&self, id: u64) {
        self.producer_map().remove(&id);
    }

    /// Snapshot of the open consumers
    pub(crate) fn consumers(&self) -> Vec<Arc<ConsumerInner>> {
        self.consumer_map().values().cloned().collect()
    }

    fn consumer(&self, id: ConsumerId) -> Option<Arc<ConsumerInner>> {
        self.consumer_map().get(&id).cloned()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Set the closed flag; returns true if it was already set
    pub(crate) fn mark_closed(&self) -> bool {
        self.closed.swap(true, Ordering::SeqCst)
    }
}

/// Application handle to a session. Clones share the same session.
#[derive(Clone)]
pub struct Session {
    core: Arc<SessionCore>,
    connection: Arc<ConnectionInner>,
}

impl Session {
    pub(crate) fn new(core: Arc<SessionCore>, connection: Arc<ConnectionInner>) -> Self {
        Self { core, connection }
    }

    fn check_open(&self) -> BridgeResult<()> {
        if self.core.is_closed() {
            return Err(BridgeError::ClosedSession);
        }
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.core.id
    }

    pub fn acknowledge_mode(&self) -> AcknowledgeMode {
        self.core.acknowledge_mode
    }

    /// Settings this session was created with
    pub fn config(&self) -> SessionConfig {
        SessionConfig::new(self.core.acknowledge_mode)
    }

    /// Consumer on `destination` with default options
    pub fn create_consumer(&self, destination: &Destination) -> BridgeResult<MessageConsumer> {
        self.create_consumer_with(destination, ConsumerOptions::default())
    }

    /// Consumer with a selector and/or no-local filtering.
    ///
    /// Temporary destinations only accept consumers from the connection that
    /// created them.
    pub fn create_consumer_with(
        &self,
        destination: &Destination,
        options: ConsumerOptions,
    ) -> BridgeResult<MessageConsumer> {
        self.check_open()?;
        if let Some(owner) = destination.owner() {
            if owner != self.connection.id {
                return Err(BridgeError::InvalidDestination(format!(
                    "{} belongs to another connection",
                    destination.name()
                )));
            }
        }
        let subscriber = if options.no_local {
            Arc::clone(&self.connection.remote_subscriber)
        } else {
            Arc::clone(&self.connection.local_subscriber)
        };

        // Registration happens under the run lock so a concurrent start
        // cannot miss the new gate.
        let run = self.connection.run_state();
        if run.closed {
            return Err(BridgeError::ClosedConnection);
        }
        self.check_open()?;
        let inner = ConsumerInner::open(
            self.connection.next_consumer_id(),
            Arc::clone(&self.core),
            Arc::clone(&self.connection.participant),
            subscriber,
            destination.clone(),
            options,
            run.started,
        )?;
        self.core.remember_consumer(Arc::clone(&inner));
        drop(run);

        Ok(MessageConsumer::new(inner))
    }

    /// Producer on `destination` using the connection's send defaults
    pub fn create_producer(&self, destination: &Destination) -> BridgeResult<MessageProducer> {
        self.check_open()?;
        let config = &self.connection.config;
        let inner = ProducerInner::open(
            self.connection.next_producer_id(),
            Arc::clone(&self.core),
            self.connection.participant.as_ref(),
            Arc::clone(&self.connection.publisher),
            destination.clone(),
            SendDefaults::new(
                config.default_delivery_mode,
                config.default_priority,
                config.default_time_to_live_ms,
            ),
        )?;
        self.core.remember_producer(Arc::clone(&inner));
        Ok(MessageProducer::new(inner))
    }

    /// Uniquely named destination owned by this session's connection
    pub fn create_temporary_topic(&self) -> BridgeResult<Destination> {
        self.check_open()?;
        let destination = Destination::temporary(self.connection.id);
        destination.create_topic(self.connection.participant.as_ref())?;
        Ok(destination)
    }

    /// Acknowledge every message delivered by this session so far.
    ///
    /// Only meaningful in client mode; the automatic modes have nothing
    /// pending.
    pub fn acknowledge(&self) -> BridgeResult<()> {
        self.check_open()?;
        if !self.core.acknowledge_mode.is_client() {
            return Ok(());
        }
        let released = self.core.ledger.acknowledge_all();
        Logger::info(
            "SESSION_ACKNOWLEDGED",
            &[("session", &self.core.id.to_string()), ("released", &released.to_string())],
        );
        Ok(())
    }

    /// Redeliver every unacknowledged message of this session.
    ///
    /// No-op outside client mode.
    pub fn recover(&self) -> BridgeResult<()> {
        self.check_open()?;
        if !self.core.acknowledge_mode.is_client() {
            return Ok(());
        }
        let scope = ObservationScope::new("SESSION_RECOVER", &[("session", self.core.id.to_string())]);

        let pending = self.core.ledger.drain();
        let mut recovered = 0;
        for (id, handles) in pending {
            match self.core.consumer(id) {
                Some(consumer) => {
                    recovered += handles.len();
                    consumer.recover(handles);
                }
                None => {
                    Logger::warn(
                        "RECOVER_CONSUMER_MISSING",
                        &[("consumer", &id.to_string()), ("entries", &handles.len().to_string())],
                    );
                }
            }
        }

        scope.complete(&[("recovered", &recovered.to_string())]);
        Ok(())
    }

    /// Unacknowledged deliveries of one consumer
    pub fn pending_acknowledgments(&self, consumer: &MessageConsumer) -> usize {
        self.core.ledger.pending_count(consumer.id())
    }

    /// Unacknowledged deliveries across the session
    pub fn total_pending_acknowledgments(&self) -> usize {
        self.core.ledger.total_pending()
    }

    /// Close every consumer and producer, drop pending acknowledgments and
    /// stop the executor. Idempotent.
    pub fn close(&self) -> BridgeResult<()> {
        {
            let _run = self.connection.run_state();
            if self.core.mark_closed() {
                return Ok(());
            }
        }
        self.connection.forget_session(self.core.id);
        close_core(&self.core)
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}

/// Tear down a session whose closed flag is already set
pub(crate) fn close_core(core: &SessionCore) -> BridgeResult<()> {
    let scope = ObservationScope::new("SESSION_CLOSE", &[("session", core.id.to_string())]);
    let mut first_error = None;

    for consumer in core.consumers() {
        if let Err(e) = consumer.close() {
            first_error.get_or_insert(e);
        }
    }
    let producers: Vec<Arc<ProducerInner>> = core.producer_map().values().cloned().collect();
    for producer in producers {
        if let Err(e) = producer.close() {
            first_error.get_or_insert(e);
        }
    }

    let dropped = core.ledger.discard_all();
    core.executor.shutdown();
    scope.complete(&[("dropped_unacknowledged", &dropped.to_string())]);

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.core.id)
            .field("acknowledge_mode", &self.core.acknowledge_mode)
            .field("closed", &self.core.is_closed())
            .finish()
    }
}
