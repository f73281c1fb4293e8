//! # Connection
//!
//! A connection wraps one domain participant. It owns the publisher shared by
//! all producers and two subscribers: a local one that sees everything and a
//! remote one that ignores samples published through this connection (used
//! by no-local consumers).
//!
//! Delivery is held back until `start()`: every consumer gate created by the
//! connection follows its started flag.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use crate::config::{ConnectionConfig, SessionConfig};
use crate::errors::{BridgeError, BridgeResult};
use crate::facade::{DomainParticipant, Publisher, Subscriber};
use crate::ledger::ConsumerId;
use crate::observability::{DeliveryMetrics, Logger, MetricsSnapshot, ObservationScope};
use crate::session::{close_core, Session, SessionCore};

#[derive(Debug, Default)]
pub(crate) struct RunState {
    pub(crate) started: bool,
    pub(crate) closed: bool,
}

pub(crate) struct ConnectionInner {
    pub(crate) id: Uuid,
    pub(crate) config: ConnectionConfig,
    pub(crate) participant: Arc<dyn DomainParticipant>,
    pub(crate) publisher: Arc<dyn Publisher>,
    pub(crate) local_subscriber: Arc<dyn Subscriber>,
    pub(crate) remote_subscriber: Arc<dyn Subscriber>,
    metrics: Arc<DeliveryMetrics>,
    run: Mutex<RunState>,
    sessions: Mutex<BTreeMap<u64, Arc<SessionCore>>>,
    next_id: AtomicU64,
}

impl ConnectionInner {
    pub(crate) fn run_state(&self) -> MutexGuard<'_, RunState> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session_map(&self) -> MutexGuard<'_, BTreeMap<u64, Arc<SessionCore>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_consumer_id(&self) -> ConsumerId {
        ConsumerId(self.next_id())
    }

    pub(crate) fn next_producer_id(&self) -> u64 {
        self.next_id()
    }

    pub(crate) fn forget_session(&self, id: u64) {
        self.session_map().remove(&id);
    }
}

/// Application handle to a connection. Clones share the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Open a connection over `participant`
    pub fn new(participant: Arc<dyn DomainParticipant>, config: ConnectionConfig) -> BridgeResult<Self> {
        config.validate()?;
        let publisher = participant.create_publisher()?;
        let local_subscriber = participant.create_subscriber(false)?;
        let remote_subscriber = participant.create_subscriber(true)?;

        let id = Uuid::new_v4();
        Logger::info(
            "CONNECTION_OPENED",
            &[
                ("connection", &id.to_string()),
                ("client_id", config.client_id.as_deref().unwrap_or("")),
            ],
        );

        let started = config.start_on_create;
        Ok(Self {
            inner: Arc::new(ConnectionInner {
                id,
                config,
                participant,
                publisher,
                local_subscriber,
                remote_subscriber,
                metrics: Arc::new(DeliveryMetrics::new()),
                run: Mutex::new(RunState {
                    started,
                    closed: false,
                }),
                sessions: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    fn check_open(&self) -> BridgeResult<()> {
        if self.inner.run_state().closed {
            return Err(BridgeError::ClosedConnection);
        }
        Ok(())
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn client_id(&self) -> Option<&str> {
        self.inner.config.client_id.as_deref()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Create a session with its own ledger and executor
    pub fn create_session(&self, config: SessionConfig) -> BridgeResult<Session> {
        let run = self.inner.run_state();
        if run.closed {
            return Err(BridgeError::ClosedConnection);
        }
        let core = SessionCore::new(
            self.inner.next_id(),
            config.acknowledge_mode,
            Arc::clone(&self.inner.metrics),
        )?;
        self.inner.session_map().insert(core.id(), Arc::clone(&core));
        drop(run);

        Logger::info(
            "SESSION_CREATED",
            &[
                ("connection", &self.inner.id.to_string()),
                ("session", &core.id().to_string()),
                ("acknowledge_mode", config.acknowledge_mode.as_str()),
            ],
        );
        Ok(Session::new(core, Arc::clone(&self.inner)))
    }

    /// Open every consumer gate and push waiting messages to listeners
    pub fn start(&self) -> BridgeResult<()> {
        let consumers = {
            let mut run = self.inner.run_state();
            if run.closed {
                return Err(BridgeError::ClosedConnection);
            }
            run.started = true;
            let consumers: Vec<_> = self
                .inner
                .session_map()
                .values()
                .flat_map(|session| session.consumers())
                .collect();
            for consumer in &consumers {
                consumer.gate().start();
            }
            consumers
        };

        Logger::info("CONNECTION_STARTED", &[("connection", &self.inner.id.to_string())]);
        for consumer in &consumers {
            consumer.pump();
        }
        Ok(())
    }

    /// Hold delivery until the next `start`. Receives already past the gate
    /// finish normally.
    pub fn stop(&self) -> BridgeResult<()> {
        let mut run = self.inner.run_state();
        if run.closed {
            return Err(BridgeError::ClosedConnection);
        }
        run.started = false;
        for session in self.inner.session_map().values() {
            for consumer in session.consumers() {
                consumer.gate().stop();
            }
        }
        drop(run);

        Logger::info("CONNECTION_STOPPED", &[("connection", &self.inner.id.to_string())]);
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.inner.run_state().started
    }

    /// Delivery counters of every session of this connection
    pub fn metrics(&self) -> BridgeResult<MetricsSnapshot> {
        self.check_open()?;
        Ok(self.inner.metrics.snapshot())
    }

    /// Close every session, then delete the facade entities. Idempotent.
    pub fn close(&self) -> BridgeResult<()> {
        {
            let mut run = self.inner.run_state();
            if run.closed {
                return Ok(());
            }
            run.closed = true;
            run.started = false;
        }
        let scope = ObservationScope::new("CONNECTION_CLOSE", &[("connection", self.inner.id.to_string())]);

        let sessions: Vec<Arc<SessionCore>> =
            std::mem::take(&mut *self.inner.session_map()).into_values().collect();
        let mut first_error = None;
        for session in &sessions {
            if session.mark_closed() {
                continue;
            }
            if let Err(e) = close_core(session) {
                first_error.get_or_insert(e);
            }
        }

        if let Err(e) = self.inner.participant.delete_contained_entities() {
            first_error.get_or_insert(e.into());
        }
        scope.complete(&[("sessions", &sessions.len().to_string())]);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.run_state().closed
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("client_id", &self.inner.config.client_id)
            .finish()
    }
}
