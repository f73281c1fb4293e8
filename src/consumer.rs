//! # Message Consumer
//!
//! Bridges the blocking and push-style receive API onto a data reader.
//!
//! Every consumer owns one reader, one wait-set and two guard conditions
//! attached to it for the consumer's whole life: the close token and the
//! backlog signal, which is raised while messages meant for a removed listener
//! wait for a receive. A synchronous receive attaches a fresh query condition
//! next to them, waits, and detaches it again before returning.
//!
//! ## Receive Path
//!
//! ```text
//! gate.lock -> await_start -> notify_busy
//!     -> recovery queue (re-read with redelivered = true)
//!     -> undelivered queue (listener removed before the message ran)
//!     -> ephemeral query condition -> wait -> read -> settle
//! ```
//!
//! Settling hands the sample to the session ledger: kept pending in client
//! mode, taken immediately otherwise.
//!
//! ## Close
//!
//! Close triggers the token first so blocked waits return, then releases the
//! gate (which waits for in-flight reads), and only then destroys the reader,
//! the wait-set and the token.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use crate::destination::Destination;
use crate::dispatch::{DispatchTask, MessageListener};
use crate::errors::{BridgeError, BridgeResult};
use crate::facade::{
    ConditionId, DataReader, DataReaderListener, DomainParticipant, FacadeResult, GuardCondition,
    ReadQuery, Sample, StateMask, Subscriber, WaitSet,
};
use crate::gate::DeliveryGate;
use crate::ledger::{ConsumerId, SampleHandle};
use crate::message::Message;
use crate::observability::{Logger, ObservationScope};
use crate::selector::MessageSelector;
use crate::session::SessionCore;

/// Creation options of a consumer
#[derive(Debug, Clone, Default)]
pub struct ConsumerOptions {
    /// Only deliver messages whose properties match
    pub selector: Option<MessageSelector>,
    /// Skip messages published through the same connection
    pub no_local: bool,
}

impl ConsumerOptions {
    pub fn with_selector(mut self, selector: MessageSelector) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn with_no_local(mut self, no_local: bool) -> Self {
        self.no_local = no_local;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsumerState {
    Open,
    Closed,
}

/// How long a receive may block
#[derive(Debug, Clone, Copy)]
enum Wait {
    Forever,
    Until(Instant),
    Immediate,
}

impl Wait {
    fn remaining(&self) -> Option<Duration> {
        match self {
            Wait::Forever => None,
            Wait::Until(deadline) => Some(deadline.saturating_duration_since(Instant::now())),
            Wait::Immediate => Some(Duration::ZERO),
        }
    }
}

/// Application handle to a consumer. Clones share the same consumer.
#[derive(Clone)]
pub struct MessageConsumer {
    inner: Arc<ConsumerInner>,
}

pub(crate) struct ConsumerInner {
    id: ConsumerId,
    destination: Destination,
    selector: Option<MessageSelector>,
    no_local: bool,
    participant: Arc<dyn DomainParticipant>,
    subscriber: Arc<dyn Subscriber>,
    reader: Arc<dyn DataReader>,
    wait_set: Arc<dyn WaitSet>,
    close_token: Arc<dyn GuardCondition>,
    /// Triggered while `undelivered` is non-empty
    backlog: Arc<dyn GuardCondition>,
    gate: DeliveryGate,
    session: Arc<SessionCore>,
    state: Mutex<ConsumerState>,
    listener: RwLock<Option<Arc<dyn MessageListener>>>,
    recovery: Mutex<VecDeque<SampleHandle>>,
    /// Dispatched to a listener that was removed before the task ran
    undelivered: Mutex<VecDeque<(SampleHandle, Message)>>,
    pump: Mutex<()>,
}

/// Query condition attached to the wait-set for one receive.
/// Detached and deleted on drop.
struct EphemeralCondition<'a> {
    reader: &'a dyn DataReader,
    wait_set: &'a dyn WaitSet,
    id: ConditionId,
}

impl<'a> EphemeralCondition<'a> {
    fn attach(reader: &'a dyn DataReader, wait_set: &'a dyn WaitSet) -> BridgeResult<Self> {
        let id = reader.create_read_condition(ReadQuery::fresh_by_priority())?;
        if let Err(e) = wait_set.attach_condition(id) {
            if let Err(cleanup) = reader.delete_read_condition(id) {
                Logger::warn(
                    "READ_CONDITION_LEAKED",
                    &[("condition", &id.to_string()), ("reason", &cleanup.to_string())],
                );
            }
            return Err(BridgeError::AttachFailure(e.to_string()));
        }
        Ok(Self {
            reader,
            wait_set,
            id,
        })
    }
}

impl Drop for EphemeralCondition<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.wait_set.detach_condition(self.id) {
            Logger::trace(
                "READ_CONDITION_DETACH_FAILED",
                &[("condition", &self.id.to_string()), ("reason", &e.to_string())],
            );
        }
        if let Err(e) = self.reader.delete_read_condition(self.id) {
            Logger::trace(
                "READ_CONDITION_DELETE_FAILED",
                &[("condition", &self.id.to_string()), ("reason", &e.to_string())],
            );
        }
    }
}

/// Create a consumer's wait-set with the close token attached first and the
/// backlog signal second. Anything created is deleted again on failure.
fn create_signals(
    participant: &dyn DomainParticipant,
) -> FacadeResult<(Arc<dyn WaitSet>, Arc<dyn GuardCondition>, Arc<dyn GuardCondition>)> {
    let wait_set = participant.create_wait_set()?;
    let close_token = match attach_guard(participant, wait_set.as_ref()) {
        Ok(token) => token,
        Err(e) => {
            delete_wait_set(participant, wait_set.as_ref());
            return Err(e);
        }
    };
    match attach_guard(participant, wait_set.as_ref()) {
        Ok(backlog) => Ok((wait_set, close_token, backlog)),
        Err(e) => {
            delete_guard(participant, close_token.as_ref());
            delete_wait_set(participant, wait_set.as_ref());
            Err(e)
        }
    }
}

fn attach_guard(
    participant: &dyn DomainParticipant,
    wait_set: &dyn WaitSet,
) -> FacadeResult<Arc<dyn GuardCondition>> {
    let guard = participant.create_guard_condition()?;
    let attached = guard
        .set_trigger_value(false)
        .and_then(|()| wait_set.attach_condition(guard.id()));
    match attached {
        Ok(()) => Ok(guard),
        Err(e) => {
            delete_guard(participant, guard.as_ref());
            Err(e)
        }
    }
}

fn delete_guard(participant: &dyn DomainParticipant, guard: &dyn GuardCondition) {
    if let Err(e) = participant.delete_guard_condition(guard) {
        Logger::warn(
            "GUARD_CONDITION_LEAKED",
            &[("condition", &guard.id().to_string()), ("reason", &e.to_string())],
        );
    }
}

fn delete_wait_set(participant: &dyn DomainParticipant, wait_set: &dyn WaitSet) {
    if let Err(e) = participant.delete_wait_set(wait_set) {
        Logger::warn(
            "WAIT_SET_LEAKED",
            &[("wait_set", &wait_set.id().to_string()), ("reason", &e.to_string())],
        );
    }
}

/// Forwards data-available callbacks to the consumer's listener pump
struct ConsumerReaderListener {
    consumer: Weak<ConsumerInner>,
}

impl DataReaderListener for ConsumerReaderListener {
    fn on_data_available(&self, _reader: &dyn DataReader) {
        if let Some(consumer) = self.consumer.upgrade() {
            consumer.pump();
        }
    }
}

impl MessageConsumer {
    pub(crate) fn new(inner: Arc<ConsumerInner>) -> Self {
        Self { inner }
    }

    /// Consumer identity within its connection
    pub fn id(&self) -> ConsumerId {
        self.inner.id
    }

    /// Destination this consumer reads from
    pub fn destination(&self) -> &Destination {
        &self.inner.destination
    }

    /// True when messages published through the same connection are skipped
    pub fn no_local(&self) -> bool {
        self.inner.no_local
    }

    /// Block until a message arrives or the consumer is closed.
    /// `Ok(None)` means the consumer was closed while waiting.
    pub fn receive(&self) -> BridgeResult<Option<Message>> {
        self.inner.check_open()?;
        self.inner.recover_or_receive(Wait::Forever)
    }

    /// Receive with a timeout in milliseconds; 0 waits forever and negative
    /// values are rejected. `Ok(None)` on timeout or close.
    pub fn receive_timeout(&self, timeout_ms: i64) -> BridgeResult<Option<Message>> {
        self.inner.check_open()?;
        let wait = match timeout_ms {
            ms if ms < 0 => {
                return Err(BridgeError::IllegalArgument(format!(
                    "The timeout specified is negative: {}",
                    ms
                )))
            }
            0 => Wait::Forever,
            ms => Wait::Until(Instant::now() + Duration::from_millis(ms as u64)),
        };
        self.inner.recover_or_receive(wait)
    }

    /// Return a message only if one is available right now
    pub fn receive_no_wait(&self) -> BridgeResult<Option<Message>> {
        self.inner.check_open()?;
        self.inner.recover_or_receive(Wait::Immediate)
    }

    /// Install or remove the asynchronous listener.
    ///
    /// Messages already waiting in the reader are pushed to a new listener
    /// right away if the connection is started.
    pub fn set_message_listener(&self, listener: Option<Arc<dyn MessageListener>>) -> BridgeResult<()> {
        let state = self.inner.state();
        if *state == ConsumerState::Closed {
            return Err(BridgeError::ClosedConsumer);
        }
        let installing = listener.is_some();
        *self
            .inner
            .listener
            .write()
            .unwrap_or_else(PoisonError::into_inner) = listener;

        if installing {
            let callback: Arc<dyn DataReaderListener> = Arc::new(ConsumerReaderListener {
                consumer: Arc::downgrade(&self.inner),
            });
            self.inner.reader.set_listener(Some(callback))?;
            drop(state);
            self.inner.pump();
        } else {
            self.inner.reader.set_listener(None)?;
        }
        Ok(())
    }

    /// The installed listener, if any
    pub fn message_listener(&self) -> BridgeResult<Option<Arc<dyn MessageListener>>> {
        self.inner.check_open()?;
        Ok(self.inner.current_listener())
    }

    /// Selector expression this consumer was created with
    pub fn message_selector(&self) -> BridgeResult<Option<String>> {
        self.inner.check_open()?;
        Ok(self.inner.selector.as_ref().map(|s| s.to_string()))
    }

    /// Close the consumer. Idempotent.
    ///
    /// Blocked receives return `Ok(None)`. Unacknowledged client-mode
    /// deliveries of this consumer are dropped from the session ledger
    /// without being acknowledged.
    pub fn close(&self) -> BridgeResult<()> {
        self.inner.close()
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.state() == ConsumerState::Closed
    }
}

impl fmt::Debug for MessageConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageConsumer")
            .field("id", &self.inner.id)
            .field("destination", &self.inner.destination.name())
            .field("selector", &self.inner.selector)
            .field("no_local", &self.inner.no_local)
            .finish()
    }
}

impl ConsumerInner {
    /// Create the reader, wait-set and close token of a new consumer
    pub(crate) fn open(
        id: ConsumerId,
        session: Arc<SessionCore>,
        participant: Arc<dyn DomainParticipant>,
        subscriber: Arc<dyn Subscriber>,
        destination: Destination,
        options: ConsumerOptions,
        started: bool,
    ) -> BridgeResult<Arc<Self>> {
        let topic = destination.create_topic(participant.as_ref())?;
        let qos = destination.reader_qos(subscriber.default_datareader_qos());
        let filter = options.selector.as_ref().map(MessageSelector::to_content_filter);
        let reader = subscriber.create_datareader(&topic, qos, filter)?;

        let (wait_set, close_token, backlog) = match create_signals(participant.as_ref()) {
            Ok(signals) => signals,
            Err(e) => {
                if let Err(cleanup) = subscriber.delete_datareader(reader.as_ref()) {
                    Logger::warn(
                        "DATA_READER_LEAKED",
                        &[("reader", &reader.id().to_string()), ("reason", &cleanup.to_string())],
                    );
                }
                return Err(BridgeError::AttachFailure(e.to_string()));
            }
        };

        Logger::info(
            "CONSUMER_CREATED",
            &[
                ("consumer", &id.to_string()),
                ("destination", destination.name()),
                ("no_local", &options.no_local.to_string()),
                (
                    "selector",
                    &options.selector.as_ref().map(|s| s.to_string()).unwrap_or_default(),
                ),
            ],
        );

        Ok(Arc::new(Self {
            id,
            destination,
            selector: options.selector,
            no_local: options.no_local,
            participant,
            subscriber,
            reader,
            wait_set,
            close_token,
            backlog,
            gate: DeliveryGate::new(started),
            session,
            state: Mutex::new(ConsumerState::Open),
            listener: RwLock::new(None),
            recovery: Mutex::new(VecDeque::new()),
            undelivered: Mutex::new(VecDeque::new()),
            pump: Mutex::new(()),
        }))
    }

    pub(crate) fn id(&self) -> ConsumerId {
        self.id
    }

    pub(crate) fn gate(&self) -> &DeliveryGate {
        &self.gate
    }

    fn state(&self) -> MutexGuard<'_, ConsumerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn recovery_queue(&self) -> MutexGuard<'_, VecDeque<SampleHandle>> {
        self.recovery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn undelivered_queue(&self) -> MutexGuard<'_, VecDeque<(SampleHandle, Message)>> {
        self.undelivered.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_open(&self) -> BridgeResult<()> {
        match *self.state() {
            ConsumerState::Open => Ok(()),
            ConsumerState::Closed => Err(BridgeError::ClosedConsumer),
        }
    }

    fn current_listener(&self) -> Option<Arc<dyn MessageListener>> {
        self.listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn recover_or_receive(&self, wait: Wait) -> BridgeResult<Option<Message>> {
        let gate = self.gate.lock();
        let started = match wait {
            Wait::Forever => gate.await_start().map(|()| true),
            Wait::Until(deadline) => gate.await_start_until(deadline),
            Wait::Immediate => gate.await_start_until(Instant::now()),
        };
        match started {
            Ok(true) => {}
            Ok(false) => {
                self.session.metrics.increment_timeouts();
                return Ok(None);
            }
            Err(_) => return Ok(None),
        }
        let Ok(_busy) = gate.notify_busy() else {
            return Ok(None);
        };

        if let Some(message) = self.redeliver_next() {
            return Ok(Some(message));
        }
        if let Some(message) = self.next_undelivered() {
            return Ok(Some(message));
        }
        self.receive_fresh(wait)
    }

    /// Hand out a message a removed listener never saw, flags untouched
    fn next_undelivered(&self) -> Option<Message> {
        let (handle, message) = {
            let mut queue = self.undelivered_queue();
            let next = queue.pop_front()?;
            if queue.is_empty() {
                self.signal_backlog(false);
            }
            next
        };
        self.session.settle(self.id, handle);
        self.session.metrics.increment_received();
        Some(message)
    }

    /// Park a message for the next receive or listener and wake waiters
    fn strand(&self, handle: SampleHandle, message: Message) {
        let mut queue = self.undelivered_queue();
        queue.push_back((handle, message));
        self.signal_backlog(true);
    }

    fn signal_backlog(&self, value: bool) {
        if let Err(e) = self.backlog.set_trigger_value(value) {
            Logger::trace(
                "BACKLOG_SIGNAL_FAILED",
                &[("consumer", &self.id.to_string()), ("reason", &e.to_string())],
            );
        }
    }

    /// Pop the recovery queue until a sample can still be re-read
    fn redeliver_next(&self) -> Option<Message> {
        loop {
            let handle = self.recovery_queue().pop_front()?;
            if let Some(message) = self.reread(&handle) {
                self.session.settle(self.id, handle);
                self.session.metrics.increment_received();
                self.session.metrics.increment_redelivered();
                return Some(message);
            }
        }
    }

    /// Re-read a previously delivered sample, marked redelivered.
    /// `None` if the sample no longer matches the redelivery mask.
    fn reread(&self, handle: &SampleHandle) -> Option<Message> {
        match handle
            .reader()
            .read_instance(handle.instance(), StateMask::redelivery())
        {
            Ok(Some(sample)) => {
                match Message::from_payload(&sample.data, handle.instance(), &self.destination) {
                    Ok(mut message) => {
                        message.redelivered = true;
                        Some(message)
                    }
                    Err(e) => {
                        Logger::warn(
                            "REDELIVERY_MALFORMED",
                            &[("instance", &handle.instance().to_string()), ("reason", &e.to_string())],
                        );
                        None
                    }
                }
            }
            Ok(None) => {
                Logger::trace(
                    "REDELIVERY_SKIPPED",
                    &[("consumer", &self.id.to_string()), ("instance", &handle.instance().to_string())],
                );
                None
            }
            Err(e) => {
                Logger::trace(
                    "REDELIVERY_SKIPPED",
                    &[
                        ("consumer", &self.id.to_string()),
                        ("instance", &handle.instance().to_string()),
                        ("reason", &e.to_string()),
                    ],
                );
                None
            }
        }
    }

    fn receive_fresh(&self, wait: Wait) -> BridgeResult<Option<Message>> {
        let condition = EphemeralCondition::attach(self.reader.as_ref(), self.wait_set.as_ref())?;
        let token = self.close_token.id();
        let backlog = self.backlog.id();

        loop {
            let triggered = match self.wait_set.wait(wait.remaining()) {
                Ok(triggered) => triggered,
                Err(e) if e.is_timeout() => {
                    self.session.metrics.increment_timeouts();
                    return Ok(None);
                }
                Err(e) => return Err(BridgeError::WaitFailure(e.to_string())),
            };

            // The close token is attached first, so it wins a tie.
            if triggered.contains(&token) {
                self.session.metrics.increment_cancelled();
                return Ok(None);
            }
            if triggered.contains(&backlog) {
                if let Some(message) = self.next_undelivered() {
                    return Ok(Some(message));
                }
            }
            if !triggered.contains(&condition.id) {
                continue;
            }

            let sample = match self.reader.read_w_condition(condition.id) {
                Ok(Some(sample)) => sample,
                Ok(None) => continue,
                Err(e) => {
                    Logger::trace(
                        "RECEIVE_READ_FAILED",
                        &[("consumer", &self.id.to_string()), ("reason", &e.to_string())],
                    );
                    continue;
                }
            };

            let handle = SampleHandle::new(Arc::clone(&self.reader), sample.info.instance_handle);
            let message = match Message::from_payload(&sample.data, handle.instance(), &self.destination) {
                Ok(message) => message,
                Err(e) => {
                    self.drop_malformed(handle, &e);
                    continue;
                }
            };

            drop(condition);
            self.session.settle(self.id, handle);
            self.session.metrics.increment_received();
            return Ok(Some(message));
        }
    }

    fn drop_malformed(&self, handle: SampleHandle, error: &BridgeError) {
        Logger::warn(
            "MALFORMED_SAMPLE_DROPPED",
            &[
                ("consumer", &self.id.to_string()),
                ("instance", &handle.instance().to_string()),
                ("reason", &error.to_string()),
            ],
        );
        self.session.ledger.register_acknowledged(self.id, handle);
    }

    /// Push every currently available sample to the listener.
    ///
    /// Runs only while the gate is started; connection start pumps again.
    pub(crate) fn pump(self: &Arc<Self>) {
        let _serial = self.pump.lock().unwrap_or_else(PoisonError::into_inner);
        if self.current_listener().is_none() {
            return;
        }
        let Some(_busy) = self.gate.try_busy() else {
            return;
        };

        let stranded: Vec<(SampleHandle, Message)> = {
            let mut queue = self.undelivered_queue();
            if !queue.is_empty() {
                self.signal_backlog(false);
            }
            queue.drain(..).collect()
        };
        for (handle, message) in stranded {
            self.submit(message, handle);
        }

        let condition = match self.reader.create_read_condition(ReadQuery::fresh_by_priority()) {
            Ok(condition) => condition,
            Err(e) => {
                Logger::warn(
                    "LISTENER_PUMP_FAILED",
                    &[("consumer", &self.id.to_string()), ("reason", &e.to_string())],
                );
                return;
            }
        };
        loop {
            match self.reader.read_w_condition(condition) {
                Ok(Some(sample)) => self.dispatch_fresh(sample),
                Ok(None) => break,
                Err(e) => {
                    Logger::trace(
                        "LISTENER_PUMP_STOPPED",
                        &[("consumer", &self.id.to_string()), ("reason", &e.to_string())],
                    );
                    break;
                }
            }
        }
        if let Err(e) = self.reader.delete_read_condition(condition) {
            Logger::trace(
                "READ_CONDITION_DELETE_FAILED",
                &[("condition", &condition.to_string()), ("reason", &e.to_string())],
            );
        }
    }

    fn dispatch_fresh(self: &Arc<Self>, sample: Sample) {
        let handle = SampleHandle::new(Arc::clone(&self.reader), sample.info.instance_handle);
        match Message::from_payload(&sample.data, handle.instance(), &self.destination) {
            Ok(message) => self.submit(message, handle),
            Err(e) => self.drop_malformed(handle, &e),
        }
    }

    /// Queue a listener invocation on the session executor
    fn submit(self: &Arc<Self>, message: Message, handle: SampleHandle) {
        let consumer = Arc::clone(self);
        let task: DispatchTask = Box::new(move || consumer.deliver_to_listener(message, handle));
        if let Err(e) = self.session.executor.execute(task) {
            Logger::warn(
                "DISPATCH_REJECTED",
                &[("consumer", &self.id.to_string()), ("reason", &e.to_string())],
            );
        }
    }

    /// Run one queued listener invocation.
    ///
    /// The open check and any ledger registration happen under the state
    /// lock, so a concurrent close either skips the task or discards the
    /// entry. The listener itself runs unlocked and may close the consumer.
    fn deliver_to_listener(&self, message: Message, handle: SampleHandle) {
        let client = self.session.acknowledge_mode.is_client();
        let listener = {
            let state = self.state();
            if *state == ConsumerState::Closed {
                return;
            }
            let Some(listener) = self.current_listener() else {
                self.strand(handle, message);
                return;
            };
            if client {
                self.session.settle(self.id, handle.clone());
            }
            listener
        };

        listener.on_message(message);
        if !client {
            let state = self.state();
            if *state == ConsumerState::Open {
                self.session.settle(self.id, handle);
            }
        }
        self.session.metrics.increment_dispatched();
    }

    /// Redeliver previously delivered samples, oldest first.
    ///
    /// With a listener they are re-read now and queued on the executor;
    /// otherwise they go to the front of the recovery queue for the next
    /// receive calls.
    pub(crate) fn recover(self: &Arc<Self>, handles: Vec<SampleHandle>) {
        if handles.is_empty() {
            return;
        }
        if self.current_listener().is_some() {
            for handle in handles {
                if let Some(message) = self.reread(&handle) {
                    self.session.metrics.increment_redelivered();
                    self.submit(message, handle);
                }
            }
            return;
        }

        let mut queue = self.recovery_queue();
        let leftovers: Vec<SampleHandle> = queue.drain(..).collect();
        queue.extend(handles);
        queue.extend(leftovers);
    }

    pub(crate) fn close(&self) -> BridgeResult<()> {
        let mut state = self.state();
        if *state == ConsumerState::Closed {
            return Ok(());
        }
        let scope = ObservationScope::new(
            "CONSUMER_CLOSE",
            &[
                ("consumer", self.id.to_string()),
                ("destination", self.destination.name().to_string()),
            ],
        );

        if let Err(e) = self.close_token.set_trigger_value(true) {
            Logger::warn(
                "CLOSE_TOKEN_TRIGGER_FAILED",
                &[("consumer", &self.id.to_string()), ("reason", &e.to_string())],
            );
        }
        self.gate.release();

        *self.listener.write().unwrap_or_else(PoisonError::into_inner) = None;
        if let Err(e) = self.reader.set_listener(None) {
            Logger::trace(
                "LISTENER_CLEAR_FAILED",
                &[("consumer", &self.id.to_string()), ("reason", &e.to_string())],
            );
        }
        let destroyed = self.subscriber.delete_datareader(self.reader.as_ref());
        delete_wait_set(self.participant.as_ref(), self.wait_set.as_ref());
        delete_guard(self.participant.as_ref(), self.close_token.as_ref());
        delete_guard(self.participant.as_ref(), self.backlog.as_ref());

        self.recovery_queue().clear();
        self.undelivered_queue().clear();
        let dropped = self.session.ledger.discard(self.id);
        self.session.forget_consumer(self.id);
        *state = ConsumerState::Closed;

        scope.complete(&[("dropped_unacknowledged", &dropped.to_string())]);
        destroyed.map_err(BridgeError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AcknowledgeMode;
    use crate::dispatch::listener;
    use crate::facade::memory::{MemoryDomain, MemoryParticipant};
    use crate::facade::{
        DataWriterQos, EntityId, FacadeError, ParticipantId, Publisher, Topic,
    };
    use crate::observability::DeliveryMetrics;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::thread;

    struct Fixture {
        domain: MemoryDomain,
        session: Arc<SessionCore>,
        publisher: Arc<dyn Publisher>,
        participant: Arc<MemoryParticipant>,
    }

    /// Switches for the errors a [`FaultyWaitSet`] injects
    #[derive(Default)]
    struct Faults {
        attach: AtomicBool,
        wait: AtomicBool,
    }

    /// Memory participant whose wait-sets fail on demand
    struct FaultyParticipant {
        inner: Arc<MemoryParticipant>,
        faults: Arc<Faults>,
    }

    impl DomainParticipant for FaultyParticipant {
        fn id(&self) -> ParticipantId {
            self.inner.id()
        }

        fn create_topic(&self, name: &str) -> FacadeResult<Topic> {
            self.inner.create_topic(name)
        }

        fn create_publisher(&self) -> FacadeResult<Arc<dyn Publisher>> {
            self.inner.create_publisher()
        }

        fn create_subscriber(&self, ignore_local: bool) -> FacadeResult<Arc<dyn Subscriber>> {
            self.inner.create_subscriber(ignore_local)
        }

        fn create_guard_condition(&self) -> FacadeResult<Arc<dyn GuardCondition>> {
            self.inner.create_guard_condition()
        }

        fn create_wait_set(&self) -> FacadeResult<Arc<dyn WaitSet>> {
            Ok(Arc::new(FaultyWaitSet {
                inner: self.inner.create_wait_set()?,
                faults: Arc::clone(&self.faults),
            }))
        }

        fn delete_guard_condition(&self, condition: &dyn GuardCondition) -> FacadeResult<()> {
            self.inner.delete_guard_condition(condition)
        }

        fn delete_wait_set(&self, wait_set: &dyn WaitSet) -> FacadeResult<()> {
            self.inner.delete_wait_set(wait_set)
        }

        fn delete_contained_entities(&self) -> FacadeResult<()> {
            self.inner.delete_contained_entities()
        }
    }

    struct FaultyWaitSet {
        inner: Arc<dyn WaitSet>,
        faults: Arc<Faults>,
    }

    impl WaitSet for FaultyWaitSet {
        fn id(&self) -> EntityId {
            self.inner.id()
        }

        fn attach_condition(&self, condition: ConditionId) -> FacadeResult<()> {
            if self.faults.attach.load(Ordering::SeqCst) {
                return Err(FacadeError::error("attach refused"));
            }
            self.inner.attach_condition(condition)
        }

        fn detach_condition(&self, condition: ConditionId) -> FacadeResult<()> {
            self.inner.detach_condition(condition)
        }

        fn wait(&self, timeout: Option<Duration>) -> FacadeResult<Vec<ConditionId>> {
            if self.faults.wait.load(Ordering::SeqCst) {
                return Err(FacadeError::error("wait interrupted"));
            }
            self.inner.wait(timeout)
        }
    }

    fn fixture(mode: AcknowledgeMode) -> Fixture {
        let domain = MemoryDomain::new();
        let participant = domain.create_participant();
        let publisher = participant.create_publisher().unwrap();
        Fixture {
            domain,
            session: SessionCore::new(1, mode, Arc::new(DeliveryMetrics::new())).unwrap(),
            publisher,
            participant,
        }
    }

    impl Fixture {
        fn consumer(&self, started: bool) -> MessageConsumer {
            self.consumer_on(self.participant.clone(), started).unwrap()
        }

        fn consumer_on(
            &self,
            participant: Arc<dyn DomainParticipant>,
            started: bool,
        ) -> BridgeResult<MessageConsumer> {
            let subscriber = participant.create_subscriber(false)?;
            let inner = ConsumerInner::open(
                ConsumerId(1),
                Arc::clone(&self.session),
                participant,
                subscriber,
                Destination::topic("orders"),
                ConsumerOptions::default(),
                started,
            )?;
            self.session.remember_consumer(Arc::clone(&inner));
            Ok(MessageConsumer::new(inner))
        }

        fn faulty(&self) -> (Arc<Faults>, Arc<dyn DomainParticipant>) {
            let faults = Arc::new(Faults::default());
            let participant: Arc<dyn DomainParticipant> = Arc::new(FaultyParticipant {
                inner: Arc::clone(&self.participant),
                faults: Arc::clone(&faults),
            });
            (faults, participant)
        }

        /// Wait until every task queued so far on the session executor ran
        fn flush_executor(&self) {
            let (tx, rx) = mpsc::channel();
            self.session
                .executor
                .execute(Box::new(move || {
                    let _ = tx.send(());
                }))
                .unwrap();
            rx.recv_timeout(Duration::from_secs(2)).unwrap();
        }

        fn send(&self, text: &str, priority: u8) {
            let topic = self.participant.create_topic("orders").unwrap();
            let writer = self
                .publisher
                .create_datawriter(&topic, DataWriterQos::default())
                .unwrap();
            let mut message = Message::text(text);
            message.set_priority(priority).unwrap();
            writer.write(message.to_payload().unwrap()).unwrap();
        }
    }

    /// Read the next fresh sample behind the consumer's back, as the pump does
    fn read_directly(consumer: &MessageConsumer) -> (Message, SampleHandle) {
        let reader = &consumer.inner.reader;
        let condition = reader.create_read_condition(ReadQuery::fresh_by_priority()).unwrap();
        let sample = reader.read_w_condition(condition).unwrap().unwrap();
        reader.delete_read_condition(condition).unwrap();
        let handle = SampleHandle::new(Arc::clone(reader), sample.info.instance_handle);
        let message =
            Message::from_payload(&sample.data, handle.instance(), &consumer.inner.destination).unwrap();
        (message, handle)
    }

    #[test]
    fn test_receive_orders_by_priority_then_arrival() {
        let f = fixture(AcknowledgeMode::Auto);
        let consumer = f.consumer(true);
        f.send("low", 1);
        f.send("high-a", 8);
        f.send("high-b", 8);

        let texts: Vec<String> = (0..3)
            .map(|_| consumer.receive_no_wait().unwrap().unwrap().text_body().unwrap().to_string())
            .collect();
        assert_eq!(texts, vec!["high-a", "high-b", "low"]);
        assert!(consumer.receive_no_wait().unwrap().is_none());
    }

    #[test]
    fn test_ephemeral_condition_is_removed_after_receive() {
        let f = fixture(AcknowledgeMode::Auto);
        let consumer = f.consumer(true);
        assert_eq!(f.domain.read_condition_count(), 0);
        assert!(consumer.receive_timeout(20).unwrap().is_none());
        assert_eq!(f.domain.read_condition_count(), 0);
        f.send("x", 4);
        assert!(consumer.receive_timeout(20).unwrap().is_some());
        assert_eq!(f.domain.read_condition_count(), 0);
    }

    #[test]
    fn test_negative_timeout_rejected() {
        let f = fixture(AcknowledgeMode::Auto);
        let consumer = f.consumer(true);
        let err = consumer.receive_timeout(-1).unwrap_err();
        assert!(matches!(err, BridgeError::IllegalArgument(_)));
    }

    #[test]
    fn test_auto_mode_takes_sample_on_receive() {
        let f = fixture(AcknowledgeMode::Auto);
        let consumer = f.consumer(true);
        f.send("x", 4);
        consumer.receive_no_wait().unwrap().unwrap();
        assert_eq!(f.domain.sample_count(consumer.inner.reader.id()), 0);
        assert_eq!(f.session.ledger.total_pending(), 0);
    }

    #[test]
    fn test_client_mode_keeps_sample_pending() {
        let f = fixture(AcknowledgeMode::Client);
        let consumer = f.consumer(true);
        f.send("x", 4);
        consumer.receive_no_wait().unwrap().unwrap();
        assert_eq!(f.domain.sample_count(consumer.inner.reader.id()), 1);
        assert_eq!(f.session.ledger.pending_count(consumer.id()), 1);
    }

    #[test]
    fn test_close_unblocks_receive() {
        let f = fixture(AcknowledgeMode::Auto);
        let consumer = f.consumer(true);
        let blocked = {
            let consumer = consumer.clone();
            thread::spawn(move || consumer.receive())
        };
        thread::sleep(Duration::from_millis(50));
        consumer.close().unwrap();
        assert!(blocked.join().unwrap().unwrap().is_none());
        assert_eq!(f.domain.reader_count(), 0);
    }

    #[test]
    fn test_close_unblocks_receive_waiting_for_start() {
        let f = fixture(AcknowledgeMode::Auto);
        let consumer = f.consumer(false);
        f.send("x", 4);
        let blocked = {
            let consumer = consumer.clone();
            thread::spawn(move || consumer.receive_timeout(5_000))
        };
        thread::sleep(Duration::from_millis(50));
        consumer.close().unwrap();
        assert!(blocked.join().unwrap().unwrap().is_none());
    }

    #[test]
    fn test_timed_receive_on_stopped_gate_times_out() {
        let f = fixture(AcknowledgeMode::Auto);
        let consumer = f.consumer(false);
        f.send("x", 4);
        assert!(consumer.receive_no_wait().unwrap().is_none());
        assert!(consumer.receive_timeout(30).unwrap().is_none());
        consumer.inner.gate().start();
        assert!(consumer.receive_no_wait().unwrap().is_some());
    }

    #[test]
    fn test_operations_after_close_fail() {
        let f = fixture(AcknowledgeMode::Auto);
        let consumer = f.consumer(true);
        consumer.close().unwrap();
        consumer.close().unwrap();
        assert!(consumer.is_closed());
        assert!(matches!(consumer.receive(), Err(BridgeError::ClosedConsumer)));
        assert!(matches!(consumer.receive_no_wait(), Err(BridgeError::ClosedConsumer)));
        assert!(matches!(consumer.message_selector(), Err(BridgeError::ClosedConsumer)));
        assert!(matches!(consumer.message_listener(), Err(BridgeError::ClosedConsumer)));
        assert!(matches!(
            consumer.set_message_listener(None),
            Err(BridgeError::ClosedConsumer)
        ));
    }

    #[test]
    fn test_close_drops_unacknowledged_entries() {
        let f = fixture(AcknowledgeMode::Client);
        let consumer = f.consumer(true);
        f.send("x", 4);
        consumer.receive_no_wait().unwrap().unwrap();
        consumer.close().unwrap();
        assert_eq!(f.session.ledger.total_pending(), 0);
        assert_eq!(f.session.metrics.snapshot().acknowledgments_discarded, 1);
    }

    #[test]
    fn test_recovery_skips_samples_that_are_gone() {
        let f = fixture(AcknowledgeMode::Client);
        let consumer = f.consumer(true);
        f.send("a", 4);
        f.send("b", 4);
        consumer.receive_no_wait().unwrap().unwrap();
        consumer.receive_no_wait().unwrap().unwrap();

        f.domain.dispose_all(consumer.inner.reader.id());
        let pending = f.session.ledger.drain();
        consumer.inner.recover(pending[&consumer.id()].clone());

        assert!(consumer.receive_no_wait().unwrap().is_none());
        assert!(consumer.inner.recovery_queue().is_empty());
        assert_eq!(f.session.ledger.total_pending(), 0);
    }

    #[test]
    fn test_recovery_queue_redelivers_before_fresh_samples() {
        let f = fixture(AcknowledgeMode::Client);
        let consumer = f.consumer(true);
        f.send("first", 4);
        let first = consumer.receive_no_wait().unwrap().unwrap();
        assert!(!first.redelivered);

        let pending = f.session.ledger.drain();
        f.send("second", 9);
        consumer.inner.recover(pending[&consumer.id()].clone());

        let again = consumer.receive_no_wait().unwrap().unwrap();
        assert_eq!(again.text_body(), Some("first"));
        assert!(again.redelivered);
        let next = consumer.receive_no_wait().unwrap().unwrap();
        assert_eq!(next.text_body(), Some("second"));
        assert!(!next.redelivered);
    }

    #[test]
    fn test_attach_failure_on_open_leaves_nothing_behind() {
        let f = fixture(AcknowledgeMode::Auto);
        let (faults, participant) = f.faulty();
        faults.attach.store(true, Ordering::SeqCst);

        let result = f.consumer_on(participant, true);
        assert!(matches!(result, Err(BridgeError::AttachFailure(_))));
        assert_eq!(f.domain.reader_count(), 0);
        assert_eq!(f.domain.guard_condition_count(), 0);
        assert_eq!(f.domain.wait_set_count(), 0);
    }

    #[test]
    fn test_attach_failure_on_receive_deletes_read_condition() {
        let f = fixture(AcknowledgeMode::Auto);
        let (faults, participant) = f.faulty();
        let consumer = f.consumer_on(participant, true).unwrap();
        f.send("x", 4);

        faults.attach.store(true, Ordering::SeqCst);
        let err = consumer.receive_no_wait().unwrap_err();
        assert!(matches!(err, BridgeError::AttachFailure(_)));
        assert_eq!(err.code(), "JMS_ATTACH_FAILURE");
        assert_eq!(f.domain.read_condition_count(), 0);

        faults.attach.store(false, Ordering::SeqCst);
        assert_eq!(consumer.receive_no_wait().unwrap().unwrap().text_body(), Some("x"));
    }

    #[test]
    fn test_wait_failure_detaches_read_condition() {
        let f = fixture(AcknowledgeMode::Auto);
        let (faults, participant) = f.faulty();
        let consumer = f.consumer_on(participant, true).unwrap();

        faults.wait.store(true, Ordering::SeqCst);
        let err = consumer.receive_timeout(50).unwrap_err();
        assert!(matches!(err, BridgeError::WaitFailure(_)));
        assert_eq!(f.domain.read_condition_count(), 0);

        // The close token is still attached, so close still wakes receivers
        faults.wait.store(false, Ordering::SeqCst);
        let blocked = {
            let consumer = consumer.clone();
            thread::spawn(move || consumer.receive())
        };
        thread::sleep(Duration::from_millis(50));
        consumer.close().unwrap();
        assert!(blocked.join().unwrap().unwrap().is_none());
    }

    #[test]
    fn test_close_deletes_wait_set_and_close_token() {
        let f = fixture(AcknowledgeMode::Auto);
        let consumer = f.consumer(true);
        assert_eq!(f.domain.guard_condition_count(), 2);
        assert_eq!(f.domain.wait_set_count(), 1);

        consumer.close().unwrap();
        assert_eq!(f.domain.guard_condition_count(), 0);
        assert_eq!(f.domain.wait_set_count(), 0);
        assert_eq!(f.domain.reader_count(), 0);
    }

    #[test]
    fn test_message_for_removed_listener_is_not_marked_redelivered() {
        let f = fixture(AcknowledgeMode::Auto);
        let consumer = f.consumer(true);
        f.send("x", 4);
        let (message, handle) = read_directly(&consumer);

        consumer.inner.deliver_to_listener(message, handle);
        assert_eq!(consumer.inner.undelivered_queue().len(), 1);
        assert!(consumer.inner.recovery_queue().is_empty());

        let message = consumer.receive_no_wait().unwrap().unwrap();
        assert_eq!(message.text_body(), Some("x"));
        assert!(!message.redelivered);
        assert_eq!(f.domain.sample_count(consumer.inner.reader.id()), 0);
        assert_eq!(f.session.metrics.snapshot().messages_redelivered, 0);
    }

    #[test]
    fn test_stranded_message_wakes_blocked_receive() {
        let f = fixture(AcknowledgeMode::Auto);
        let consumer = f.consumer(true);
        f.send("x", 4);
        let (message, handle) = read_directly(&consumer);

        let blocked = {
            let consumer = consumer.clone();
            thread::spawn(move || consumer.receive_timeout(5_000))
        };
        thread::sleep(Duration::from_millis(50));
        consumer.inner.deliver_to_listener(message, handle);

        let received = blocked.join().unwrap().unwrap().unwrap();
        assert_eq!(received.text_body(), Some("x"));
        assert!(!received.redelivered);
        assert!(!consumer.inner.backlog.trigger_value());
    }

    #[test]
    fn test_new_listener_receives_stranded_messages() {
        let f = fixture(AcknowledgeMode::Client);
        let consumer = f.consumer(true);
        f.send("x", 4);
        let (message, handle) = read_directly(&consumer);
        consumer.inner.deliver_to_listener(message, handle);

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        consumer
            .set_message_listener(Some(listener(move |message: Message| {
                let record = (message.text_body().unwrap_or("").to_string(), message.redelivered);
                let _ = tx.lock().unwrap().send(record);
            })))
            .unwrap();

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            ("x".to_string(), false)
        );
        assert!(consumer.inner.undelivered_queue().is_empty());
        assert_eq!(f.session.ledger.pending_count(consumer.id()), 1);
    }

    #[test]
    fn test_listener_delivery_racing_close_leaves_no_entries() {
        for _ in 0..25 {
            let f = fixture(AcknowledgeMode::Client);
            let consumer = f.consumer(true);
            consumer
                .set_message_listener(Some(listener(|_message: Message| {})))
                .unwrap();
            for i in 0..4 {
                f.send(&format!("m{}", i), 4);
            }
            consumer.close().unwrap();
            f.flush_executor();

            assert_eq!(f.session.ledger.pending_count(consumer.id()), 0);
            assert!(consumer.inner.undelivered_queue().is_empty());
        }
    }

    #[test]
    fn test_delivery_after_close_registers_nothing() {
        let f = fixture(AcknowledgeMode::Client);
        let consumer = f.consumer(true);
        f.send("x", 4);
        let (message, handle) = read_directly(&consumer);
        consumer.close().unwrap();

        consumer.inner.deliver_to_listener(message, handle);
        assert_eq!(f.session.ledger.total_pending(), 0);
        assert!(consumer.inner.undelivered_queue().is_empty());
    }
}
