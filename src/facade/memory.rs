//! # In-Memory Facade
//!
//! A single-process domain implementing the facade traits. All entities of a
//! domain share one state mutex and one condition variable; every state change
//! that can flip a condition wakes all wait-sets, which re-evaluate their
//! attached conditions (level-triggered).
//!
//! Every admitted sample becomes its own instance, so an instance handle
//! identifies exactly one message inside one reader.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::errors::{FacadeError, FacadeResult};
use super::qos::{DataReaderQos, DataWriterQos, HistoryKind};
use super::types::{
    ConditionId, ContentFilter, EntityId, InstanceHandle, InstanceState, MessagePayload,
    ParticipantId, ReadQuery, Sample, SampleInfo, SampleOrder, SampleState, StateMask, Topic,
    ViewState,
};
use super::{
    DataReader, DataReaderListener, DataWriter, DomainParticipant, GuardCondition, Publisher,
    Subscriber, WaitSet,
};

/// An in-process domain
#[derive(Clone, Default)]
pub struct MemoryDomain {
    inner: Arc<DomainInner>,
}

#[derive(Default)]
struct DomainInner {
    state: Mutex<DomainState>,
    changed: Condvar,
}

impl DomainInner {
    fn lock(&self) -> MutexGuard<'_, DomainState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.changed.notify_all();
    }
}

#[derive(Default)]
struct DomainState {
    next_id: u64,
    topics: HashMap<String, TopicState>,
    publishers: HashMap<EntityId, ParticipantId>,
    subscribers: HashMap<EntityId, SubscriberState>,
    writers: HashMap<EntityId, WriterState>,
    readers: HashMap<EntityId, ReaderState>,
    guards: HashMap<ConditionId, GuardState>,
    read_conditions: HashMap<ConditionId, ReadConditionState>,
    wait_sets: HashMap<EntityId, WaitSetState>,
}

#[derive(Default)]
struct TopicState {
    history: VecDeque<(ParticipantId, MessagePayload)>,
}

struct SubscriberState {
    participant: ParticipantId,
    ignore_local: bool,
}

#[derive(Clone)]
struct WriterState {
    participant: ParticipantId,
    publisher: EntityId,
    topic: String,
    qos: DataWriterQos,
}

struct ReaderState {
    participant: ParticipantId,
    subscriber: EntityId,
    topic: String,
    ignore_local: bool,
    filter: Option<ContentFilter>,
    samples: Vec<StoredSample>,
    listener: Option<Arc<dyn DataReaderListener>>,
}

struct StoredSample {
    data: MessagePayload,
    handle: InstanceHandle,
    sample_state: SampleState,
    view_state: ViewState,
    instance_state: InstanceState,
    origin: ParticipantId,
}

struct GuardState {
    participant: ParticipantId,
    triggered: bool,
}

struct ReadConditionState {
    reader: EntityId,
    query: ReadQuery,
}

struct WaitSetState {
    participant: ParticipantId,
    attached: Vec<ConditionId>,
}

impl DomainState {
    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn is_triggered(&self, condition: ConditionId) -> bool {
        if let Some(guard) = self.guards.get(&condition) {
            return guard.triggered;
        }
        let Some(read) = self.read_conditions.get(&condition) else {
            return false;
        };
        self.readers
            .get(&read.reader)
            .map(|reader| reader.samples.iter().any(|s| s.matches(&read.query.mask)))
            .unwrap_or(false)
    }

    fn remove_condition_everywhere(&mut self, condition: ConditionId) {
        for wait_set in self.wait_sets.values_mut() {
            wait_set.attached.retain(|c| *c != condition);
        }
    }

    fn remove_reader(&mut self, reader: EntityId) {
        self.readers.remove(&reader);
        let orphaned: Vec<ConditionId> = self
            .read_conditions
            .iter()
            .filter(|(_, c)| c.reader == reader)
            .map(|(id, _)| *id)
            .collect();
        for condition in orphaned {
            self.read_conditions.remove(&condition);
            self.remove_condition_everywhere(condition);
        }
    }

    /// Copy a payload into `reader` if its filters admit it
    fn admit(&mut self, reader: EntityId, origin: ParticipantId, payload: &MessagePayload) -> bool {
        let admitted = match self.readers.get(&reader) {
            Some(r) => r.admits(origin, payload),
            None => false,
        };
        if !admitted {
            return false;
        }
        let handle = InstanceHandle(self.allocate());
        if let Some(r) = self.readers.get_mut(&reader) {
            r.samples.push(StoredSample {
                data: payload.clone(),
                handle,
                sample_state: SampleState::NotRead,
                view_state: ViewState::New,
                instance_state: InstanceState::Alive,
                origin,
            });
        }
        true
    }
}

impl ReaderState {
    fn admits(&self, origin: ParticipantId, payload: &MessagePayload) -> bool {
        if self.ignore_local && origin == self.participant {
            return false;
        }
        self.filter.as_ref().map_or(true, |f| f.accepts(payload))
    }

    fn position(&self, handle: InstanceHandle, mask: &StateMask) -> Option<usize> {
        self.samples
            .iter()
            .position(|s| s.handle == handle && s.matches(mask))
    }

    fn next_for(&self, query: &ReadQuery) -> Option<usize> {
        let candidates = self
            .samples
            .iter()
            .enumerate()
            .filter(|(_, s)| s.matches(&query.mask));
        match query.order {
            SampleOrder::Arrival => candidates.map(|(i, _)| i).next(),
            // Samples are stored in arrival order, so min_by_key keeps the
            // earliest among equal keys.
            SampleOrder::OrderingKey => candidates
                .min_by_key(|(_, s)| s.data.header.ordering_key)
                .map(|(i, _)| i),
        }
    }

    fn mark_read(&mut self, index: usize) -> Sample {
        let stored = &mut self.samples[index];
        let sample = stored.to_sample();
        stored.sample_state = SampleState::Read;
        stored.view_state = ViewState::NotNew;
        sample
    }
}

impl StoredSample {
    fn matches(&self, mask: &StateMask) -> bool {
        mask.matches(self.sample_state, self.view_state, self.instance_state)
    }

    fn to_sample(&self) -> Sample {
        Sample {
            data: self.data.clone(),
            info: SampleInfo {
                instance_handle: self.handle,
                sample_state: self.sample_state,
                view_state: self.view_state,
                instance_state: self.instance_state,
                publication_participant: self.origin,
            },
        }
    }
}

impl MemoryDomain {
    /// Create an empty domain
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the domain with a new participant
    pub fn create_participant(&self) -> Arc<MemoryParticipant> {
        let id = ParticipantId(self.inner.lock().allocate());
        Arc::new(MemoryParticipant {
            domain: Arc::clone(&self.inner),
            id,
        })
    }

    /// Number of live readers in the domain
    pub fn reader_count(&self) -> usize {
        self.inner.lock().readers.len()
    }

    /// Number of live read conditions in the domain
    pub fn read_condition_count(&self) -> usize {
        self.inner.lock().read_conditions.len()
    }

    /// Number of live guard conditions in the domain
    pub fn guard_condition_count(&self) -> usize {
        self.inner.lock().guards.len()
    }

    /// Number of live wait-sets in the domain
    pub fn wait_set_count(&self) -> usize {
        self.inner.lock().wait_sets.len()
    }

    /// Number of samples held by a reader, read or not
    pub fn sample_count(&self, reader: EntityId) -> usize {
        self.inner
            .lock()
            .readers
            .get(&reader)
            .map(|r| r.samples.len())
            .unwrap_or(0)
    }

    /// Mark every sample of `reader` as disposed
    pub fn dispose_all(&self, reader: EntityId) {
        let mut state = self.inner.lock();
        if let Some(r) = state.readers.get_mut(&reader) {
            for sample in &mut r.samples {
                sample.instance_state = InstanceState::NotAliveDisposed;
            }
        }
        drop(state);
        self.inner.notify();
    }
}

/// Participant of a [`MemoryDomain`]
pub struct MemoryParticipant {
    domain: Arc<DomainInner>,
    id: ParticipantId,
}

impl DomainParticipant for MemoryParticipant {
    fn id(&self) -> ParticipantId {
        self.id
    }

    fn create_topic(&self, name: &str) -> FacadeResult<Topic> {
        if name.is_empty() {
            return Err(FacadeError::bad_parameter("topic name must not be empty"));
        }
        self.domain
            .lock()
            .topics
            .entry(name.to_string())
            .or_default();
        Ok(Topic {
            name: name.to_string(),
        })
    }

    fn create_publisher(&self) -> FacadeResult<Arc<dyn Publisher>> {
        let mut state = self.domain.lock();
        let id = EntityId(state.allocate());
        state.publishers.insert(id, self.id);
        Ok(Arc::new(MemoryPublisher {
            domain: Arc::clone(&self.domain),
            participant: self.id,
            id,
        }))
    }

    fn create_subscriber(&self, ignore_local: bool) -> FacadeResult<Arc<dyn Subscriber>> {
        let mut state = self.domain.lock();
        let id = EntityId(state.allocate());
        state.subscribers.insert(
            id,
            SubscriberState {
                participant: self.id,
                ignore_local,
            },
        );
        Ok(Arc::new(MemorySubscriber {
            domain: Arc::clone(&self.domain),
            participant: self.id,
            id,
        }))
    }

    fn create_guard_condition(&self) -> FacadeResult<Arc<dyn GuardCondition>> {
        let mut state = self.domain.lock();
        let id = ConditionId(state.allocate());
        state.guards.insert(
            id,
            GuardState {
                participant: self.id,
                triggered: false,
            },
        );
        Ok(Arc::new(MemoryGuardCondition {
            domain: Arc::clone(&self.domain),
            id,
        }))
    }

    fn create_wait_set(&self) -> FacadeResult<Arc<dyn WaitSet>> {
        let mut state = self.domain.lock();
        let id = EntityId(state.allocate());
        state.wait_sets.insert(
            id,
            WaitSetState {
                participant: self.id,
                attached: Vec::new(),
            },
        );
        Ok(Arc::new(MemoryWaitSet {
            domain: Arc::clone(&self.domain),
            id,
        }))
    }

    fn delete_guard_condition(&self, condition: &dyn GuardCondition) -> FacadeResult<()> {
        let mut state = self.domain.lock();
        let id = condition.id();
        if state.guards.remove(&id).is_none() {
            return Err(FacadeError::already_deleted("guard condition"));
        }
        state.remove_condition_everywhere(id);
        drop(state);
        self.domain.notify();
        Ok(())
    }

    fn delete_wait_set(&self, wait_set: &dyn WaitSet) -> FacadeResult<()> {
        let mut state = self.domain.lock();
        if state.wait_sets.remove(&wait_set.id()).is_none() {
            return Err(FacadeError::already_deleted("wait set"));
        }
        drop(state);
        self.domain.notify();
        Ok(())
    }

    fn delete_contained_entities(&self) -> FacadeResult<()> {
        let mut state = self.domain.lock();
        let me = self.id;
        let readers: Vec<EntityId> = state
            .readers
            .iter()
            .filter(|(_, r)| r.participant == me)
            .map(|(id, _)| *id)
            .collect();
        for reader in readers {
            state.remove_reader(reader);
        }
        state.writers.retain(|_, w| w.participant != me);
        state.publishers.retain(|_, p| *p != me);
        state.subscribers.retain(|_, s| s.participant != me);
        state.guards.retain(|_, g| g.participant != me);
        state.wait_sets.retain(|_, w| w.participant != me);
        drop(state);
        self.domain.notify();
        Ok(())
    }
}

struct MemoryPublisher {
    domain: Arc<DomainInner>,
    participant: ParticipantId,
    id: EntityId,
}

impl Publisher for MemoryPublisher {
    fn id(&self) -> EntityId {
        self.id
    }

    fn default_datawriter_qos(&self) -> DataWriterQos {
        DataWriterQos::default()
    }

    fn create_datawriter(
        &self,
        topic: &Topic,
        qos: DataWriterQos,
    ) -> FacadeResult<Arc<dyn DataWriter>> {
        let mut state = self.domain.lock();
        if !state.publishers.contains_key(&self.id) {
            return Err(FacadeError::already_deleted("publisher"));
        }
        state.topics.entry(topic.name.clone()).or_default();
        let id = EntityId(state.allocate());
        state.writers.insert(
            id,
            WriterState {
                participant: self.participant,
                publisher: self.id,
                topic: topic.name.clone(),
                qos,
            },
        );
        Ok(Arc::new(MemoryDataWriter {
            domain: Arc::clone(&self.domain),
            id,
        }))
    }

    fn delete_datawriter(&self, writer: &dyn DataWriter) -> FacadeResult<()> {
        let mut state = self.domain.lock();
        match state.writers.get(&writer.id()) {
            None => Err(FacadeError::already_deleted("data writer")),
            Some(w) if w.publisher != self.id => Err(FacadeError::precondition_not_met(
                "data writer belongs to another publisher",
            )),
            Some(_) => {
                state.writers.remove(&writer.id());
                Ok(())
            }
        }
    }
}

struct MemorySubscriber {
    domain: Arc<DomainInner>,
    participant: ParticipantId,
    id: EntityId,
}

impl Subscriber for MemorySubscriber {
    fn id(&self) -> EntityId {
        self.id
    }

    fn default_datareader_qos(&self) -> DataReaderQos {
        DataReaderQos::default()
    }

    fn create_datareader(
        &self,
        topic: &Topic,
        qos: DataReaderQos,
        filter: Option<ContentFilter>,
    ) -> FacadeResult<Arc<dyn DataReader>> {
        let mut state = self.domain.lock();
        let ignore_local = match state.subscribers.get(&self.id) {
            Some(s) => s.ignore_local,
            None => return Err(FacadeError::already_deleted("subscriber")),
        };
        let id = EntityId(state.allocate());
        state.readers.insert(
            id,
            ReaderState {
                participant: self.participant,
                subscriber: self.id,
                topic: topic.name.clone(),
                ignore_local,
                filter,
                samples: Vec::new(),
                listener: None,
            },
        );

        if qos.durability.retains_history() {
            let history: Vec<(ParticipantId, MessagePayload)> = state
                .topics
                .entry(topic.name.clone())
                .or_default()
                .history
                .iter()
                .cloned()
                .collect();
            for (origin, payload) in history {
                state.admit(id, origin, &payload);
            }
        }
        drop(state);
        self.domain.notify();

        Ok(Arc::new(MemoryDataReader {
            domain: Arc::clone(&self.domain),
            id,
        }))
    }

    fn delete_datareader(&self, reader: &dyn DataReader) -> FacadeResult<()> {
        let mut state = self.domain.lock();
        match state.readers.get(&reader.id()) {
            None => return Err(FacadeError::already_deleted("data reader")),
            Some(r) if r.subscriber != self.id => {
                return Err(FacadeError::precondition_not_met(
                    "data reader belongs to another subscriber",
                ))
            }
            Some(_) => state.remove_reader(reader.id()),
        }
        drop(state);
        self.domain.notify();
        Ok(())
    }
}

struct MemoryDataWriter {
    domain: Arc<DomainInner>,
    id: EntityId,
}

impl DataWriter for MemoryDataWriter {
    fn id(&self) -> EntityId {
        self.id
    }

    fn qos(&self) -> DataWriterQos {
        self.domain
            .lock()
            .writers
            .get(&self.id)
            .map(|w| w.qos.clone())
            .unwrap_or_default()
    }

    fn write(&self, payload: MessagePayload) -> FacadeResult<()> {
        let notifications = {
            let mut state = self.domain.lock();
            let writer = state
                .writers
                .get(&self.id)
                .cloned()
                .ok_or_else(|| FacadeError::already_deleted("data writer"))?;

            if writer.qos.durability.retains_history() {
                let topic = state.topics.entry(writer.topic.clone()).or_default();
                topic.history.push_back((writer.participant, payload.clone()));
                if let HistoryKind::KeepLast(depth) = writer.qos.history {
                    while topic.history.len() > depth as usize {
                        topic.history.pop_front();
                    }
                }
            }

            let matched: Vec<EntityId> = state
                .readers
                .iter()
                .filter(|(_, r)| r.topic == writer.topic)
                .map(|(id, _)| *id)
                .collect();

            let mut notifications = Vec::new();
            for reader in matched {
                if !state.admit(reader, writer.participant, &payload) {
                    continue;
                }
                if let Some(listener) = state.readers.get(&reader).and_then(|r| r.listener.clone()) {
                    notifications.push((listener, reader));
                }
            }
            notifications
        };
        self.domain.notify();

        // Callbacks run on the writing thread, outside the domain lock.
        for (listener, reader) in notifications {
            let reader = MemoryDataReader {
                domain: Arc::clone(&self.domain),
                id: reader,
            };
            listener.on_data_available(&reader);
        }
        Ok(())
    }
}

struct MemoryDataReader {
    domain: Arc<DomainInner>,
    id: EntityId,
}

impl DataReader for MemoryDataReader {
    fn id(&self) -> EntityId {
        self.id
    }

    fn create_read_condition(&self, query: ReadQuery) -> FacadeResult<ConditionId> {
        let mut state = self.domain.lock();
        if !state.readers.contains_key(&self.id) {
            return Err(FacadeError::already_deleted("data reader"));
        }
        let id = ConditionId(state.allocate());
        state.read_conditions.insert(
            id,
            ReadConditionState {
                reader: self.id,
                query,
            },
        );
        Ok(id)
    }

    fn delete_read_condition(&self, condition: ConditionId) -> FacadeResult<()> {
        let mut state = self.domain.lock();
        match state.read_conditions.get(&condition) {
            None => Err(FacadeError::already_deleted("read condition")),
            Some(c) if c.reader != self.id => Err(FacadeError::precondition_not_met(
                "read condition belongs to another reader",
            )),
            Some(_) => {
                state.read_conditions.remove(&condition);
                state.remove_condition_everywhere(condition);
                Ok(())
            }
        }
    }

    fn read_w_condition(&self, condition: ConditionId) -> FacadeResult<Option<Sample>> {
        let mut state = self.domain.lock();
        let query = match state.read_conditions.get(&condition) {
            Some(c) if c.reader == self.id => c.query,
            Some(_) => {
                return Err(FacadeError::bad_parameter(
                    "read condition belongs to another reader",
                ))
            }
            None => return Err(FacadeError::already_deleted("read condition")),
        };
        let reader = state
            .readers
            .get_mut(&self.id)
            .ok_or_else(|| FacadeError::already_deleted("data reader"))?;
        Ok(reader.next_for(&query).map(|i| reader.mark_read(i)))
    }

    fn read_instance(
        &self,
        handle: InstanceHandle,
        mask: StateMask,
    ) -> FacadeResult<Option<Sample>> {
        let mut state = self.domain.lock();
        let reader = state
            .readers
            .get_mut(&self.id)
            .ok_or_else(|| FacadeError::already_deleted("data reader"))?;
        Ok(reader.position(handle, &mask).map(|i| reader.mark_read(i)))
    }

    fn take_instance(
        &self,
        handle: InstanceHandle,
        mask: StateMask,
    ) -> FacadeResult<Option<Sample>> {
        let mut state = self.domain.lock();
        let reader = state
            .readers
            .get_mut(&self.id)
            .ok_or_else(|| FacadeError::already_deleted("data reader"))?;
        Ok(reader
            .position(handle, &mask)
            .map(|i| reader.samples.remove(i).to_sample()))
    }

    fn set_listener(&self, listener: Option<Arc<dyn DataReaderListener>>) -> FacadeResult<()> {
        let mut state = self.domain.lock();
        let reader = state
            .readers
            .get_mut(&self.id)
            .ok_or_else(|| FacadeError::already_deleted("data reader"))?;
        reader.listener = listener;
        Ok(())
    }
}

struct MemoryGuardCondition {
    domain: Arc<DomainInner>,
    id: ConditionId,
}

impl GuardCondition for MemoryGuardCondition {
    fn id(&self) -> ConditionId {
        self.id
    }

    fn set_trigger_value(&self, value: bool) -> FacadeResult<()> {
        let mut state = self.domain.lock();
        let guard = state
            .guards
            .get_mut(&self.id)
            .ok_or_else(|| FacadeError::already_deleted("guard condition"))?;
        guard.triggered = value;
        drop(state);
        self.domain.notify();
        Ok(())
    }

    fn trigger_value(&self) -> bool {
        self.domain
            .lock()
            .guards
            .get(&self.id)
            .map(|g| g.triggered)
            .unwrap_or(false)
    }
}

struct MemoryWaitSet {
    domain: Arc<DomainInner>,
    id: EntityId,
}

impl WaitSet for MemoryWaitSet {
    fn id(&self) -> EntityId {
        self.id
    }

    fn attach_condition(&self, condition: ConditionId) -> FacadeResult<()> {
        let mut state = self.domain.lock();
        if !state.guards.contains_key(&condition) && !state.read_conditions.contains_key(&condition) {
            return Err(FacadeError::bad_parameter("unknown condition"));
        }
        let wait_set = state
            .wait_sets
            .get_mut(&self.id)
            .ok_or_else(|| FacadeError::already_deleted("wait set"))?;
        if !wait_set.attached.contains(&condition) {
            wait_set.attached.push(condition);
        }
        drop(state);
        self.domain.notify();
        Ok(())
    }

    fn detach_condition(&self, condition: ConditionId) -> FacadeResult<()> {
        let mut state = self.domain.lock();
        let wait_set = state
            .wait_sets
            .get_mut(&self.id)
            .ok_or_else(|| FacadeError::already_deleted("wait set"))?;
        let before = wait_set.attached.len();
        wait_set.attached.retain(|c| *c != condition);
        if wait_set.attached.len() == before {
            return Err(FacadeError::precondition_not_met("condition not attached"));
        }
        Ok(())
    }

    fn wait(&self, timeout: Option<Duration>) -> FacadeResult<Vec<ConditionId>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.domain.lock();
        loop {
            let wait_set = state
                .wait_sets
                .get(&self.id)
                .ok_or_else(|| FacadeError::already_deleted("wait set"))?;
            let triggered: Vec<ConditionId> = wait_set
                .attached
                .iter()
                .copied()
                .filter(|c| state.is_triggered(*c))
                .collect();
            if !triggered.is_empty() {
                return Ok(triggered);
            }

            match deadline {
                None => {
                    state = self
                        .domain
                        .changed
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(FacadeError::timeout());
                    }
                    let (guard, _) = self
                        .domain
                        .changed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    state = guard;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::qos::DurabilityKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn payload(priority: u8, id: &str) -> MessagePayload {
        let mut payload = MessagePayload::default();
        payload.header.priority = priority;
        payload.header.ordering_key = 9 - priority;
        payload.header.message_id = Some(id.to_string());
        payload
    }

    fn pair(
        domain: &MemoryDomain,
    ) -> (Arc<MemoryParticipant>, Arc<dyn DataWriter>, Arc<dyn DataReader>) {
        let participant = domain.create_participant();
        let topic = participant.create_topic("t").unwrap();
        let publisher = participant.create_publisher().unwrap();
        let subscriber = participant.create_subscriber(false).unwrap();
        let reader = subscriber
            .create_datareader(&topic, DataReaderQos::default(), None)
            .unwrap();
        let writer = publisher
            .create_datawriter(&topic, DataWriterQos::default())
            .unwrap();
        (participant, writer, reader)
    }

    fn id_of(sample: &Sample) -> String {
        sample.data.header.message_id.clone().unwrap()
    }

    #[test]
    fn test_query_condition_orders_by_key_then_arrival() {
        let domain = MemoryDomain::new();
        let (_p, writer, reader) = pair(&domain);
        writer.write(payload(1, "a")).unwrap();
        writer.write(payload(8, "b")).unwrap();
        writer.write(payload(1, "c")).unwrap();

        let cond = reader.create_read_condition(ReadQuery::fresh_by_priority()).unwrap();
        let order: Vec<String> = std::iter::from_fn(|| reader.read_w_condition(cond).unwrap())
            .map(|s| id_of(&s))
            .collect();
        assert_eq!(order, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_read_marks_sample_read_but_keeps_it() {
        let domain = MemoryDomain::new();
        let (_p, writer, reader) = pair(&domain);
        writer.write(payload(4, "a")).unwrap();

        let cond = reader.create_read_condition(ReadQuery::fresh_by_priority()).unwrap();
        let sample = reader.read_w_condition(cond).unwrap().unwrap();
        assert_eq!(sample.info.sample_state, SampleState::NotRead);
        assert!(reader.read_w_condition(cond).unwrap().is_none());
        assert_eq!(domain.sample_count(reader.id()), 1);

        let again = reader
            .read_instance(sample.info.instance_handle, StateMask::redelivery())
            .unwrap()
            .unwrap();
        assert_eq!(again.info.sample_state, SampleState::Read);

        let taken = reader
            .take_instance(sample.info.instance_handle, StateMask::any())
            .unwrap();
        assert!(taken.is_some());
        assert_eq!(domain.sample_count(reader.id()), 0);
    }

    #[test]
    fn test_wait_times_out_when_nothing_triggers() {
        let domain = MemoryDomain::new();
        let (participant, _writer, reader) = pair(&domain);
        let ws = participant.create_wait_set().unwrap();
        let cond = reader.create_read_condition(ReadQuery::fresh_by_priority()).unwrap();
        ws.attach_condition(cond).unwrap();

        let err = ws.wait(Some(Duration::from_millis(20))).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_guard_condition_wakes_blocked_wait() {
        let domain = MemoryDomain::new();
        let participant = domain.create_participant();
        let ws = participant.create_wait_set().unwrap();
        let guard = participant.create_guard_condition().unwrap();
        ws.attach_condition(guard.id()).unwrap();

        let trigger = Arc::clone(&guard);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            trigger.set_trigger_value(true).unwrap();
        });

        let triggered = ws.wait(None).unwrap();
        assert_eq!(triggered, vec![guard.id()]);
        handle.join().unwrap();
    }

    #[test]
    fn test_write_wakes_waiting_reader() {
        let domain = MemoryDomain::new();
        let (participant, writer, reader) = pair(&domain);
        let ws = participant.create_wait_set().unwrap();
        let cond = reader.create_read_condition(ReadQuery::fresh_by_priority()).unwrap();
        ws.attach_condition(cond).unwrap();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            writer.write(payload(5, "late")).unwrap();
        });

        let triggered = ws.wait(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(triggered, vec![cond]);
        handle.join().unwrap();
    }

    #[test]
    fn test_durable_history_reaches_late_reader_only_when_durable() {
        let domain = MemoryDomain::new();
        let participant = domain.create_participant();
        let topic = participant.create_topic("history").unwrap();
        let publisher = participant.create_publisher().unwrap();
        let durable = publisher
            .create_datawriter(
                &topic,
                DataWriterQos {
                    durability: DurabilityKind::Persistent,
                    ..Default::default()
                },
            )
            .unwrap();
        let volatile = publisher
            .create_datawriter(&topic, DataWriterQos::default())
            .unwrap();
        durable.write(payload(4, "kept")).unwrap();
        volatile.write(payload(4, "lost")).unwrap();

        let subscriber = participant.create_subscriber(false).unwrap();
        let late = subscriber
            .create_datareader(
                &topic,
                DataReaderQos {
                    durability: DurabilityKind::TransientLocal,
                    ..Default::default()
                },
                None,
            )
            .unwrap();
        let cond = late.create_read_condition(ReadQuery::fresh_by_priority()).unwrap();
        assert_eq!(id_of(&late.read_w_condition(cond).unwrap().unwrap()), "kept");
        assert!(late.read_w_condition(cond).unwrap().is_none());

        let volatile_reader = subscriber
            .create_datareader(&topic, DataReaderQos::default(), None)
            .unwrap();
        assert_eq!(domain.sample_count(volatile_reader.id()), 0);
    }

    #[test]
    fn test_ignore_local_subscriber_skips_own_samples() {
        let domain = MemoryDomain::new();
        let local = domain.create_participant();
        let remote = domain.create_participant();
        let topic = local.create_topic("shared").unwrap();

        let reader = local
            .create_subscriber(true)
            .unwrap()
            .create_datareader(&topic, DataReaderQos::default(), None)
            .unwrap();

        let own = local.create_publisher().unwrap().create_datawriter(&topic, DataWriterQos::default()).unwrap();
        let other = remote.create_publisher().unwrap().create_datawriter(&topic, DataWriterQos::default()).unwrap();
        own.write(payload(4, "own")).unwrap();
        other.write(payload(4, "other")).unwrap();

        let cond = reader.create_read_condition(ReadQuery::fresh_by_priority()).unwrap();
        assert_eq!(id_of(&reader.read_w_condition(cond).unwrap().unwrap()), "other");
        assert!(reader.read_w_condition(cond).unwrap().is_none());
    }

    #[test]
    fn test_content_filter_drops_rejected_samples() {
        let domain = MemoryDomain::new();
        let participant = domain.create_participant();
        let topic = participant.create_topic("filtered").unwrap();
        let filter = ContentFilter::new("priority >= 5", |p: &MessagePayload| p.header.priority >= 5);
        let reader = participant
            .create_subscriber(false)
            .unwrap()
            .create_datareader(&topic, DataReaderQos::default(), Some(filter))
            .unwrap();
        let writer = participant.create_publisher().unwrap().create_datawriter(&topic, DataWriterQos::default()).unwrap();
        writer.write(payload(2, "low")).unwrap();
        writer.write(payload(7, "high")).unwrap();
        assert_eq!(domain.sample_count(reader.id()), 1);
    }

    #[test]
    fn test_listener_called_after_write() {
        struct Counter(AtomicUsize);
        impl DataReaderListener for Counter {
            fn on_data_available(&self, _reader: &dyn DataReader) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let domain = MemoryDomain::new();
        let (_p, writer, reader) = pair(&domain);
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        reader.set_listener(Some(counter.clone())).unwrap();
        writer.write(payload(4, "a")).unwrap();
        writer.write(payload(4, "b")).unwrap();
        reader.set_listener(None).unwrap();
        writer.write(payload(4, "c")).unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_deleting_reader_removes_its_conditions() {
        let domain = MemoryDomain::new();
        let participant = domain.create_participant();
        let topic = participant.create_topic("t").unwrap();
        let subscriber = participant.create_subscriber(false).unwrap();
        let reader = subscriber
            .create_datareader(&topic, DataReaderQos::default(), None)
            .unwrap();
        reader.create_read_condition(ReadQuery::fresh_by_priority()).unwrap();
        assert_eq!(domain.read_condition_count(), 1);

        subscriber.delete_datareader(reader.as_ref()).unwrap();
        assert_eq!(domain.reader_count(), 0);
        assert_eq!(domain.read_condition_count(), 0);
        assert!(subscriber.delete_datareader(reader.as_ref()).is_err());
    }

    #[test]
    fn test_deleting_guard_condition_detaches_it() {
        let domain = MemoryDomain::new();
        let participant = domain.create_participant();
        let ws = participant.create_wait_set().unwrap();
        let guard = participant.create_guard_condition().unwrap();
        ws.attach_condition(guard.id()).unwrap();
        assert_eq!(domain.guard_condition_count(), 1);

        participant.delete_guard_condition(guard.as_ref()).unwrap();
        assert_eq!(domain.guard_condition_count(), 0);
        assert!(ws.detach_condition(guard.id()).is_err());
        assert!(guard.set_trigger_value(true).is_err());
        assert!(participant.delete_guard_condition(guard.as_ref()).is_err());
    }

    #[test]
    fn test_deleting_wait_set_fails_later_waits() {
        let domain = MemoryDomain::new();
        let participant = domain.create_participant();
        let ws = participant.create_wait_set().unwrap();
        assert_eq!(domain.wait_set_count(), 1);

        participant.delete_wait_set(ws.as_ref()).unwrap();
        assert_eq!(domain.wait_set_count(), 0);
        let err = ws.wait(Some(Duration::from_millis(10))).unwrap_err();
        assert!(!err.is_timeout());
        assert!(participant.delete_wait_set(ws.as_ref()).is_err());
    }

    #[test]
    fn test_disposed_samples_fail_redelivery_mask() {
        let domain = MemoryDomain::new();
        let (_p, writer, reader) = pair(&domain);
        writer.write(payload(4, "a")).unwrap();
        let cond = reader.create_read_condition(ReadQuery::fresh_by_priority()).unwrap();
        let sample = reader.read_w_condition(cond).unwrap().unwrap();

        domain.dispose_all(reader.id());
        assert!(reader
            .read_instance(sample.info.instance_handle, StateMask::redelivery())
            .unwrap()
            .is_none());
    }
}
