//! # In-Memory Bus
//!
//! A single-process implementation of the transport port with the semantics
//! the delivery layer depends on:
//!
//! - **Streams** store every message whose subject they capture, subject to
//!   max-age, max-messages, and max-bytes retention.
//! - **Durable consumers** keep each delivery pending until it is acked.
//!   A nak, or the loss of the subscription holding it, makes it eligible for
//!   redelivery with an incremented delivery count.
//! - **Queue groups** receive each message on one member, round-robin.
//! - **Bounded queues**: a full subscription queue drops core messages and
//!   defers durable ones.
//!
//! Durable consumers see every matching publish made after they were first
//! registered, whether or not a stream captured it.
//!
//! Fault injection (`set_available`, `inject_publish_failures`,
//! `inject_delete_failures`) and the publish log exist for tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::message::{Acker, DeliveryInfo, InboundMessage, Subscription};
use crate::subject::{validate_subject, SubjectPattern};
use crate::transport::{
    BusConnection, BusConnector, BusError, ConnectOptions, ConsumerOptions, PublishAck,
    StoredMessage, StreamConfig, StreamInfo, StreamProvision,
};

/// Delay before retrying a durable delivery that found every member's queue full.
const REDELIVERY_BACKOFF: Duration = Duration::from_millis(25);

/// A successful publish, as recorded in the publish log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedRecord {
    pub subject: String,
    pub payload: Vec<u8>,
    pub durable: bool,
    pub sequence: Option<u64>,
}

/// Handle to an in-memory bus. Clones share the same bus.
#[derive(Clone)]
pub struct InMemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl InMemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new_cyclic(|handle| Mutex::new(BusState::new(handle.clone()))),
        }
    }

    /// Simulate a broker outage. While unavailable every operation fails
    /// with `BusError::Connection`.
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
        info!(available, "In-memory bus availability changed");
    }

    /// Fail the next `count` publishes whose subject matches `pattern`
    /// (every subject when `None`).
    pub fn inject_publish_failures(&self, count: u32, pattern: Option<&str>) -> Result<(), BusError> {
        let pattern = pattern.map(SubjectPattern::parse).transpose()?;
        self.state.lock().failures = Some(InjectedFailures {
            remaining: count,
            pattern,
        });
        Ok(())
    }

    /// Fail the next `count` stream deletions with a connection error.
    pub fn inject_delete_failures(&self, count: u32) {
        self.state.lock().delete_failures = count;
    }

    /// Every successful publish, oldest first.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedRecord> {
        self.state.lock().published.clone()
    }

    /// Successful publishes to exactly `subject`.
    #[must_use]
    pub fn published_to(&self, subject: &str) -> Vec<PublishedRecord> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|r| r.subject == subject)
            .cloned()
            .collect()
    }

    /// Core deliveries dropped because a subscriber queue was full.
    #[must_use]
    pub fn dropped_messages(&self) -> u64 {
        self.state.lock().dropped
    }

    /// Number of successful `connect` calls.
    #[must_use]
    pub fn connection_count(&self) -> u64 {
        self.state.lock().connects
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    /// Unacknowledged deliveries held for a durable consumer.
    #[must_use]
    pub fn pending_count(&self, durable: &str) -> usize {
        self.state
            .lock()
            .consumers
            .get(durable)
            .map_or(0, |c| c.pending.len())
    }

    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.state.lock().streams.len()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BusConnector for InMemoryBus {
    async fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn BusConnection>, BusError> {
        {
            let mut state = self.state.lock();
            state.ensure_available()?;
            state.connects += 1;
        }
        debug!(name = %options.name, servers = ?options.servers, "In-memory bus connection opened");
        Ok(Arc::new(MemoryConnection {
            bus: self.clone(),
            closed: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
        }))
    }
}

// =============================================================================
// CONNECTION
// =============================================================================

struct MemoryConnection {
    bus: InMemoryBus,
    closed: AtomicBool,
    subscriptions: Mutex<Vec<u64>>,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl BusConnection for MemoryConnection {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.ensure_open()?;
        validate_subject(subject)?;
        self.bus.state.lock().route(subject, payload, false).map(|_| ())
    }

    async fn publish_durable(
        &self,
        subject: &str,
        payload: Vec<u8>,
    ) -> Result<PublishAck, BusError> {
        self.ensure_open()?;
        validate_subject(subject)?;
        self.bus
            .state
            .lock()
            .route(subject, payload, true)?
            .ok_or_else(|| BusError::NoStream {
                subject: subject.to_string(),
            })
    }

    async fn subscribe(
        &self,
        pattern: &SubjectPattern,
        options: ConsumerOptions,
    ) -> Result<Subscription, BusError> {
        self.ensure_open()?;
        let (sender, receiver) = mpsc::channel(options.pending_limit.max(1));
        let id = self.bus.state.lock().register(pattern, &options, sender)?;
        self.subscriptions.lock().push(id);

        let handle = Arc::downgrade(&self.bus.state);
        let hook = Box::new(move || {
            if let Some(state) = handle.upgrade() {
                state.lock().unregister(id);
            }
        });
        debug!(
            pattern = %pattern,
            queue_group = ?options.queue_group,
            durable = ?options.durable_name,
            "Subscription registered"
        );
        Ok(Subscription::new(pattern.clone(), receiver, Some(hook)))
    }

    async fn ensure_stream(&self, config: StreamConfig) -> Result<StreamProvision, BusError> {
        self.ensure_open()?;
        self.bus.state.lock().ensure_stream(config)
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo, BusError> {
        self.ensure_open()?;
        let mut state = self.bus.state.lock();
        state.ensure_available()?;
        Ok(state.stream_mut(stream)?.info())
    }

    async fn stream_messages(&self, stream: &str) -> Result<Vec<StoredMessage>, BusError> {
        self.ensure_open()?;
        let mut state = self.bus.state.lock();
        state.ensure_available()?;
        let stream = state.stream_mut(stream)?;
        Ok(stream.messages.values().cloned().collect())
    }

    async fn get_message(&self, stream: &str, sequence: u64) -> Result<StoredMessage, BusError> {
        self.ensure_open()?;
        let mut state = self.bus.state.lock();
        state.ensure_available()?;
        state
            .stream_mut(stream)?
            .messages
            .get(&sequence)
            .cloned()
            .ok_or_else(|| BusError::MessageNotFound {
                stream: stream.to_string(),
                sequence,
            })
    }

    async fn delete_message(&self, stream: &str, sequence: u64) -> Result<(), BusError> {
        self.ensure_open()?;
        let mut state = self.bus.state.lock();
        state.ensure_available()?;
        if state.delete_failures > 0 {
            state.delete_failures -= 1;
            return Err(BusError::Connection(format!(
                "injected delete failure on {stream}/{sequence}"
            )));
        }
        if state.stream_mut(stream)?.remove(sequence) {
            Ok(())
        } else {
            Err(BusError::MessageNotFound {
                stream: stream.to_string(),
                sequence,
            })
        }
    }

    async fn flush(&self) -> Result<(), BusError> {
        self.ensure_open()?;
        self.bus.state.lock().ensure_available()
    }

    async fn close(&self) -> Result<(), BusError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let ids: Vec<u64> = std::mem::take(&mut *self.subscriptions.lock());
        let mut state = self.bus.state.lock();
        for id in ids {
            state.unregister(id);
        }
        debug!("In-memory bus connection closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.bus.state.lock().available
    }
}

// =============================================================================
// BUS STATE
// =============================================================================

struct InjectedFailures {
    remaining: u32,
    pattern: Option<SubjectPattern>,
}

struct SubscriptionEntry {
    pattern: SubjectPattern,
    queue_group: Option<String>,
    durable: Option<String>,
    sender: mpsc::Sender<InboundMessage>,
}

struct PendingDelivery {
    subject: String,
    payload: Vec<u8>,
    stream: Option<String>,
    stream_sequence: Option<u64>,
    delivered: u32,
    /// Subscription currently holding the delivery, if any.
    in_flight_sub: Option<u64>,
}

struct DurableConsumer {
    pattern: SubjectPattern,
    members: Vec<u64>,
    cursor: usize,
    next_delivery_id: u64,
    pending: BTreeMap<u64, PendingDelivery>,
}

struct StreamState {
    config: StreamConfig,
    patterns: Vec<SubjectPattern>,
    messages: BTreeMap<u64, StoredMessage>,
    last_sequence: u64,
    bytes: u64,
}

struct BusState {
    handle: Weak<Mutex<BusState>>,
    available: bool,
    connects: u64,
    next_sub_id: u64,
    streams: HashMap<String, StreamState>,
    consumers: HashMap<String, DurableConsumer>,
    subscriptions: HashMap<u64, SubscriptionEntry>,
    queue_cursors: HashMap<String, usize>,
    failures: Option<InjectedFailures>,
    delete_failures: u32,
    published: Vec<PublishedRecord>,
    dropped: u64,
}

impl BusState {
    fn new(handle: Weak<Mutex<BusState>>) -> Self {
        Self {
            handle,
            available: true,
            connects: 0,
            next_sub_id: 0,
            streams: HashMap::new(),
            consumers: HashMap::new(),
            subscriptions: HashMap::new(),
            queue_cursors: HashMap::new(),
            failures: None,
            delete_failures: 0,
            published: Vec::new(),
            dropped: 0,
        }
    }

    fn ensure_available(&self) -> Result<(), BusError> {
        if self.available {
            Ok(())
        } else {
            Err(BusError::Connection("bus unavailable".to_string()))
        }
    }

    fn take_injected_failure(&mut self, subject: &str) -> Result<(), BusError> {
        if let Some(failures) = &mut self.failures {
            let applies = failures
                .pattern
                .as_ref()
                .map_or(true, |p| p.matches(subject));
            if applies && failures.remaining > 0 {
                failures.remaining -= 1;
                return Err(BusError::Connection(format!(
                    "injected publish failure on {subject}"
                )));
            }
        }
        Ok(())
    }

    fn stream_mut(&mut self, name: &str) -> Result<&mut StreamState, BusError> {
        let stream = self
            .streams
            .get_mut(name)
            .ok_or_else(|| BusError::StreamNotFound(name.to_string()))?;
        stream.enforce_limits();
        Ok(stream)
    }

    /// Store, then fan out. Returns the stream ack when a stream captured the
    /// message. A durable publish with no capturing stream is rejected before
    /// anything is delivered.
    fn route(
        &mut self,
        subject: &str,
        payload: Vec<u8>,
        durable: bool,
    ) -> Result<Option<PublishAck>, BusError> {
        self.ensure_available()?;
        self.take_injected_failure(subject)?;

        let capturing = self
            .streams
            .iter()
            .find(|(_, s)| s.patterns.iter().any(|p| p.matches(subject)))
            .map(|(name, _)| name.clone());
        if durable && capturing.is_none() {
            return Err(BusError::NoStream {
                subject: subject.to_string(),
            });
        }

        let ack = capturing.and_then(|name| {
            let stream = self.streams.get_mut(&name)?;
            let sequence = stream.append(subject, &payload);
            Some(PublishAck {
                stream: name,
                sequence,
            })
        });

        self.published.push(PublishedRecord {
            subject: subject.to_string(),
            payload: payload.clone(),
            durable,
            sequence: ack.as_ref().map(|a| a.sequence),
        });

        self.fan_out_durable(subject, &payload, ack.as_ref());
        self.fan_out_core(subject, &payload);
        Ok(ack)
    }

    fn fan_out_durable(&mut self, subject: &str, payload: &[u8], ack: Option<&PublishAck>) {
        let mut queued = Vec::new();
        for (name, consumer) in &mut self.consumers {
            if !consumer.pattern.matches(subject) {
                continue;
            }
            consumer.next_delivery_id += 1;
            let id = consumer.next_delivery_id;
            consumer.pending.insert(
                id,
                PendingDelivery {
                    subject: subject.to_string(),
                    payload: payload.to_vec(),
                    stream: ack.map(|a| a.stream.clone()),
                    stream_sequence: ack.map(|a| a.sequence),
                    delivered: 0,
                    in_flight_sub: None,
                },
            );
            queued.push((name.clone(), id));
        }
        for (name, id) in queued {
            self.deliver_pending(&name, id);
        }
    }

    fn fan_out_core(&mut self, subject: &str, payload: &[u8]) {
        let mut direct = Vec::new();
        let mut groups: HashMap<String, Vec<u64>> = HashMap::new();
        for (id, sub) in &self.subscriptions {
            if sub.durable.is_some() || !sub.pattern.matches(subject) {
                continue;
            }
            match &sub.queue_group {
                Some(group) => groups
                    .entry(format!("{group}|{}", sub.pattern))
                    .or_default()
                    .push(*id),
                None => direct.push(*id),
            }
        }
        for (key, mut members) in groups {
            members.sort_unstable();
            let cursor = self.queue_cursors.entry(key).or_insert(0);
            direct.push(members[*cursor % members.len()]);
            *cursor = cursor.wrapping_add(1);
        }

        for id in direct {
            let Some(sub) = self.subscriptions.get(&id) else {
                continue;
            };
            let message = InboundMessage::core(subject, payload.to_vec());
            if let Err(err) = sub.sender.try_send(message) {
                self.dropped += 1;
                let reason = match err {
                    TrySendError::Full(_) => "queue full",
                    TrySendError::Closed(_) => "subscriber gone",
                };
                warn!(subject, pattern = %sub.pattern, reason, "Core message dropped");
            }
        }
    }

    /// Hand a pending delivery to one live member of its consumer. When every
    /// member's queue is full the delivery is retried after a short backoff;
    /// when there are no members it waits for the next bind.
    fn deliver_pending(&mut self, consumer_name: &str, delivery_id: u64) {
        let Some(consumer) = self.consumers.get_mut(consumer_name) else {
            return;
        };
        let live: Vec<u64> = consumer
            .members
            .iter()
            .copied()
            .filter(|id| {
                self.subscriptions
                    .get(id)
                    .is_some_and(|s| !s.sender.is_closed())
            })
            .collect();
        let Some(entry) = consumer.pending.get_mut(&delivery_id) else {
            return;
        };
        if entry.in_flight_sub.is_some() || live.is_empty() {
            return;
        }

        let start = consumer.cursor;
        consumer.cursor = consumer.cursor.wrapping_add(1);
        for offset in 0..live.len() {
            let sub_id = live[(start + offset) % live.len()];
            let Some(sub) = self.subscriptions.get(&sub_id) else {
                continue;
            };
            let info = DeliveryInfo {
                stream: entry.stream.clone(),
                stream_sequence: entry.stream_sequence,
                delivered: entry.delivered + 1,
                durable: Some(consumer_name.to_string()),
            };
            let acker = Arc::new(MemoryAcker {
                state: self.handle.clone(),
                consumer: consumer_name.to_string(),
                delivery_id,
                sub_id,
            });
            let message = InboundMessage::new(&entry.subject, entry.payload.clone(), info, acker);
            if sub.sender.try_send(message).is_ok() {
                entry.delivered += 1;
                entry.in_flight_sub = Some(sub_id);
                return;
            }
        }

        debug!(
            consumer = consumer_name,
            delivery_id, "Every member queue full, deferring durable delivery"
        );
        schedule_redelivery(
            self.handle.clone(),
            consumer_name.to_string(),
            delivery_id,
            REDELIVERY_BACKOFF,
        );
    }

    fn register(
        &mut self,
        pattern: &SubjectPattern,
        options: &ConsumerOptions,
        sender: mpsc::Sender<InboundMessage>,
    ) -> Result<u64, BusError> {
        self.ensure_available()?;
        if let Some(durable) = &options.durable_name {
            if let Some(existing) = self.consumers.get(durable) {
                if existing.pattern != *pattern {
                    return Err(BusError::ConsumerMismatch {
                        durable: durable.clone(),
                        existing: existing.pattern.to_string(),
                    });
                }
            }
        }

        self.next_sub_id += 1;
        let id = self.next_sub_id;
        self.subscriptions.insert(
            id,
            SubscriptionEntry {
                pattern: pattern.clone(),
                queue_group: options.queue_group.clone(),
                durable: options.durable_name.clone(),
                sender,
            },
        );

        if let Some(durable) = &options.durable_name {
            let consumer = self
                .consumers
                .entry(durable.clone())
                .or_insert_with(|| DurableConsumer {
                    pattern: pattern.clone(),
                    members: Vec::new(),
                    cursor: 0,
                    next_delivery_id: 0,
                    pending: BTreeMap::new(),
                });
            consumer.members.push(id);
            let waiting: Vec<u64> = consumer
                .pending
                .iter()
                .filter(|(_, p)| p.in_flight_sub.is_none())
                .map(|(id, _)| *id)
                .collect();
            for delivery_id in waiting {
                self.deliver_pending(durable, delivery_id);
            }
        }
        Ok(id)
    }

    fn unregister(&mut self, sub_id: u64) {
        let Some(entry) = self.subscriptions.remove(&sub_id) else {
            return;
        };
        let Some(durable) = entry.durable else {
            return;
        };
        let mut orphaned = Vec::new();
        if let Some(consumer) = self.consumers.get_mut(&durable) {
            consumer.members.retain(|id| *id != sub_id);
            for (id, pending) in &mut consumer.pending {
                if pending.in_flight_sub == Some(sub_id) {
                    pending.in_flight_sub = None;
                    orphaned.push(*id);
                }
            }
        }
        if !orphaned.is_empty() {
            debug!(
                consumer = %durable,
                count = orphaned.len(),
                "Redelivering unacknowledged messages from dropped subscription"
            );
        }
        for id in orphaned {
            self.deliver_pending(&durable, id);
        }
    }

    fn ensure_stream(&mut self, config: StreamConfig) -> Result<StreamProvision, BusError> {
        self.ensure_available()?;
        if config.name.trim().is_empty() {
            return Err(BusError::InvalidStream("stream name is empty".to_string()));
        }
        if config.subjects.is_empty() {
            return Err(BusError::InvalidStream(format!(
                "stream {} captures no subjects",
                config.name
            )));
        }
        let patterns = config
            .subjects
            .iter()
            .map(|s| SubjectPattern::parse(s))
            .collect::<Result<Vec<_>, _>>()?;

        match self.streams.get_mut(&config.name) {
            Some(existing) if existing.config == config => Ok(StreamProvision::Unchanged),
            Some(existing) => {
                existing.config = config;
                existing.patterns = patterns;
                existing.enforce_limits();
                info!(stream = %existing.config.name, "Stream configuration updated");
                Ok(StreamProvision::Updated)
            }
            None => {
                info!(stream = %config.name, subjects = ?config.subjects, "Stream created");
                self.streams.insert(
                    config.name.clone(),
                    StreamState {
                        config,
                        patterns,
                        messages: BTreeMap::new(),
                        last_sequence: 0,
                        bytes: 0,
                    },
                );
                Ok(StreamProvision::Created)
            }
        }
    }
}

impl StreamState {
    fn append(&mut self, subject: &str, payload: &[u8]) -> u64 {
        self.last_sequence += 1;
        let sequence = self.last_sequence;
        self.bytes += payload.len() as u64;
        self.messages.insert(
            sequence,
            StoredMessage {
                stream: self.config.name.clone(),
                sequence,
                subject: subject.to_string(),
                payload: payload.to_vec(),
                timestamp: Utc::now(),
            },
        );
        self.enforce_limits();
        sequence
    }

    fn remove(&mut self, sequence: u64) -> bool {
        match self.messages.remove(&sequence) {
            Some(message) => {
                self.bytes = self.bytes.saturating_sub(message.payload.len() as u64);
                true
            }
            None => false,
        }
    }

    fn enforce_limits(&mut self) {
        let cutoff = self
            .config
            .max_age
            .and_then(|age| chrono::Duration::from_std(age).ok())
            .and_then(|age| Utc::now().checked_sub_signed(age));
        if let Some(cutoff) = cutoff {
            while let Some((&sequence, message)) = self.messages.first_key_value() {
                if message.timestamp >= cutoff {
                    break;
                }
                self.remove(sequence);
            }
        }
        if let Some(max) = self.config.max_messages {
            while self.messages.len() as u64 > max {
                let Some((&sequence, _)) = self.messages.first_key_value() else {
                    break;
                };
                self.remove(sequence);
            }
        }
        if let Some(max) = self.config.max_bytes {
            while self.bytes > max {
                let Some((&sequence, _)) = self.messages.first_key_value() else {
                    break;
                };
                self.remove(sequence);
            }
        }
    }

    fn info(&self) -> StreamInfo {
        let first = self.messages.first_key_value();
        StreamInfo {
            config: self.config.clone(),
            messages: self.messages.len() as u64,
            bytes: self.bytes,
            first_sequence: first.map_or(0, |(seq, _)| *seq),
            last_sequence: self.last_sequence,
            first_timestamp: first.map(|(_, m)| m.timestamp),
        }
    }
}

// =============================================================================
// ACKNOWLEDGEMENT
// =============================================================================

struct MemoryAcker {
    state: Weak<Mutex<BusState>>,
    consumer: String,
    delivery_id: u64,
    sub_id: u64,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), BusError> {
        let state = self.state.upgrade().ok_or(BusError::Closed)?;
        let mut state = state.lock();
        if let Some(consumer) = state.consumers.get_mut(&self.consumer) {
            consumer.pending.remove(&self.delivery_id);
        }
        Ok(())
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<(), BusError> {
        let state = self.state.upgrade().ok_or(BusError::Closed)?;
        let mut state = state.lock();
        let Some(entry) = state
            .consumers
            .get_mut(&self.consumer)
            .and_then(|c| c.pending.get_mut(&self.delivery_id))
        else {
            return Ok(());
        };
        // A stale nak from a subscription that already lost the delivery.
        if entry.in_flight_sub != Some(self.sub_id) {
            return Ok(());
        }
        entry.in_flight_sub = None;
        match delay {
            Some(delay) if !delay.is_zero() => schedule_redelivery(
                self.state.clone(),
                self.consumer.clone(),
                self.delivery_id,
                delay,
            ),
            _ => state.deliver_pending(&self.consumer, self.delivery_id),
        }
        Ok(())
    }
}

fn schedule_redelivery(
    handle: Weak<Mutex<BusState>>,
    consumer: String,
    delivery_id: u64,
    delay: Duration,
) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        return;
    };
    runtime.spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(state) = handle.upgrade() {
            state.lock().deliver_pending(&consumer, delivery_id);
        }
    });
}
