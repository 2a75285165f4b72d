//! # NATS Adapter
//!
//! [`BusConnector`] for a NATS server with JetStream enabled.
//!
//! | Port operation | NATS |
//! |----------------|------|
//! | `publish`, non-durable `subscribe` | Core publish, (queue) subscribe |
//! | `publish_durable` | JetStream publish, waiting for the stream ack |
//! | durable `subscribe` | Durable pull consumer with explicit acks |
//! | `ensure_stream`, `stream_*`, `get_message`, `delete_message` | JetStream stream API |
//!
//! Instances subscribing with the same durable name share one pull consumer,
//! so JetStream spreads deliveries across them like a queue group.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy},
    context::PublishErrorKind,
    AckKind,
};
use async_trait::async_trait;
use chrono::DateTime;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::message::{Acker, DeliveryInfo, InboundMessage, Subscription};
use crate::subject::{validate_subject, SubjectPattern};
use crate::transport::{
    BusConnection, BusConnector, BusError, ConnectOptions, ConsumerOptions, PublishAck,
    StoredMessage, StreamConfig, StreamInfo, StreamProvision,
};

/// Pause after a failed pull before asking the consumer again.
const PULL_ERROR_BACKOFF: Duration = Duration::from_millis(250);

/// Opens [`NatsConnection`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct NatsConnector;

#[async_trait]
impl BusConnector for NatsConnector {
    async fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn BusConnection>, BusError> {
        let servers = options.servers.join(",");
        let client = async_nats::ConnectOptions::new()
            .name(&options.name)
            .connection_timeout(options.connect_timeout)
            .connect(servers.as_str())
            .await
            .map_err(connection_error)?;
        info!(%servers, name = %options.name, "Connected to NATS");
        Ok(Arc::new(NatsConnection::new(client)))
    }
}

/// One NATS client plus its JetStream context.
pub struct NatsConnection {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    closed: AtomicBool,
    pumps: Mutex<Vec<AbortHandle>>,
}

impl NatsConnection {
    #[must_use]
    pub fn new(client: async_nats::Client) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self {
            client,
            jetstream,
            closed: AtomicBool::new(false),
            pumps: Mutex::new(Vec::new()),
        }
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }

    async fn stream(&self, name: &str) -> Result<jetstream::stream::Stream, BusError> {
        self.ensure_open()?;
        self.jetstream.get_stream(name).await.map_err(|err| {
            if is_not_found(&err) {
                BusError::StreamNotFound(name.to_string())
            } else {
                connection_error(err)
            }
        })
    }

    async fn pump_core(
        &self,
        pattern: &SubjectPattern,
        options: &ConsumerOptions,
        tx: mpsc::Sender<InboundMessage>,
    ) -> Result<JoinHandle<()>, BusError> {
        let subject = pattern.as_str().to_string();
        let mut subscriber = match &options.queue_group {
            Some(group) => self.client.queue_subscribe(subject, group.clone()).await,
            None => self.client.subscribe(subject).await,
        }
        .map_err(connection_error)?;

        Ok(tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                let inbound =
                    InboundMessage::core(message.subject.to_string(), message.payload.to_vec());
                match tx.try_send(inbound) {
                    Ok(()) => {}
                    Err(TrySendError::Full(dropped)) => {
                        warn!(subject = %dropped.subject, "Subscription queue full, dropping message");
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
        }))
    }

    async fn pump_durable(
        &self,
        pattern: &SubjectPattern,
        durable: &str,
        options: &ConsumerOptions,
        tx: mpsc::Sender<InboundMessage>,
    ) -> Result<JoinHandle<()>, BusError> {
        let filter = pattern.as_str().to_string();
        let stream_name = self
            .jetstream
            .stream_by_subject(filter.clone())
            .await
            .map_err(|_| BusError::NoStream {
                subject: filter.clone(),
            })?;
        let stream = self.stream(&stream_name).await?;

        let mut consumer = stream
            .get_or_create_consumer(
                durable,
                pull::Config {
                    durable_name: Some(durable.to_string()),
                    filter_subject: filter.clone(),
                    ack_policy: AckPolicy::Explicit,
                    max_ack_pending: i64::try_from(options.pending_limit).unwrap_or(i64::MAX),
                    ..Default::default()
                },
            )
            .await
            .map_err(connection_error)?;
        let existing = consumer.info().await.map_err(connection_error)?.config.filter_subject.clone();
        if existing != filter {
            return Err(BusError::ConsumerMismatch {
                durable: durable.to_string(),
                existing,
            });
        }

        let mut messages = consumer.messages().await.map_err(connection_error)?;
        let durable = durable.to_string();
        debug!(%durable, stream = %stream_name, %filter, "Durable consumer bound");

        Ok(tokio::spawn(async move {
            while let Some(next) = messages.next().await {
                let message = match next {
                    Ok(message) => message,
                    Err(err) => {
                        warn!(%durable, error = %err, "Pull from durable consumer failed");
                        tokio::time::sleep(PULL_ERROR_BACKOFF).await;
                        continue;
                    }
                };
                let info = match message.info() {
                    Ok(info) => DeliveryInfo {
                        stream: Some(info.stream.to_string()),
                        stream_sequence: Some(info.stream_sequence),
                        delivered: u32::try_from(info.delivered).unwrap_or(u32::MAX),
                        durable: Some(durable.clone()),
                    },
                    Err(_) => DeliveryInfo {
                        delivered: 1,
                        durable: Some(durable.clone()),
                        ..DeliveryInfo::default()
                    },
                };
                let inbound = InboundMessage::new(
                    message.subject.to_string(),
                    message.payload.to_vec(),
                    info,
                    Arc::new(JetStreamAcker(message)),
                );
                // Backpressure: unacked deliveries stay pending on the server.
                if tx.send(inbound).await.is_err() {
                    break;
                }
            }
        }))
    }
}

#[async_trait]
impl BusConnection for NatsConnection {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.ensure_open()?;
        validate_subject(subject)?;
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(connection_error)
    }

    async fn publish_durable(
        &self,
        subject: &str,
        payload: Vec<u8>,
    ) -> Result<PublishAck, BusError> {
        self.ensure_open()?;
        validate_subject(subject)?;
        let ack = self
            .jetstream
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|err| publish_error(subject, &err))?
            .await
            .map_err(|err| publish_error(subject, &err))?;
        Ok(PublishAck {
            stream: ack.stream,
            sequence: ack.sequence,
        })
    }

    async fn subscribe(
        &self,
        pattern: &SubjectPattern,
        options: ConsumerOptions,
    ) -> Result<Subscription, BusError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::channel(options.pending_limit.max(1));
        let task = match &options.durable_name {
            Some(durable) => self.pump_durable(pattern, durable, &options, tx).await?,
            None => self.pump_core(pattern, &options, tx).await?,
        };

        let on_drop = task.abort_handle();
        {
            let mut pumps = self.pumps.lock();
            pumps.retain(|pump| !pump.is_finished());
            pumps.push(task.abort_handle());
        }
        Ok(Subscription::new(
            pattern.clone(),
            rx,
            Some(Box::new(move || on_drop.abort())),
        ))
    }

    async fn ensure_stream(&self, config: StreamConfig) -> Result<StreamProvision, BusError> {
        self.ensure_open()?;
        if config.subjects.is_empty() {
            return Err(BusError::InvalidStream(format!(
                "stream {} captures no subjects",
                config.name
            )));
        }
        let desired = stream_config(&config);

        match self.jetstream.get_stream(&config.name).await {
            Ok(mut existing) => {
                let current = existing.info().await.map_err(connection_error)?.config.clone();
                if same_limits(&current, &desired) {
                    return Ok(StreamProvision::Unchanged);
                }
                self.jetstream
                    .update_stream(&desired)
                    .await
                    .map_err(connection_error)?;
                info!(stream = %config.name, "JetStream stream updated");
                Ok(StreamProvision::Updated)
            }
            Err(_) => match self.jetstream.create_stream(desired).await {
                Ok(_) => {
                    info!(stream = %config.name, subjects = ?config.subjects, "JetStream stream created");
                    Ok(StreamProvision::Created)
                }
                // Another instance won the race.
                Err(err) => match self.jetstream.get_stream(&config.name).await {
                    Ok(_) => Ok(StreamProvision::Unchanged),
                    Err(_) => Err(connection_error(err)),
                },
            },
        }
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo, BusError> {
        let mut handle = self.stream(stream).await?;
        let info = handle.info().await.map_err(connection_error)?;
        let state = &info.state;
        let first_timestamp = if state.messages == 0 {
            None
        } else {
            let first = state.first_timestamp;
            DateTime::from_timestamp(first.unix_timestamp(), first.nanosecond())
        };
        Ok(StreamInfo {
            config: StreamConfig {
                name: info.config.name.clone(),
                subjects: info.config.subjects.clone(),
                max_age: Some(info.config.max_age).filter(|age| !age.is_zero()),
                max_messages: u64::try_from(info.config.max_messages).ok().filter(|n| *n > 0),
                max_bytes: u64::try_from(info.config.max_bytes).ok().filter(|n| *n > 0),
            },
            messages: state.messages,
            bytes: state.bytes,
            first_sequence: state.first_sequence,
            last_sequence: state.last_sequence,
            first_timestamp,
        })
    }

    async fn stream_messages(&self, stream: &str) -> Result<Vec<StoredMessage>, BusError> {
        let mut handle = self.stream(stream).await?;
        let (messages, first, last) = {
            let state = &handle.info().await.map_err(connection_error)?.state;
            (state.messages, state.first_sequence, state.last_sequence)
        };
        let mut stored = Vec::with_capacity(usize::try_from(messages).unwrap_or(0));
        if messages == 0 {
            return Ok(stored);
        }

        // Sequences removed by delete_message leave gaps.
        for sequence in first..=last {
            match handle.get_raw_message(sequence).await {
                Ok(raw) => stored.push(StoredMessage {
                    stream: stream.to_string(),
                    sequence: raw.sequence,
                    subject: raw.subject.to_string(),
                    payload: raw.payload.to_vec(),
                    timestamp: DateTime::from_timestamp(
                        raw.time.unix_timestamp(),
                        raw.time.nanosecond(),
                    )
                    .unwrap_or_default(),
                }),
                Err(err) if is_not_found(&err) => {}
                Err(err) => return Err(connection_error(err)),
            }
        }
        Ok(stored)
    }

    async fn get_message(&self, stream: &str, sequence: u64) -> Result<StoredMessage, BusError> {
        let handle = self.stream(stream).await?;
        match handle.get_raw_message(sequence).await {
            Ok(raw) => Ok(StoredMessage {
                stream: stream.to_string(),
                sequence: raw.sequence,
                subject: raw.subject.to_string(),
                payload: raw.payload.to_vec(),
                timestamp: DateTime::from_timestamp(raw.time.unix_timestamp(), raw.time.nanosecond())
                    .unwrap_or_default(),
            }),
            Err(err) if is_not_found(&err) => Err(BusError::MessageNotFound {
                stream: stream.to_string(),
                sequence,
            }),
            Err(err) => Err(connection_error(err)),
        }
    }

    async fn delete_message(&self, stream: &str, sequence: u64) -> Result<(), BusError> {
        let handle = self.stream(stream).await?;
        match handle.delete_message(sequence).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(BusError::MessageNotFound {
                stream: stream.to_string(),
                sequence,
            }),
            Err(err) if is_not_found(&err) => Err(BusError::MessageNotFound {
                stream: stream.to_string(),
                sequence,
            }),
            Err(err) => Err(connection_error(err)),
        }
    }

    async fn flush(&self) -> Result<(), BusError> {
        self.ensure_open()?;
        self.client.flush().await.map_err(connection_error)
    }

    async fn close(&self) -> Result<(), BusError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let pumps: Vec<AbortHandle> = std::mem::take(&mut *self.pumps.lock());
        for pump in &pumps {
            pump.abort();
        }
        if let Err(err) = self.client.flush().await {
            warn!(error = %err, "Flush on close failed");
        }
        info!(subscriptions = pumps.len(), "NATS connection closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
            && matches!(
                self.client.connection_state(),
                async_nats::connection::State::Connected
            )
    }
}

/// Acknowledges a JetStream delivery.
struct JetStreamAcker(jetstream::Message);

#[async_trait]
impl Acker for JetStreamAcker {
    async fn ack(&self) -> Result<(), BusError> {
        self.0.ack().await.map_err(connection_error)
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<(), BusError> {
        self.0
            .ack_with(AckKind::Nak(delay))
            .await
            .map_err(connection_error)
    }
}

fn connection_error(err: impl Display) -> BusError {
    BusError::Connection(err.to_string())
}

fn publish_error(subject: &str, err: &jetstream::context::PublishError) -> BusError {
    match err.kind() {
        PublishErrorKind::StreamNotFound => BusError::NoStream {
            subject: subject.to_string(),
        },
        _ => BusError::Connection(err.to_string()),
    }
}

/// JetStream reports missing streams and messages only through its error text.
fn is_not_found(err: &impl Display) -> bool {
    let text = err.to_string().to_ascii_lowercase();
    text.contains("not found") || text.contains("no message found")
}

fn stream_config(config: &StreamConfig) -> jetstream::stream::Config {
    jetstream::stream::Config {
        name: config.name.clone(),
        subjects: config.subjects.clone(),
        max_age: config.max_age.unwrap_or_default(),
        max_messages: limit(config.max_messages),
        max_bytes: limit(config.max_bytes),
        ..Default::default()
    }
}

/// `-1` is unlimited.
fn limit(value: Option<u64>) -> i64 {
    value.map_or(-1, |v| i64::try_from(v).unwrap_or(i64::MAX))
}

fn same_limits(current: &jetstream::stream::Config, desired: &jetstream::stream::Config) -> bool {
    let unlimited = |v: i64| if v <= 0 { -1 } else { v };
    current.subjects == desired.subjects
        && current.max_age == desired.max_age
        && unlimited(current.max_messages) == unlimited(desired.max_messages)
        && unlimited(current.max_bytes) == unlimited(desired.max_bytes)
}
