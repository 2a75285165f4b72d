//! # Transport Port
//!
//! The client-side surface the delivery layer needs from a persistent
//! pub/sub substrate: subject routing, durable streams, consumer groups, and
//! acknowledgements. The broker itself is external; adapters implement
//! [`BusConnector`] and [`BusConnection`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::message::Subscription;
use crate::subject::SubjectPattern;
use crate::DEFAULT_PENDING_LIMIT;

/// Errors from transport operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The broker could not be reached or refused the operation.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The operation did not complete in time.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The connection dropped while the operation was in progress.
    #[error("Disconnected from bus")]
    Disconnected,

    /// A durable publish targeted a subject no stream captures.
    #[error("No stream captures subject {subject}")]
    NoStream { subject: String },

    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    #[error("Message {sequence} not found in stream {stream}")]
    MessageNotFound { stream: String, sequence: u64 },

    #[error("Invalid subject {subject:?}: {reason}")]
    InvalidSubject { subject: String, reason: String },

    #[error("Invalid stream configuration: {0}")]
    InvalidStream(String),

    /// A durable name is already bound to a different subject pattern.
    #[error("Durable consumer {durable} is bound to {existing}")]
    ConsumerMismatch { durable: String, existing: String },

    /// The connection was closed by its owner.
    #[error("Connection closed")]
    Closed,
}

impl BusError {
    /// Whether retrying the same operation later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout(_) | Self::Disconnected
        )
    }
}

/// Parameters for opening a connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Broker addresses, tried in order.
    pub servers: Vec<String>,
    /// Client name reported to the broker.
    pub name: String,
    pub connect_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            servers: vec!["nats://localhost:4222".to_string()],
            name: "event-delivery".to_string(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Per-subscription consumer settings.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Load-balance deliveries across members of the same group.
    pub queue_group: Option<String>,
    /// Resumable consumer with acknowledgement tracking.
    pub durable_name: Option<String>,
    /// Capacity of the local delivery queue.
    pub pending_limit: usize,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            queue_group: None,
            durable_name: None,
            pending_limit: DEFAULT_PENDING_LIMIT,
        }
    }
}

/// Persistent stream definition. `None` limits are unlimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub name: String,
    /// Subject patterns captured by the stream.
    pub subjects: Vec<String>,
    pub max_age: Option<Duration>,
    pub max_messages: Option<u64>,
    pub max_bytes: Option<u64>,
}

/// Result of an idempotent stream provisioning call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamProvision {
    Created,
    /// The stream existed with a different configuration, now replaced.
    Updated,
    /// The stream existed with an identical configuration.
    Unchanged,
}

/// Confirmation of a durable publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub stream: String,
    pub sequence: u64,
}

/// Snapshot of a stream's state.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub config: StreamConfig,
    pub messages: u64,
    pub bytes: u64,
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub first_timestamp: Option<DateTime<Utc>>,
}

/// A message stored in a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub stream: String,
    pub sequence: u64,
    pub subject: String,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// Opens connections to a bus.
#[async_trait]
pub trait BusConnector: Send + Sync {
    async fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn BusConnection>, BusError>;
}

/// A live connection. Owned by exactly one publisher or subscriber.
#[async_trait]
pub trait BusConnection: Send + Sync {
    /// Fire-and-forget publish. Streams whose subjects match still store it.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Publish and wait for a stream to confirm storage.
    async fn publish_durable(&self, subject: &str, payload: Vec<u8>)
        -> Result<PublishAck, BusError>;

    async fn subscribe(
        &self,
        pattern: &SubjectPattern,
        options: ConsumerOptions,
    ) -> Result<Subscription, BusError>;

    /// Create the stream, or bring an existing one to `config`.
    async fn ensure_stream(&self, config: StreamConfig) -> Result<StreamProvision, BusError>;

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo, BusError>;

    /// All retained messages, oldest first.
    async fn stream_messages(&self, stream: &str) -> Result<Vec<StoredMessage>, BusError>;

    async fn get_message(&self, stream: &str, sequence: u64) -> Result<StoredMessage, BusError>;

    async fn delete_message(&self, stream: &str, sequence: u64) -> Result<(), BusError>;

    /// Wait until previously published messages reached the broker.
    async fn flush(&self) -> Result<(), BusError>;

    /// Release the connection and end its subscriptions.
    async fn close(&self) -> Result<(), BusError>;

    fn is_connected(&self) -> bool;
}
