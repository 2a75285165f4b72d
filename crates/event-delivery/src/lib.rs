//! # Event Delivery
//!
//! At-least-once publish/subscribe on top of a persistent bus, with bounded
//! retry and a Dead Letter Queue for messages that cannot be processed.
//!
//! ## Flow
//!
//! ```text
//! Publisher ──► bus ──► Subscriber ──► handler
//!                            │  retriable failure: backoff, retry
//!                            │  exhausted / permanent
//!                            ▼
//!                        DlqRouter ──► <prefix>.<original subject>
//!                                            │
//!                           DlqManager ◄─────┤ list / replay / archive
//!                           DlqMonitor ◄─────┘ depth gauge + alerts
//! ```
//!
//! ## Guarantees
//!
//! - A message is acknowledged only after its handler succeeded or its DLQ
//!   record was durably stored.
//! - Handler invocations never exceed `max_concurrent_messages`.
//! - A route never receives the DLQ's own traffic unless it subscribes to
//!   the DLQ prefix explicitly.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod config;
mod connection;
pub mod dlq;
pub mod domain;
pub mod handler;
pub mod publisher;
pub mod stats;
pub mod subscriber;

pub use config::{
    BusSettings, ConcurrencyConfig, ConfigError, DeliveryConfig, DlqConfig, RetryConfig,
};
pub use dlq::{
    AlertSeverity, AlertSink, ArchiveReport, ArchiveSink, BulkReplayReport, CallbackAlertSink,
    DlqAlert, DlqFilter, DlqManager, DlqMonitor, DlqPage, DlqRouter, DlqStats, JsonLinesArchive,
    LogAlertSink, MemoryArchive, ReplayItem, ReplayOutcome, WebhookAlertSink, MAX_PAGE_SIZE,
};
pub use domain::{
    DeliveryError, DeliveryMetadata, DlqEntry, DlqRecord, DlqSubjects, HandlerError,
    RetryPolicy,
};
pub use handler::{handler_fn, EventHandler};
pub use publisher::{PublishOptions, PublishReceipt, Publisher};
pub use stats::{PublisherStats, SubscriberStats};
pub use subscriber::{DispatchOutcome, SubscribeOptions, Subscriber};
