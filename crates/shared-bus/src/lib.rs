//! # Shared Bus - Transport Port for Event Delivery
//!
//! The client-side contract the delivery layer needs from a persistent
//! pub/sub substrate, an in-memory implementation of it, and a NATS
//! JetStream adapter for deployments.
//!
//! ## Model
//!
//! ```text
//! ┌──────────────┐  publish()          ┌──────────────┐
//! │  Publisher   │ ──────┐             │  Subscriber  │
//! └──────────────┘       │             └──────────────┘
//!                        ▼                     ↑
//!                  ┌──────────────┐            │ InboundMessage
//!                  │     Bus      │ ───────────┘ ack() / nak()
//!                  │  (streams,   │
//!                  │  consumers)  │
//!                  └──────────────┘
//! ```
//!
//! - **Subjects** are dot-delimited; patterns use `*` and a trailing `>`.
//! - **Streams** persist captured subjects with retention limits.
//! - **Durable consumers** track acknowledgements and redeliver on nak.
//! - **Queue groups** spread deliveries across members.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod memory;
pub mod message;
pub mod nats;
pub mod subject;
pub mod transport;

// Re-export main types
pub use memory::{InMemoryBus, PublishedRecord};
pub use message::{Acker, DeliveryInfo, InboundMessage, NoopAcker, Subscription};
pub use nats::{NatsConnection, NatsConnector};
pub use subject::{validate_subject, SubjectPattern};
pub use transport::{
    BusConnection, BusConnector, BusError, ConnectOptions, ConsumerOptions, PublishAck,
    StoredMessage, StreamConfig, StreamInfo, StreamProvision,
};

/// Default capacity of a subscription's local delivery queue.
pub const DEFAULT_PENDING_LIMIT: usize = 1000;
