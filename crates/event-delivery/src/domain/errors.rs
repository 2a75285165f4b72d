//! # Error Taxonomy
//!
//! [`HandlerError`] is what a handler returns; its variant alone decides
//! whether the dispatcher retries. [`DeliveryError`] is returned by the
//! public publisher, subscriber, and DLQ operations.
//!
//! | Variant | Retriable | `error_type` |
//! |---------|-----------|--------------|
//! | `Connection` | yes | `ConnectionError` |
//! | `Timeout` | yes | `TimeoutError` |
//! | `Failed` | yes | `HandlerError` |
//! | `Schema` | no | `SchemaError` / `ValidationError` |
//! | `Validation` | no | `ValidationError` |
//! | `Permanent` | no | `HandlerError` |

use std::fmt::Display;
use std::time::Duration;

use shared_bus::BusError;
use shared_types::SchemaError;
use thiserror::Error;

use crate::config::ConfigError;

/// Failure reported by an event handler.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HandlerError {
    /// A downstream dependency could not be reached.
    #[error("connection error: {0}")]
    Connection(String),

    /// The handler did not finish in time.
    #[error("handler timed out after {0:?}")]
    Timeout(Duration),

    /// The payload is malformed or out of range.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// The payload is well formed but violates a business rule.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Business logic failed; may succeed on retry.
    #[error("handler failed: {0}")]
    Failed(String),

    /// Business logic failed and will fail again.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn failed(reason: impl Display) -> Self {
        Self::Failed(reason.to_string())
    }

    pub fn permanent(reason: impl Display) -> Self {
        Self::Permanent(reason.to_string())
    }

    pub fn validation(reason: impl Display) -> Self {
        Self::Validation(reason.to_string())
    }

    /// Whether the dispatcher may invoke the handler again.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout(_) | Self::Failed(_)
        )
    }

    /// Classification recorded in DLQ records and metrics.
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Connection(_) => "ConnectionError",
            Self::Timeout(_) => "TimeoutError",
            Self::Schema(err) => err.error_type(),
            Self::Validation(_) => "ValidationError",
            Self::Failed(_) | Self::Permanent(_) => "HandlerError",
        }
    }
}

impl From<BusError> for HandlerError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Timeout(after) => Self::Timeout(after),
            other => Self::Connection(other.to_string()),
        }
    }
}

/// Errors returned by the delivery API.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("not connected to the bus")]
    NotConnected,

    #[error(transparent)]
    Connection(#[from] BusError),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("already subscribed to {0}")]
    AlreadySubscribed(String),

    #[error("not subscribed to {0}")]
    NotSubscribed(String),

    #[error("subject {subject} is outside namespace {namespace}")]
    OutsideNamespace { subject: String, namespace: String },

    /// Publishing the DLQ record failed; the original was not acknowledged.
    #[error("failed to publish DLQ record to {subject}: {reason}")]
    DlqPublish { subject: String, reason: String },

    #[error("dead letter queue is disabled")]
    DlqDisabled,

    #[error("DLQ record {0} not found")]
    RecordNotFound(u64),

    #[error("DLQ record {sequence} is unreadable: {reason}")]
    InvalidRecord { sequence: u64, reason: String },

    #[error("archive failed: {0}")]
    Archive(String),

    #[error("alert delivery failed: {0}")]
    Alert(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl DeliveryError {
    /// Whether the same call may succeed later.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection(err) => err.is_transient(),
            Self::Timeout(_) => true,
            _ => false,
        }
    }
}
