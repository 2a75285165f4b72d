//! Delivery attempt metadata, tracked beside (never inside) the envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::HandlerError;

/// Per-message attempt history.
///
/// `retry_timestamps` and `retry_errors` stay aligned and their length is
/// always `retry_count`. Only retriable failures are recorded there; the
/// final non-retriable failure is kept in `error_type` / `last_error`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryMetadata {
    pub retry_count: u32,
    pub retry_timestamps: Vec<DateTime<Utc>>,
    pub retry_errors: Vec<String>,
    pub error_type: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub consumer_service: String,
    pub consumer_version: String,
    pub handler_name: String,
    /// Handler invocations made for this delivery.
    #[serde(default)]
    pub attempts: u32,
}

impl DeliveryMetadata {
    pub fn new(
        consumer_service: impl Into<String>,
        consumer_version: impl Into<String>,
        handler_name: impl Into<String>,
    ) -> Self {
        Self {
            consumer_service: consumer_service.into(),
            consumer_version: consumer_version.into(),
            handler_name: handler_name.into(),
            ..Self::default()
        }
    }

    /// Count a handler invocation and return its 1-based attempt number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Append a retriable failure to the history.
    pub fn record_retry(&mut self, error: &HandlerError) {
        self.retry_count += 1;
        self.retry_timestamps.push(Utc::now());
        self.retry_errors.push(error.to_string());
        self.error_type = Some(error.error_type().to_string());
        self.last_error = Some(error.to_string());
    }

    /// Record a failure that ends processing without touching the history.
    pub fn record_terminal(&mut self, error: &HandlerError) {
        self.error_type = Some(error.error_type().to_string());
        self.last_error = Some(error.to_string());
    }

    /// Whether the aligned-history invariant holds.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let count = self.retry_count as usize;
        self.retry_timestamps.len() == count && self.retry_errors.len() == count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_history_stays_aligned() {
        let mut meta = DeliveryMetadata::new("field-service", "1.0.0", "on_field_created");
        assert_eq!(meta.begin_attempt(), 1);
        meta.record_retry(&HandlerError::failed("db down"));
        assert_eq!(meta.begin_attempt(), 2);
        meta.record_retry(&HandlerError::Connection("reset".into()));

        assert_eq!(meta.retry_count, 2);
        assert!(meta.is_consistent());
        assert_eq!(meta.error_type.as_deref(), Some("ConnectionError"));
        assert!(meta.retry_timestamps[0] <= meta.retry_timestamps[1]);
    }

    #[test]
    fn test_terminal_failure_does_not_append_history() {
        let mut meta = DeliveryMetadata::new("svc", "1", "h");
        meta.begin_attempt();
        meta.record_terminal(&HandlerError::validation("bad area"));
        assert_eq!(meta.retry_count, 0);
        assert!(meta.retry_errors.is_empty());
        assert!(meta.is_consistent());
        assert_eq!(meta.error_type.as_deref(), Some("ValidationError"));
    }
}
