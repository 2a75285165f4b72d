//! # Error Types
//!
//! Schema errors raised while building, encoding, or decoding envelopes.
//!
//! Every variant here is deterministic: the same bytes fail the same way on
//! every attempt. Delivery layers use that property to classify a
//! `SchemaError` as non-retriable.

use thiserror::Error;

/// Errors produced when an envelope or payload fails structural or
/// semantic validation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    /// The bytes could not be parsed into the expected shape
    /// (invalid JSON, missing required field, wrong type).
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// A required field is present but empty.
    #[error("Missing required field: {field}")]
    MissingField { field: &'static str },

    /// A numeric field lies outside its permitted range.
    #[error("Field {field} out of range: {value} not within [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    /// A field violates a semantic rule (ordering, format, ...).
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    /// The envelope carries a schema version this build cannot read.
    #[error("Unsupported schema version {received} (supported major: {supported_major})")]
    UnsupportedVersion {
        received: String,
        supported_major: u32,
    },

    /// The payload decoded, but not to the event type the consumer declared.
    #[error("Unexpected event type: expected {expected}, got {actual}")]
    UnexpectedEventType {
        expected: &'static str,
        actual: &'static str,
    },
}

impl SchemaError {
    /// Short classification used in DLQ records and metrics labels.
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Malformed(_) | Self::UnsupportedVersion { .. } => "SchemaError",
            Self::UnexpectedEventType { .. } => "SchemaError",
            Self::MissingField { .. } | Self::OutOfRange { .. } | Self::InvalidValue { .. } => {
                "ValidationError"
            }
        }
    }
}

impl From<serde_json::Error> for SchemaError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

/// Check that a string field is not blank.
pub(crate) fn require(field: &'static str, value: &str) -> Result<(), SchemaError> {
    if value.trim().is_empty() {
        return Err(SchemaError::MissingField { field });
    }
    Ok(())
}

/// Check that a float lies within `[min, max]` (NaN is rejected).
pub(crate) fn within(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), SchemaError> {
    if value.is_nan() || value < min || value > max {
        return Err(SchemaError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}
