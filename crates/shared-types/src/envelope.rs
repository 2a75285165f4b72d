//! # Event Envelope
//!
//! The unit of data interchange on the bus. An envelope carries identity,
//! timing, and scoping metadata around exactly one [`EventPayload`].
//!
//! ## Identity
//!
//! - `event_id` is assigned once at construction. Retries of the same
//!   envelope reuse it; a new emission builds a new envelope.
//! - Delivery metadata (retry counts, errors) never lives inside the
//!   envelope. Subscribers track it alongside.
//!
//! ## Wire Format
//!
//! JSON. `to_bytes` and `from_slice` are the only supported codec pair;
//! `from_slice` validates the schema version and every payload range, so a
//! returned `Err` is always a deterministic [`SchemaError`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{EventPayload, EventType, Validate};
use crate::errors::{require, SchemaError};

/// Schema version stamped on newly built envelopes.
pub const SCHEMA_VERSION: &str = "1.0";

/// Major schema version this build can read.
pub const SUPPORTED_MAJOR: u32 = 1;

/// A typed event ready to publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique per logical emission.
    pub event_id: Uuid,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// `major.minor`; only the major is checked on decode.
    pub schema_version: String,
    /// Emitting service. The publisher fills it when absent.
    #[serde(default)]
    pub source_service: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Shared by causally related events.
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub payload: EventPayload,
}

impl EventEnvelope {
    /// Wrap a payload with a fresh id and the current time.
    #[must_use]
    pub fn new(payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            schema_version: SCHEMA_VERSION.to_string(),
            source_service: None,
            tenant_id: None,
            correlation_id: None,
            payload,
        }
    }

    #[must_use]
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    #[must_use]
    pub fn with_source_service(mut self, service: impl Into<String>) -> Self {
        self.source_service = Some(service.into());
        self
    }

    /// Override the generated id (used when rebuilding a known emission).
    #[must_use]
    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Mark this event as a consequence of `parent`.
    ///
    /// The tenant is inherited. The correlation id is the parent's
    /// correlation id, or the parent's `event_id` when it has none.
    #[must_use]
    pub fn caused_by(mut self, parent: &EventEnvelope) -> Self {
        if self.tenant_id.is_none() {
            self.tenant_id = parent.tenant_id.clone();
        }
        self.correlation_id = Some(
            parent
                .correlation_id
                .clone()
                .unwrap_or_else(|| parent.event_id.to_string()),
        );
        self
    }

    #[must_use]
    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    /// Check the schema version, metadata, and payload ranges.
    pub fn validate(&self) -> Result<(), SchemaError> {
        check_version(&self.schema_version)?;
        if let Some(service) = &self.source_service {
            require("source_service", service)?;
        }
        if let Some(tenant) = &self.tenant_id {
            require("tenant_id", tenant)?;
        }
        self.payload.validate()
    }

    /// Fail unless the payload is of the declared type.
    pub fn expect_type(&self, expected: EventType) -> Result<(), SchemaError> {
        let actual = self.event_type();
        if actual != expected {
            return Err(SchemaError::UnexpectedEventType {
                expected: expected.as_str(),
                actual: actual.as_str(),
            });
        }
        Ok(())
    }

    /// Validate and encode.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SchemaError> {
        self.validate()?;
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode and validate.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SchemaError> {
        let envelope: Self = serde_json::from_slice(bytes)?;
        envelope.validate()?;
        Ok(envelope)
    }
}

fn check_version(version: &str) -> Result<(), SchemaError> {
    let major = version
        .split('.')
        .next()
        .and_then(|m| m.parse::<u32>().ok());
    match major {
        Some(SUPPORTED_MAJOR) => Ok(()),
        _ => Err(SchemaError::UnsupportedVersion {
            received: version.to_string(),
            supported_major: SUPPORTED_MAJOR,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{FieldCreated, GeoPoint, HazardLevel, WeatherAlert, WeatherHazard};

    fn field_created() -> EventPayload {
        EventPayload::FieldCreated(FieldCreated {
            field_id: "field-1".into(),
            farm_id: "farm-1".into(),
            name: "South block".into(),
            area_hectares: 3.141_592_653_589_793,
            centroid: GeoPoint::new(-33.868_820_1, 151.209_295_5),
            crop_type: None,
        })
    }

    #[test]
    fn test_new_assigns_identity() {
        let a = EventEnvelope::new(field_created());
        let b = EventEnvelope::new(field_created());
        assert_ne!(a.event_id, b.event_id);
        assert_eq!(a.schema_version, SCHEMA_VERSION);
        assert!(a.source_service.is_none());
    }

    #[test]
    fn test_round_trip_preserves_every_field() {
        let envelope = EventEnvelope::new(field_created())
            .with_tenant("tenant-a")
            .with_correlation_id("corr-1")
            .with_source_service("field-service");

        let bytes = envelope.to_bytes().unwrap();
        let decoded = EventEnvelope::from_slice(&bytes).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_caused_by_propagates_scope() {
        let parent = EventEnvelope::new(field_created()).with_tenant("tenant-a");
        let child = EventEnvelope::new(field_created()).caused_by(&parent);
        assert_eq!(child.tenant_id.as_deref(), Some("tenant-a"));
        assert_eq!(child.correlation_id, Some(parent.event_id.to_string()));

        let grandchild = EventEnvelope::new(field_created()).caused_by(&child);
        assert_eq!(grandchild.correlation_id, child.correlation_id);
    }

    #[test]
    fn test_missing_required_field_is_schema_error() {
        let mut value = serde_json::to_value(EventEnvelope::new(field_created())).unwrap();
        value.as_object_mut().unwrap().remove("event_id");
        let bytes = serde_json::to_vec(&value).unwrap();
        assert!(matches!(
            EventEnvelope::from_slice(&bytes),
            Err(SchemaError::Malformed(_))
        ));
    }

    #[test]
    fn test_out_of_range_coordinates_rejected_on_decode() {
        let mut envelope = EventEnvelope::new(EventPayload::WeatherAlert(WeatherAlert {
            field_id: None,
            location: GeoPoint::new(45.0, 7.0),
            hazard: WeatherHazard::Hail,
            level: HazardLevel::Extreme,
            starts_at: Utc::now(),
            ends_at: None,
            message: "Hail cell approaching".into(),
        }));
        if let EventPayload::WeatherAlert(alert) = &mut envelope.payload {
            alert.location.latitude = 123.0;
        }
        // Encode without validation to simulate a foreign producer.
        let bytes = serde_json::to_vec(&envelope).unwrap();
        let err = EventEnvelope::from_slice(&bytes).unwrap_err();
        assert_eq!(err.error_type(), "ValidationError");
        assert!(envelope.to_bytes().is_err());
    }

    #[test]
    fn test_unsupported_major_version() {
        let mut envelope = EventEnvelope::new(field_created());
        envelope.schema_version = "2.0".into();
        let bytes = serde_json::to_vec(&envelope).unwrap();
        assert!(matches!(
            EventEnvelope::from_slice(&bytes),
            Err(SchemaError::UnsupportedVersion { supported_major: 1, .. })
        ));

        envelope.schema_version = "1.7".into();
        assert!(envelope.validate().is_ok());
    }

    #[test]
    fn test_expect_type() {
        let envelope = EventEnvelope::new(field_created());
        assert!(envelope.expect_type(EventType::FieldCreated).is_ok());
        assert_eq!(
            envelope.expect_type(EventType::TaskCreated),
            Err(SchemaError::UnexpectedEventType {
                expected: "task_created",
                actual: "field_created",
            })
        );
    }
}
