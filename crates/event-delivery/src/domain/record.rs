//! # DLQ Records
//!
//! A [`DlqRecord`] is the original message plus its failure history. It is
//! written once by the router; the manager only rewrites the replay fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared_bus::StoredMessage;
use shared_types::{EventEnvelope, SchemaError};
use uuid::Uuid;

use crate::domain::errors::DeliveryError;
use crate::domain::metadata::DeliveryMetadata;

/// A dead-lettered message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqRecord {
    /// Present when the original decoded far enough to carry an id.
    pub event_id: Option<Uuid>,
    pub event_type: Option<String>,
    pub original_subject: String,
    /// Original bytes, as UTF-8 text.
    pub original_payload: String,
    /// Whether the original arrived through a stream.
    #[serde(default)]
    pub original_durable: bool,
    pub failure_reason: String,
    pub failure_timestamp: DateTime<Utc>,
    pub error_type: String,
    pub delivery: DeliveryMetadata,
    #[serde(default)]
    pub replayed: bool,
    #[serde(default)]
    pub replay_count: u32,
    #[serde(default)]
    pub last_replayed_at: Option<DateTime<Utc>>,
}

impl DlqRecord {
    pub fn new(
        original_subject: impl Into<String>,
        original_payload: &[u8],
        original_durable: bool,
        envelope: Option<&EventEnvelope>,
        failure_reason: impl Into<String>,
        delivery: DeliveryMetadata,
    ) -> Self {
        let error_type = delivery
            .error_type
            .clone()
            .unwrap_or_else(|| "HandlerError".to_string());
        Self {
            event_id: envelope.map(|e| e.event_id).or_else(|| peek_event_id(original_payload)),
            event_type: envelope.map(|e| e.event_type().as_str().to_string()),
            original_subject: original_subject.into(),
            original_payload: String::from_utf8_lossy(original_payload).into_owned(),
            original_durable,
            failure_reason: failure_reason.into(),
            failure_timestamp: Utc::now(),
            error_type,
            delivery,
            replayed: false,
            replay_count: 0,
            last_replayed_at: None,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Bytes to republish on replay.
    #[must_use]
    pub fn payload_bytes(&self) -> Vec<u8> {
        self.original_payload.as_bytes().to_vec()
    }

    /// Decode the original payload as an envelope.
    pub fn original_envelope(&self) -> Result<EventEnvelope, SchemaError> {
        EventEnvelope::from_slice(self.original_payload.as_bytes())
    }

    /// Stamp a replay that kept the record.
    pub fn mark_replayed(&mut self) {
        self.replayed = true;
        self.replay_count += 1;
        self.last_replayed_at = Some(Utc::now());
    }
}

/// Best-effort id extraction from a payload that failed validation.
fn peek_event_id(payload: &[u8]) -> Option<Uuid> {
    let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
    value.get("event_id")?.as_str()?.parse().ok()
}

/// A record as stored in the DLQ stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEntry {
    pub sequence: u64,
    /// DLQ subject the record was published to.
    pub subject: String,
    pub stored_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub record: DlqRecord,
}

impl DlqEntry {
    pub fn from_stored(message: &StoredMessage) -> Result<Self, DeliveryError> {
        let record =
            DlqRecord::from_slice(&message.payload).map_err(|e| DeliveryError::InvalidRecord {
                sequence: message.sequence,
                reason: e.to_string(),
            })?;
        Ok(Self {
            sequence: message.sequence,
            subject: message.subject.clone(),
            stored_at: message.timestamp,
            size_bytes: message.payload.len() as u64,
            record,
        })
    }
}
