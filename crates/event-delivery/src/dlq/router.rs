//! # DLQ Router
//!
//! Wraps a failed message with its attempt history and publishes the record
//! to the DLQ stream. The caller acknowledges the original only after
//! [`DlqRouter::route`] succeeds.

use std::time::Duration;

use delivery_telemetry::{metric_inc, DLQ_ROUTED};
use shared_bus::{
    BusConnection, BusError, InboundMessage, PublishAck, StreamConfig, StreamProvision,
    SubjectPattern,
};
use shared_types::EventEnvelope;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{DeliveryConfig, DlqConfig};
use crate::domain::{DeliveryError, DeliveryMetadata, DlqRecord, DlqSubjects};

/// Publishes DLQ records and provisions the DLQ stream.
#[derive(Debug, Clone)]
pub struct DlqRouter {
    config: DlqConfig,
    subjects: DlqSubjects,
    captured: SubjectPattern,
    publish_timeout: Duration,
}

impl DlqRouter {
    /// # Errors
    ///
    /// `Connection(InvalidSubject)` when the subject prefix is not a valid
    /// subject.
    pub fn new(config: &DeliveryConfig) -> Result<Self, DeliveryError> {
        let subjects = DlqSubjects::from_config(config);
        let captured = SubjectPattern::parse(&format!("{}.>", subjects.prefix()))?;
        Ok(Self {
            config: config.dlq.clone(),
            subjects,
            captured,
            publish_timeout: config.bus.publish_timeout,
        })
    }

    /// Mapping from original subjects to the subjects this router publishes on.
    #[must_use]
    pub fn subjects(&self) -> &DlqSubjects {
        &self.subjects
    }

    /// Stream definition for the DLQ.
    #[must_use]
    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            name: self.config.stream_name.clone(),
            subjects: vec![self.captured.as_str().to_string()],
            max_age: Some(self.config.max_age),
            max_messages: Some(self.config.max_messages),
            max_bytes: Some(self.config.max_bytes),
        }
    }

    #[must_use]
    pub fn stream_name(&self) -> &str {
        &self.config.stream_name
    }

    /// Whether `subject` lands in the DLQ stream.
    #[must_use]
    pub fn captures(&self, subject: &str) -> bool {
        self.captured.matches(subject)
    }

    /// Create the DLQ stream or bring its limits up to date.
    ///
    /// Safe to run from every subscriber instance at startup.
    pub async fn provision(
        &self,
        connection: &dyn BusConnection,
    ) -> Result<StreamProvision, DeliveryError> {
        let provision = connection.ensure_stream(self.stream_config()).await?;
        match provision {
            StreamProvision::Created => {
                info!(stream = %self.config.stream_name, subjects = %self.captured, "DLQ stream created");
            }
            StreamProvision::Updated => {
                info!(stream = %self.config.stream_name, "DLQ stream limits updated");
            }
            StreamProvision::Unchanged => {
                debug!(stream = %self.config.stream_name, "DLQ stream already provisioned");
            }
        }
        Ok(provision)
    }

    /// Publish a DLQ record for `message`.
    ///
    /// # Errors
    ///
    /// `DlqPublish` when the record could not be stored.
    pub async fn route(
        &self,
        connection: &dyn BusConnection,
        message: &InboundMessage,
        envelope: Option<&EventEnvelope>,
        metadata: DeliveryMetadata,
        reason: &str,
    ) -> Result<PublishAck, DeliveryError> {
        let subject = self.subjects.dlq_subject(&message.subject);
        let record = DlqRecord::new(
            message.subject.clone(),
            &message.payload,
            message.is_durable(),
            envelope,
            reason,
            metadata,
        );
        let payload = record.to_bytes().map_err(|e| DeliveryError::DlqPublish {
            subject: subject.clone(),
            reason: e.to_string(),
        })?;

        let published = timeout(
            self.publish_timeout,
            connection.publish_durable(&subject, payload),
        )
        .await
        .unwrap_or(Err(BusError::Timeout(self.publish_timeout)));

        match published {
            Ok(ack) => {
                metric_inc!(DLQ_ROUTED, &[record.error_type.as_str()]);
                warn!(
                    original_subject = %message.subject,
                    dlq_subject = %subject,
                    event_id = ?record.event_id,
                    error_type = %record.error_type,
                    retry_count = record.delivery.retry_count,
                    sequence = ack.sequence,
                    "Message moved to DLQ"
                );
                Ok(ack)
            }
            Err(err) => Err(DeliveryError::DlqPublish {
                subject,
                reason: err.to_string(),
            }),
        }
    }
}
