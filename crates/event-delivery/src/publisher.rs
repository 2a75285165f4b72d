//! # Publisher
//!
//! Serializes envelopes and sends them to the bus, either fire-and-forget or
//! through a stream (durable). Transport failures are retried with the
//! shared [`RetryPolicy`]; serialization and validation failures are
//! returned immediately and never consume a retry.
//!
//! Every attempt of one logical `publish` call sends the same bytes, so the
//! `event_id` is identical across retries.

use std::sync::Arc;
use std::time::Duration;

use delivery_telemetry::{metric_inc, PUBLISH_RETRIES, PUBLISH_TOTAL};
use serde::{Deserialize, Serialize};
use shared_bus::{validate_subject, BusConnection, BusConnector, BusError};
use shared_types::EventEnvelope;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{BusSettings, DeliveryConfig};
use crate::connection::ConnectionSlot;
use crate::domain::{DeliveryError, RetryPolicy};
use crate::stats::{PublisherMetrics, PublisherStats};

/// Per-call publish options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    /// Require a stream to confirm storage.
    pub durable: bool,
    /// Retry transport failures with the retry policy.
    pub retry: bool,
    /// Per-attempt timeout; the configured publish timeout when `None`.
    pub timeout: Option<Duration>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            durable: false,
            retry: true,
            timeout: None,
        }
    }
}

impl PublishOptions {
    /// Stream-backed publish with retry.
    #[must_use]
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn without_retry(mut self) -> Self {
        self.retry = false;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Confirmation of an accepted publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    /// `None` for raw payloads that do not decode as an envelope.
    pub event_id: Option<Uuid>,
    pub subject: String,
    /// Transport attempts used, including the successful one.
    pub attempts: u32,
    /// Stream position, for durable publishes.
    pub stream_sequence: Option<u64>,
}

/// Publishes envelopes to the bus.
pub struct Publisher {
    connection: ConnectionSlot,
    settings: BusSettings,
    policy: RetryPolicy,
    metrics: PublisherMetrics,
}

impl Publisher {
    pub fn new(config: &DeliveryConfig, connector: Arc<dyn BusConnector>) -> Self {
        Self {
            connection: ConnectionSlot::new(connector, config.bus.clone(), "publisher"),
            settings: config.bus.clone(),
            policy: RetryPolicy::new(&config.retry),
            metrics: PublisherMetrics::default(),
        }
    }

    /// Connect to the bus. A no-op while already connected.
    pub async fn connect(&self) -> Result<(), DeliveryError> {
        self.connection.connect().await.map(|_| ())
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.is_connected().await
    }

    /// Publish one envelope.
    ///
    /// Stamps `source_service` when the envelope has none.
    ///
    /// # Errors
    ///
    /// - `Schema` when the envelope fails validation (never retried)
    /// - `Connection` / `Timeout` once the retry budget is spent
    /// - `NotConnected` before `connect` or after `close`
    pub async fn publish(
        &self,
        subject: &str,
        envelope: &EventEnvelope,
        options: PublishOptions,
    ) -> Result<PublishReceipt, DeliveryError> {
        let mut envelope = envelope.clone();
        if envelope.source_service.is_none() {
            envelope.source_service = Some(self.settings.service_name.clone());
        }

        let payload = match envelope.to_bytes() {
            Ok(payload) => payload,
            Err(err) => {
                self.metrics.record_rejected();
                metric_inc!(PUBLISH_TOTAL, &["rejected"]);
                warn!(
                    subject,
                    event_id = %envelope.event_id,
                    error = %err,
                    "Envelope rejected before publish"
                );
                return Err(err.into());
            }
        };

        self.send(subject, payload, Some(envelope.event_id), options)
            .await
    }

    /// Publish bytes that are already serialized, such as a DLQ replay.
    pub async fn publish_raw(
        &self,
        subject: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<PublishReceipt, DeliveryError> {
        let event_id = serde_json::from_slice::<serde_json::Value>(&payload)
            .ok()
            .and_then(|v| v.get("event_id")?.as_str()?.parse().ok());
        self.send(subject, payload, event_id, options).await
    }

    /// Publish each pair in order, continuing past failures.
    ///
    /// Returns the number of successful publishes.
    pub async fn publish_batch(
        &self,
        events: &[(String, EventEnvelope)],
        options: PublishOptions,
    ) -> usize {
        let mut succeeded = 0;
        for (subject, envelope) in events {
            match self.publish(subject, envelope, options).await {
                Ok(_) => succeeded += 1,
                Err(err) => {
                    debug!(subject = %subject, event_id = %envelope.event_id, error = %err, "Batch item failed");
                }
            }
        }
        info!(total = events.len(), succeeded, "Batch publish finished");
        succeeded
    }

    /// Wait for in-flight publishes, then release the connection.
    pub async fn close(&self) -> Result<(), DeliveryError> {
        self.connection.close().await
    }

    #[must_use]
    pub fn stats(&self) -> PublisherStats {
        self.metrics.snapshot()
    }

    async fn send(
        &self,
        subject: &str,
        payload: Vec<u8>,
        event_id: Option<Uuid>,
        options: PublishOptions,
    ) -> Result<PublishReceipt, DeliveryError> {
        if let Err(err) = validate_subject(subject) {
            self.metrics.record_rejected();
            metric_inc!(PUBLISH_TOTAL, &["rejected"]);
            return Err(err.into());
        }

        // Held until the call returns so `close` waits for it.
        let guard = self.connection.hold().await;
        let Some(connection) = guard.as_ref() else {
            self.metrics.record_failure();
            metric_inc!(PUBLISH_TOTAL, &["failure"]);
            return Err(DeliveryError::NotConnected);
        };

        let per_attempt = options.timeout.unwrap_or(self.settings.publish_timeout);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match send_once(
                connection.as_ref(),
                subject,
                payload.clone(),
                options.durable,
                per_attempt,
            )
            .await
            {
                Ok(stream_sequence) => {
                    self.metrics.record_success();
                    metric_inc!(PUBLISH_TOTAL, &["success"]);
                    debug!(
                        subject,
                        event_id = ?event_id,
                        attempt,
                        durable = options.durable,
                        stream_sequence = ?stream_sequence,
                        "Event published"
                    );
                    return Ok(PublishReceipt {
                        event_id,
                        subject: subject.to_string(),
                        attempts: attempt,
                        stream_sequence,
                    });
                }
                Err(err)
                    if options.retry && err.is_transient() && self.policy.should_retry(attempt) =>
                {
                    let delay = self.policy.delay(attempt);
                    self.metrics.record_retry();
                    metric_inc!(PUBLISH_RETRIES);
                    warn!(
                        subject,
                        event_id = ?event_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Publish failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    self.metrics.record_failure();
                    metric_inc!(PUBLISH_TOTAL, &["failure"]);
                    error!(
                        subject,
                        event_id = ?event_id,
                        attempt,
                        error = %err,
                        "Publish failed"
                    );
                    return Err(match err {
                        BusError::Timeout(after) => DeliveryError::Timeout(after),
                        other => DeliveryError::Connection(other),
                    });
                }
            }
        }
    }
}

/// One transport attempt, bounded by `limit`.
async fn send_once(
    connection: &dyn BusConnection,
    subject: &str,
    payload: Vec<u8>,
    durable: bool,
    limit: Duration,
) -> Result<Option<u64>, BusError> {
    let attempt = async {
        if durable {
            connection
                .publish_durable(subject, payload)
                .await
                .map(|ack| Some(ack.sequence))
        } else {
            connection.publish(subject, payload).await.map(|()| None)
        }
    };
    timeout(limit, attempt)
        .await
        .unwrap_or(Err(BusError::Timeout(limit)))
}
