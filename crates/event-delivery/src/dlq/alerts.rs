//! Alert sinks for the DLQ monitor.
//!
//! The monitor hands each alert to every registered [`AlertSink`]. A failing
//! sink is logged and does not prevent the others from running.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::domain::DeliveryError;

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Depth above the threshold.
    Warning,
    /// Depth at or above twice the threshold.
    Critical,
}

impl AlertSeverity {
    /// Classify a depth that already exceeds `threshold`.
    #[must_use]
    pub fn for_depth(depth: u64, threshold: u64) -> Self {
        if depth >= threshold.saturating_mul(2) {
            Self::Critical
        } else {
            Self::Warning
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// A DLQ depth alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqAlert {
    pub severity: AlertSeverity,
    pub stream: String,
    pub depth: u64,
    pub threshold: u64,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

impl DlqAlert {
    #[must_use]
    pub fn new(stream: impl Into<String>, depth: u64, threshold: u64) -> Self {
        let stream = stream.into();
        let severity = AlertSeverity::for_depth(depth, threshold);
        Self {
            message: format!(
                "DLQ stream {stream} holds {depth} messages (threshold {threshold})"
            ),
            severity,
            stream,
            depth,
            threshold,
            raised_at: Utc::now(),
        }
    }
}

/// Receives alerts raised by the monitor.
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, alert: &DlqAlert) -> Result<(), DeliveryError>;
}

/// Writes alerts to the log.
#[derive(Debug, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, alert: &DlqAlert) -> Result<(), DeliveryError> {
        match alert.severity {
            AlertSeverity::Critical => error!(
                stream = %alert.stream,
                depth = alert.depth,
                threshold = alert.threshold,
                "CRITICAL: {}", alert.message
            ),
            AlertSeverity::Warning => warn!(
                stream = %alert.stream,
                depth = alert.depth,
                threshold = alert.threshold,
                "{}", alert.message
            ),
        }
        Ok(())
    }
}

/// POSTs alerts as JSON, retrying failed deliveries a bounded number of times.
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
    max_attempts: u32,
    backoff: Duration,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| DeliveryError::Alert(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        })
    }

    #[must_use]
    pub fn with_retry(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff = backoff;
        self
    }

    async fn post(&self, alert: &DlqAlert) -> Result<(), String> {
        let response = self
            .client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(format!("webhook responded with {status}"))
        }
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, alert: &DlqAlert) -> Result<(), DeliveryError> {
        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            match self.post(alert).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(url = %self.url, attempt, error = %err, "Alert webhook failed");
                    last_error = err;
                }
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(self.backoff * attempt).await;
            }
        }
        Err(DeliveryError::Alert(last_error))
    }
}

type AlertCallback = Box<dyn Fn(&DlqAlert) + Send + Sync>;

/// Invokes a closure for each alert.
pub struct CallbackAlertSink {
    name: String,
    callback: AlertCallback,
}

impl CallbackAlertSink {
    pub fn new<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&DlqAlert) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            callback: Box::new(callback),
        }
    }
}

#[async_trait]
impl AlertSink for CallbackAlertSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, alert: &DlqAlert) -> Result<(), DeliveryError> {
        (self.callback)(alert);
        Ok(())
    }
}
