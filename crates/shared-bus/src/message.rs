//! # Inbound Messages and Subscriptions
//!
//! A [`Subscription`] yields [`InboundMessage`]s. Durable deliveries carry an
//! acknowledgement handle; core deliveries carry a no-op one, so callers can
//! ack uniformly.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tracing::debug;

use crate::subject::SubjectPattern;
use crate::transport::BusError;

/// Delivery metadata supplied by the bus.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryInfo {
    /// Stream that stored the message, if any.
    pub stream: Option<String>,
    pub stream_sequence: Option<u64>,
    /// How many times the bus has delivered this message (1 on first delivery).
    pub delivered: u32,
    /// Durable consumer the delivery belongs to.
    pub durable: Option<String>,
}

/// Acknowledgement channel back to the bus.
#[async_trait]
pub trait Acker: Send + Sync {
    /// Processing finished; do not redeliver.
    async fn ack(&self) -> Result<(), BusError>;

    /// Processing failed; redeliver after `delay` (immediately when `None`).
    async fn nak(&self, delay: Option<Duration>) -> Result<(), BusError>;
}

/// Acker for deliveries without acknowledgement tracking.
pub struct NoopAcker;

#[async_trait]
impl Acker for NoopAcker {
    async fn ack(&self) -> Result<(), BusError> {
        Ok(())
    }

    async fn nak(&self, _delay: Option<Duration>) -> Result<(), BusError> {
        Ok(())
    }
}

/// A message received from a subscription.
pub struct InboundMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    pub info: DeliveryInfo,
    acker: Arc<dyn Acker>,
}

impl InboundMessage {
    pub fn new(
        subject: impl Into<String>,
        payload: Vec<u8>,
        info: DeliveryInfo,
        acker: Arc<dyn Acker>,
    ) -> Self {
        Self {
            subject: subject.into(),
            payload,
            info,
            acker,
        }
    }

    /// A fire-and-forget delivery.
    pub fn core(subject: impl Into<String>, payload: Vec<u8>) -> Self {
        Self::new(
            subject,
            payload,
            DeliveryInfo {
                delivered: 1,
                ..DeliveryInfo::default()
            },
            Arc::new(NoopAcker),
        )
    }

    /// True when the bus tracks acknowledgements for this delivery.
    #[must_use]
    pub fn is_durable(&self) -> bool {
        self.info.durable.is_some()
    }

    pub async fn ack(&self) -> Result<(), BusError> {
        self.acker.ack().await
    }

    pub async fn nak(&self, delay: Option<Duration>) -> Result<(), BusError> {
        self.acker.nak(delay).await
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .field("info", &self.info)
            .finish()
    }
}

type DropHook = Box<dyn FnOnce() + Send + Sync>;

/// A live subscription.
///
/// When dropped, the subscription is unregistered from the bus and any
/// unacknowledged durable deliveries become eligible for redelivery.
pub struct Subscription {
    pattern: SubjectPattern,
    receiver: mpsc::Receiver<InboundMessage>,
    on_drop: Option<DropHook>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("pattern", &self.pattern)
            .field("has_on_drop", &self.on_drop.is_some())
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub fn new(
        pattern: SubjectPattern,
        receiver: mpsc::Receiver<InboundMessage>,
        on_drop: Option<DropHook>,
    ) -> Self {
        Self {
            pattern,
            receiver,
            on_drop,
        }
    }

    /// Receive the next message; `None` once the bus ended the subscription.
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        self.receiver.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<InboundMessage> {
        self.receiver.try_recv().ok()
    }

    #[must_use]
    pub fn pattern(&self) -> &SubjectPattern {
        &self.pattern
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hook) = self.on_drop.take() {
            hook();
        }
        debug!(pattern = %self.pattern, "Subscription dropped");
    }
}

impl Stream for Subscription {
    type Item = InboundMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
