//! # Per-Message Dispatch
//!
//! ```text
//! Received ──► Dispatched ──► Acked
//!                  │  ▲
//!          retriable  │ backoff
//!                  ▼  │
//!               Retrying
//!                  │ exhausted / non-retriable
//!                  ▼
//!             MovedToDlq  (original acked after the DLQ publish)
//! ```
//!
//! The retry loop is iterative. A message's attempts run strictly in
//! sequence; the bus position does not advance until the loop ends.

use std::sync::Arc;
use std::time::Duration;

use delivery_telemetry::{
    metric_inc, GaugeGuard, HistogramTimer, DLQ_PUBLISH_FAILURES, HANDLERS_IN_FLIGHT,
    HANDLER_DURATION, HANDLER_OUTCOMES, HANDLER_RETRIES,
};
use shared_bus::{BusConnection, InboundMessage, SubjectPattern};
use shared_types::{EventEnvelope, EventType, SchemaError};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::dlq::DlqRouter;
use crate::domain::{DeliveryMetadata, HandlerError, RetryPolicy};
use crate::handler::EventHandler;
use crate::stats::SubscriberMetrics;

/// Terminal result of dispatching one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handler succeeded and the message was acknowledged.
    Acked,
    /// Handler succeeded on a route without automatic acknowledgement.
    Handled,
    /// A DLQ record was stored and the original acknowledged.
    MovedToDlq,
    /// The DLQ publish failed; the original was negatively acknowledged.
    Nacked,
    /// Failed with the DLQ disabled; acknowledged and discarded.
    Dropped,
    /// Shutdown forced the handler to stop; left unacknowledged.
    Abandoned,
}

impl DispatchOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acked => "acked",
            Self::Handled => "handled",
            Self::MovedToDlq => "moved_to_dlq",
            Self::Nacked => "nacked",
            Self::Dropped => "dropped",
            Self::Abandoned => "abandoned",
        }
    }
}

/// What a registered route dispatches to.
pub(crate) struct RouteBinding {
    pub(crate) subject: String,
    pub(crate) handler: Arc<dyn EventHandler>,
    pub(crate) event_type: Option<EventType>,
    pub(crate) auto_ack: bool,
    /// Dead letters this route acknowledges without dispatching.
    pub(crate) skip: Option<SubjectPattern>,
}

impl RouteBinding {
    pub(crate) fn skips(&self, subject: &str) -> bool {
        self.skip.as_ref().is_some_and(|p| p.matches(subject))
    }
}

/// Shared by every handler task of one subscriber.
pub(crate) struct Dispatcher {
    pub(crate) policy: RetryPolicy,
    pub(crate) router: Option<DlqRouter>,
    pub(crate) metrics: Arc<SubscriberMetrics>,
    pub(crate) handler_timeout: Duration,
    pub(crate) consumer_service: String,
    pub(crate) consumer_version: String,
    /// Flips to `true` when shutdown gives up waiting.
    pub(crate) cancel: watch::Receiver<bool>,
}

impl Dispatcher {
    pub(crate) async fn dispatch(
        &self,
        connection: &dyn BusConnection,
        route: &RouteBinding,
        message: InboundMessage,
    ) -> DispatchOutcome {
        let outcome = self.run(connection, route, &message).await;
        self.record(outcome);
        outcome
    }

    async fn run(
        &self,
        connection: &dyn BusConnection,
        route: &RouteBinding,
        message: &InboundMessage,
    ) -> DispatchOutcome {
        let mut metadata = DeliveryMetadata::new(
            self.consumer_service.clone(),
            self.consumer_version.clone(),
            route.handler.name(),
        );

        let envelope = match decode(&message.payload, route.event_type) {
            Ok(envelope) => envelope,
            Err(err) => {
                let err = HandlerError::Schema(err);
                metadata.record_terminal(&err);
                warn!(
                    subject = %message.subject,
                    handler = route.handler.name(),
                    error = %err,
                    "Message failed to decode"
                );
                return self
                    .dead_letter(connection, message, None, metadata, &err.to_string())
                    .await;
            }
        };

        loop {
            let attempt = metadata.begin_attempt();
            debug!(
                subject = %message.subject,
                event_id = %envelope.event_id,
                attempt,
                "Dispatching"
            );

            let result = tokio::select! {
                biased;
                _ = cancelled(self.cancel.clone()) => return self.abandon(message, attempt),
                result = self.invoke(route.handler.as_ref(), &envelope) => result,
            };

            let err = match result {
                Ok(()) => return self.complete(message, route, &envelope, attempt).await,
                Err(err) => err,
            };
            self.metrics.record_handler_failure();

            if !err.is_retriable() {
                metadata.record_terminal(&err);
                warn!(
                    subject = %message.subject,
                    event_id = %envelope.event_id,
                    attempt,
                    error_type = err.error_type(),
                    error = %err,
                    "Non-retriable handler failure"
                );
                return self
                    .dead_letter(connection, message, Some(&envelope), metadata, &err.to_string())
                    .await;
            }

            metadata.record_retry(&err);
            if !self.policy.should_retry(attempt) {
                let reason = format!("retries exhausted after {attempt} attempts: {err}");
                warn!(
                    subject = %message.subject,
                    event_id = %envelope.event_id,
                    attempt,
                    error_type = err.error_type(),
                    "Retries exhausted"
                );
                return self
                    .dead_letter(connection, message, Some(&envelope), metadata, &reason)
                    .await;
            }

            let delay = self.policy.delay(attempt);
            self.metrics.record_retry();
            metric_inc!(HANDLER_RETRIES);
            info!(
                subject = %message.subject,
                event_id = %envelope.event_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Handler failed, retrying"
            );
            tokio::select! {
                biased;
                _ = cancelled(self.cancel.clone()) => return self.abandon(message, attempt),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn invoke(
        &self,
        handler: &dyn EventHandler,
        envelope: &EventEnvelope,
    ) -> Result<(), HandlerError> {
        let _timer = HistogramTimer::new(&HANDLER_DURATION);
        let _in_flight = GaugeGuard::new(&HANDLERS_IN_FLIGHT);
        let _tracked = self.metrics.track_in_flight();
        tokio::time::timeout(self.handler_timeout, handler.handle(envelope))
            .await
            .unwrap_or(Err(HandlerError::Timeout(self.handler_timeout)))
    }

    async fn complete(
        &self,
        message: &InboundMessage,
        route: &RouteBinding,
        envelope: &EventEnvelope,
        attempts: u32,
    ) -> DispatchOutcome {
        debug!(
            subject = %message.subject,
            event_id = %envelope.event_id,
            attempts,
            "Handler succeeded"
        );
        if !route.auto_ack {
            return DispatchOutcome::Handled;
        }
        if let Err(err) = message.ack().await {
            // The bus redelivers; the handler must tolerate the duplicate.
            warn!(subject = %message.subject, event_id = %envelope.event_id, error = %err, "Ack failed");
        }
        DispatchOutcome::Acked
    }

    async fn dead_letter(
        &self,
        connection: &dyn BusConnection,
        message: &InboundMessage,
        envelope: Option<&EventEnvelope>,
        metadata: DeliveryMetadata,
        reason: &str,
    ) -> DispatchOutcome {
        let Some(router) = &self.router else {
            error!(
                subject = %message.subject,
                error_type = ?metadata.error_type,
                attempts = metadata.attempts,
                reason,
                "DLQ disabled, dropping failed message"
            );
            ack_or_warn(message).await;
            return DispatchOutcome::Dropped;
        };

        match router
            .route(connection, message, envelope, metadata, reason)
            .await
        {
            Ok(_) => {
                ack_or_warn(message).await;
                DispatchOutcome::MovedToDlq
            }
            Err(err) => {
                metric_inc!(DLQ_PUBLISH_FAILURES);
                let delay = self.policy.delay(1);
                error!(
                    subject = %message.subject,
                    error = %err,
                    redeliver_ms = delay.as_millis() as u64,
                    "DLQ publish failed, message left for redelivery"
                );
                if let Err(err) = message.nak(Some(delay)).await {
                    warn!(subject = %message.subject, error = %err, "Nak failed");
                }
                DispatchOutcome::Nacked
            }
        }
    }

    fn abandon(&self, message: &InboundMessage, attempt: u32) -> DispatchOutcome {
        warn!(
            subject = %message.subject,
            attempt,
            "Shutdown grace expired, leaving message unacknowledged"
        );
        DispatchOutcome::Abandoned
    }

    fn record(&self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Acked => self.metrics.record_acked(),
            DispatchOutcome::Handled => self.metrics.record_handled(),
            DispatchOutcome::MovedToDlq => self.metrics.record_moved_to_dlq(),
            DispatchOutcome::Nacked => self.metrics.record_dlq_failure(),
            DispatchOutcome::Dropped => self.metrics.record_dropped(),
            DispatchOutcome::Abandoned => self.metrics.record_abandoned(),
        }
        metric_inc!(HANDLER_OUTCOMES, &[outcome.as_str()]);
    }
}

fn decode(payload: &[u8], expected: Option<EventType>) -> Result<EventEnvelope, SchemaError> {
    let envelope = EventEnvelope::from_slice(payload)?;
    if let Some(expected) = expected {
        envelope.expect_type(expected)?;
    }
    Ok(envelope)
}

async fn ack_or_warn(message: &InboundMessage) {
    if let Err(err) = message.ack().await {
        warn!(subject = %message.subject, error = %err, "Ack failed");
    }
}

/// Resolves once `cancel` is `true`; never when the sender is gone.
async fn cancelled(mut cancel: watch::Receiver<bool>) {
    if cancel.wait_for(|cancel| *cancel).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeliveryConfig, RetryConfig};
    use crate::domain::{DlqRecord, DlqSubjects};
    use crate::handler::handler_fn;
    use shared_bus::{BusConnector, ConnectOptions, InMemoryBus};
    use shared_types::{EventPayload, FieldDeleted, TaskCompleted};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Harness {
        bus: InMemoryBus,
        connection: Arc<dyn BusConnection>,
        dispatcher: Dispatcher,
        _cancel: watch::Sender<bool>,
    }

    async fn harness(dlq_enabled: bool) -> Harness {
        let mut config = DeliveryConfig::default();
        config.dlq.enabled = dlq_enabled;
        harness_with(config).await
    }

    async fn harness_with(config: DeliveryConfig) -> Harness {
        let bus = InMemoryBus::new();
        let connection = bus.connect(&ConnectOptions::default()).await.unwrap();
        let router = if config.dlq.enabled {
            let router = DlqRouter::new(&config).unwrap();
            router.provision(connection.as_ref()).await.unwrap();
            Some(router)
        } else {
            None
        };
        let (cancel_tx, cancel) = watch::channel(false);
        let dispatcher = Dispatcher {
            policy: RetryPolicy::new(&RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
                backoff_multiplier: 2.0,
            })
            .with_dlq_subjects(DlqSubjects::from_config(&config)),
            router,
            metrics: Arc::new(SubscriberMetrics::default()),
            handler_timeout: Duration::from_secs(5),
            consumer_service: "field-service".into(),
            consumer_version: "1.0.0".into(),
            cancel,
        };
        Harness {
            bus,
            connection,
            dispatcher,
            _cancel: cancel_tx,
        }
    }

    fn route(handler: Arc<dyn EventHandler>) -> RouteBinding {
        RouteBinding {
            subject: "ns.field.deleted".into(),
            handler,
            event_type: Some(EventType::FieldDeleted),
            auto_ack: true,
            skip: None,
        }
    }

    fn message() -> InboundMessage {
        let envelope = EventEnvelope::new(EventPayload::FieldDeleted(FieldDeleted {
            field_id: "f-1".into(),
            reason: Some("merged".into()),
        }));
        InboundMessage::core("ns.field.deleted", envelope.to_bytes().unwrap())
    }

    fn counting(calls: Arc<AtomicU32>, fail_until: u32, error: HandlerError) -> Arc<dyn EventHandler> {
        handler_fn("on_field_deleted", move |_envelope: EventEnvelope| {
            let calls = calls.clone();
            let error = error.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= fail_until {
                    Err(error)
                } else {
                    Ok(())
                }
            }
        })
    }

    fn dlq_records(bus: &InMemoryBus) -> Vec<DlqRecord> {
        bus.published_to("ns.dlq.field.deleted")
            .iter()
            .map(|r| DlqRecord::from_slice(&r.payload).unwrap())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_second_attempt() {
        let h = harness(true).await;
        let calls = Arc::new(AtomicU32::new(0));
        let route = route(counting(calls.clone(), 1, HandlerError::failed("db busy")));

        let outcome = h.dispatcher.dispatch(h.connection.as_ref(), &route, message()).await;
        assert_eq!(outcome, DispatchOutcome::Acked);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(dlq_records(&h.bus).is_empty());
        let stats = h.dispatcher.metrics.snapshot();
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_move_to_dlq() {
        let h = harness(true).await;
        let calls = Arc::new(AtomicU32::new(0));
        let route = route(counting(calls.clone(), u32::MAX, HandlerError::failed("db down")));

        let outcome = h.dispatcher.dispatch(h.connection.as_ref(), &route, message()).await;
        assert_eq!(outcome, DispatchOutcome::MovedToDlq);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let records = dlq_records(&h.bus);
        assert_eq!(records.len(), 1);
        let delivery = &records[0].delivery;
        assert_eq!(delivery.retry_count, 3);
        assert_eq!(delivery.attempts, 3);
        assert!(delivery.is_consistent());
        assert_eq!(delivery.handler_name, "on_field_deleted");
        assert!(records[0].failure_reason.contains("exhausted"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retriable_error_skips_retries() {
        let h = harness(true).await;
        let calls = Arc::new(AtomicU32::new(0));
        let route = route(counting(calls.clone(), u32::MAX, HandlerError::permanent("unknown field")));

        let outcome = h.dispatcher.dispatch(h.connection.as_ref(), &route, message()).await;
        assert_eq!(outcome, DispatchOutcome::MovedToDlq);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let records = dlq_records(&h.bus);
        assert_eq!(records[0].delivery.retry_count, 0);
        assert_eq!(records[0].error_type, "HandlerError");
    }

    #[tokio::test]
    async fn test_wrong_event_type_never_reaches_handler() {
        let h = harness(true).await;
        let calls = Arc::new(AtomicU32::new(0));
        let route = route(counting(calls.clone(), 0, HandlerError::failed("unused")));
        let other = EventEnvelope::new(EventPayload::TaskCompleted(TaskCompleted {
            task_id: "t-1".into(),
            completed_by: "u-1".into(),
            completed_at: chrono::Utc::now(),
        }));
        let message = InboundMessage::core("ns.field.deleted", other.to_bytes().unwrap());

        let outcome = h.dispatcher.dispatch(h.connection.as_ref(), &route, message).await;
        assert_eq!(outcome, DispatchOutcome::MovedToDlq);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let records = dlq_records(&h.bus);
        assert_eq!(records[0].error_type, "SchemaError");
        assert_eq!(records[0].event_id, Some(other.event_id));
    }

    #[tokio::test]
    async fn test_dlq_publish_failure_nacks() {
        let h = harness(true).await;
        h.bus.inject_publish_failures(1, Some("ns.dlq.>")).unwrap();
        let route = route(counting(Arc::new(AtomicU32::new(0)), u32::MAX, HandlerError::validation("bad")));

        let outcome = h.dispatcher.dispatch(h.connection.as_ref(), &route, message()).await;
        assert_eq!(outcome, DispatchOutcome::Nacked);
        assert_eq!(h.dispatcher.metrics.snapshot().dlq_failures, 1);
    }

    #[tokio::test]
    async fn test_custom_dlq_prefix_is_routable() {
        let mut config = DeliveryConfig::default();
        config.dlq.subject_prefix = "events.dlq".into();
        let h = harness_with(config).await;
        let route = route(counting(Arc::new(AtomicU32::new(0)), u32::MAX, HandlerError::permanent("gone")));

        let outcome = h.dispatcher.dispatch(h.connection.as_ref(), &route, message()).await;
        assert_eq!(outcome, DispatchOutcome::MovedToDlq);
        assert_eq!(h.bus.published_to("events.dlq.field.deleted").len(), 1);
        assert!(dlq_records(&h.bus).is_empty());
    }

    #[tokio::test]
    async fn test_dlq_disabled_drops() {
        let h = harness(false).await;
        let route = route(counting(Arc::new(AtomicU32::new(0)), u32::MAX, HandlerError::permanent("no")));

        let outcome = h.dispatcher.dispatch(h.connection.as_ref(), &route, message()).await;
        assert_eq!(outcome, DispatchOutcome::Dropped);
        assert_eq!(h.dispatcher.metrics.snapshot().dropped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_timeout_is_retriable() {
        let mut h = harness(true).await;
        h.dispatcher.handler_timeout = Duration::from_millis(50);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let slow = handler_fn("slow", move |_envelope: EventEnvelope| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            }
        });

        let outcome = h.dispatcher.dispatch(h.connection.as_ref(), &route(slow), message()).await;
        assert_eq!(outcome, DispatchOutcome::MovedToDlq);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(dlq_records(&h.bus)[0].error_type, "TimeoutError");
    }

    #[tokio::test]
    async fn test_manual_ack_route_reports_handled() {
        let h = harness(true).await;
        let mut route = route(counting(Arc::new(AtomicU32::new(0)), 0, HandlerError::failed("x")));
        route.auto_ack = false;

        let outcome = h.dispatcher.dispatch(h.connection.as_ref(), &route, message()).await;
        assert_eq!(outcome, DispatchOutcome::Handled);
        assert_eq!(h.dispatcher.metrics.snapshot().handled, 1);
    }

    #[test]
    fn test_skip_pattern() {
        let mut binding = route(counting(Arc::new(AtomicU32::new(0)), 0, HandlerError::failed("x")));
        assert!(!binding.skips("ns.dlq.field.deleted"));
        binding.skip = Some(SubjectPattern::parse("ns.dlq.>").unwrap());
        assert!(binding.skips("ns.dlq.field.deleted"));
        assert!(!binding.skips("ns.field.deleted"));
    }
}
