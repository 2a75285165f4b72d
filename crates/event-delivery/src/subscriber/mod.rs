//! # Subscriber
//!
//! Registers handlers for subject patterns and dispatches inbound messages
//! under a bounded handler pool.
//!
//! ## Lifecycle
//!
//! 1. `connect` opens the bus connection and provisions the DLQ stream.
//! 2. `subscribe` adds routes; each route runs its own receive loop.
//! 3. `close` stops the receive loops, waits up to `shutdown_grace` for
//!    in-flight handlers, cancels whatever is left (unacknowledged, so the
//!    bus redelivers it), then releases the connection.
//!
//! ## Concurrency
//!
//! A single semaphore of `max_concurrent_messages` permits is shared by all
//! routes. A handler task holds its permit for the whole retry loop, so the
//! number of messages being processed never exceeds the limit.

mod dispatch;
mod routing;

pub use dispatch::DispatchOutcome;

use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use shared_bus::{BusConnector, ConsumerOptions, SubjectPattern};
use shared_types::EventType;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::DeliveryConfig;
use crate::connection::ConnectionSlot;
use crate::dlq::DlqRouter;
use crate::domain::{DeliveryError, DlqSubjects, RetryPolicy};
use crate::handler::EventHandler;
use crate::stats::{SubscriberMetrics, SubscriberStats};

use dispatch::{Dispatcher, RouteBinding};
use routing::{spawn_route, Route, RoutingTable};

/// Per-subscription options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeOptions {
    /// Payload type the route accepts; anything else is dead-lettered.
    pub event_type: Option<EventType>,
    /// Load-balance across subscriber instances sharing the group.
    pub queue_group: Option<String>,
    /// Resumable, acknowledged delivery.
    pub durable_name: Option<String>,
    /// Acknowledge after the handler succeeds.
    pub auto_ack: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            event_type: None,
            queue_group: None,
            durable_name: None,
            auto_ack: true,
        }
    }
}

impl SubscribeOptions {
    #[must_use]
    pub fn for_event(event_type: EventType) -> Self {
        Self {
            event_type: Some(event_type),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_queue_group(mut self, group: impl Into<String>) -> Self {
        self.queue_group = Some(group.into());
        self
    }

    #[must_use]
    pub fn with_durable(mut self, name: impl Into<String>) -> Self {
        self.durable_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn without_auto_ack(mut self) -> Self {
        self.auto_ack = false;
        self
    }
}

/// Dispatches bus messages to registered handlers.
pub struct Subscriber {
    connection: ConnectionSlot,
    config: DeliveryConfig,
    subjects: DlqSubjects,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<SubscriberMetrics>,
    permits: Arc<Semaphore>,
    routes: Mutex<RoutingTable>,
    force_cancel: watch::Sender<bool>,
    closed: watch::Sender<bool>,
}

impl Subscriber {
    /// # Errors
    ///
    /// Fails when the DLQ subject prefix is not a valid subject.
    pub fn new(
        config: &DeliveryConfig,
        connector: Arc<dyn BusConnector>,
    ) -> Result<Self, DeliveryError> {
        let subjects = DlqSubjects::from_config(config);
        let router = if config.dlq.enabled {
            Some(DlqRouter::new(config)?)
        } else {
            None
        };
        let metrics = Arc::new(SubscriberMetrics::default());
        let (force_cancel, cancel) = watch::channel(false);
        let dispatcher = Dispatcher {
            policy: RetryPolicy::new(&config.retry).with_dlq_subjects(subjects.clone()),
            router,
            metrics: metrics.clone(),
            handler_timeout: config.concurrency.handler_timeout,
            consumer_service: config.bus.service_name.clone(),
            consumer_version: config.bus.service_version.clone(),
            cancel,
        };

        Ok(Self {
            connection: ConnectionSlot::new(connector, config.bus.clone(), "subscriber"),
            config: config.clone(),
            subjects,
            dispatcher: Arc::new(dispatcher),
            metrics,
            permits: Arc::new(Semaphore::new(config.concurrency.max_concurrent_messages.max(1))),
            routes: Mutex::new(RoutingTable::default()),
            force_cancel,
            closed: watch::channel(false).0,
        })
    }

    /// Connect and provision the DLQ stream. A no-op while connected.
    pub async fn connect(&self) -> Result<(), DeliveryError> {
        if !self.connection.connect().await? {
            return Ok(());
        }
        self.force_cancel.send_replace(false);
        self.closed.send_replace(false);

        if let Some(router) = &self.dispatcher.router {
            let connection = self.connection.get().await?;
            if let Err(err) = router.provision(connection.as_ref()).await {
                let _ = self.connection.close().await;
                return Err(err);
            }
        }
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.is_connected().await
    }

    /// Register `handler` for `subject` (exact or wildcard).
    ///
    /// # Errors
    ///
    /// `AlreadySubscribed` when `subject` is already registered and
    /// `OutsideNamespace` when it is neither rooted in the namespace nor
    /// under the DLQ prefix.
    pub async fn subscribe(
        &self,
        subject: &str,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> Result<(), DeliveryError> {
        if !self.subjects.in_namespace(subject) && !self.subjects.is_dlq_subject(subject) {
            return Err(DeliveryError::OutsideNamespace {
                subject: subject.to_string(),
                namespace: self.subjects.namespace().to_string(),
            });
        }
        let mut routes = self.routes.lock().await;
        if routes.contains(subject) {
            return Err(DeliveryError::AlreadySubscribed(subject.to_string()));
        }

        let pattern = SubjectPattern::parse(subject)?;
        let connection = self.connection.get().await?;
        let subscription = connection
            .subscribe(
                &pattern,
                ConsumerOptions {
                    queue_group: options.queue_group.clone(),
                    durable_name: options.durable_name.clone(),
                    pending_limit: self.config.concurrency.pending_messages_limit,
                },
            )
            .await?;

        let binding = RouteBinding {
            subject: subject.to_string(),
            handler: handler.clone(),
            event_type: options.event_type,
            auto_ack: options.auto_ack,
            skip: self.dead_letter_filter(subject),
        };
        let route = spawn_route(
            subscription,
            Arc::new(binding),
            self.dispatcher.clone(),
            connection,
            self.permits.clone(),
        );
        routes.insert(subject.to_string(), route);

        info!(
            subject,
            handler = handler.name(),
            event_type = ?options.event_type.map(|t| t.as_str()),
            queue_group = ?options.queue_group,
            durable = ?options.durable_name,
            "Subscribed"
        );
        Ok(())
    }

    /// Remove the route for `subject`. In-flight handlers finish normally.
    pub async fn unsubscribe(&self, subject: &str) -> Result<(), DeliveryError> {
        let route = self
            .routes
            .lock()
            .await
            .remove(subject)
            .ok_or_else(|| DeliveryError::NotSubscribed(subject.to_string()))?;
        drop(route.stop().await);
        info!(subject, "Unsubscribed");
        Ok(())
    }

    /// Subjects currently registered.
    pub async fn subscriptions(&self) -> Vec<String> {
        self.routes.lock().await.subjects()
    }

    /// Registered subjects whose pattern matches `subject`.
    pub async fn routes_for(&self, subject: &str) -> Vec<String> {
        self.routes.lock().await.matching(subject)
    }

    /// Block until `close` completes.
    pub async fn run(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Dispatch until `signal` resolves, then close.
    pub async fn run_until<F>(&self, signal: F) -> Result<(), DeliveryError>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            () = signal => self.close().await,
            () = self.run() => Ok(()),
        }
    }

    /// Stop every route, drain in-flight handlers, and disconnect.
    pub async fn close(&self) -> Result<(), DeliveryError> {
        let routes = self.routes.lock().await.drain();
        let subscriptions: Vec<_> = join_all(routes.into_iter().map(Route::stop))
            .await
            .into_iter()
            .flatten()
            .collect();

        self.drain().await;
        // Unacknowledged deliveries go back to the bus with the subscriptions.
        drop(subscriptions);

        let result = self.connection.close().await;
        self.closed.send_replace(true);
        result
    }

    #[must_use]
    pub fn stats(&self) -> SubscriberStats {
        self.metrics.snapshot()
    }

    async fn drain(&self) {
        let max = u32::try_from(self.config.concurrency.max_concurrent_messages.max(1))
            .unwrap_or(u32::MAX);
        let grace = self.config.concurrency.shutdown_grace;

        if let Ok(Ok(permits)) = timeout(grace, self.permits.acquire_many(max)).await {
            drop(permits);
            info!("In-flight handlers drained");
            return;
        }

        warn!(
            in_flight = self.metrics.snapshot().in_flight,
            grace_ms = grace.as_millis() as u64,
            "Shutdown grace expired, cancelling in-flight handlers"
        );
        self.force_cancel.send_replace(true);
        match timeout(grace, self.permits.acquire_many(max)).await {
            Ok(Ok(permits)) => drop(permits),
            _ => warn!("Handlers did not stop after cancellation"),
        }
    }

    /// Dead letters are skipped unless the route itself targets the DLQ.
    fn dead_letter_filter(&self, subject: &str) -> Option<SubjectPattern> {
        if self.subjects.is_dlq_subject(subject) {
            return None;
        }
        SubjectPattern::parse(&format!("{}.>", self.subjects.prefix())).ok()
    }
}
