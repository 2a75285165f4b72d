//! # Delivery Runtime
//!
//! Builds every delivery component from configuration and owns their
//! lifecycle. Nothing is a process-wide singleton: each collaborator gets the
//! handles it needs at construction.
//!
//! ## Startup Order
//!
//! 1. Validate configuration
//! 2. Publisher connects
//! 3. Subscriber connects (provisions the DLQ stream) and registers the
//!    audit route on `<namespace>.>`
//! 4. DLQ manager connects
//! 5. DLQ monitor connects and starts polling
//! 6. Admin API starts listening
//!
//! Shutdown runs the same steps in reverse.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod audit;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use dlq_gateway::{AppState, GatewayConfig, GatewayError};
use event_delivery::{
    DeliveryConfig, DlqManager, DlqMonitor, JsonLinesArchive, LogAlertSink, Publisher,
    SubscribeOptions, Subscriber, WebhookAlertSink,
};
use shared_bus::{BusConnector, InMemoryBus, NatsConnector};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use audit::AuditHandler;

/// Server address that selects the in-process bus.
pub const MEMORY_SERVER: &str = "memory://";

/// Bus adapter for the configured servers: the in-process bus when any
/// server is [`MEMORY_SERVER`], NATS otherwise.
#[must_use]
pub fn connector_for(servers: &[String]) -> Arc<dyn BusConnector> {
    if servers.iter().any(|server| server.trim() == MEMORY_SERVER) {
        info!("Using the in-process bus");
        Arc::new(InMemoryBus::new())
    } else {
        info!(servers = ?servers, "Using NATS JetStream");
        Arc::new(NatsConnector)
    }
}

/// Running delivery components.
pub struct DeliveryRuntime {
    publisher: Arc<Publisher>,
    subscriber: Arc<Subscriber>,
    manager: Arc<DlqManager>,
    monitor: Arc<DlqMonitor>,
    audit: Arc<AuditHandler>,
    admin_addr: SocketAddr,
    stop: watch::Sender<bool>,
    monitor_task: JoinHandle<()>,
    gateway_task: JoinHandle<Result<(), GatewayError>>,
}

impl DeliveryRuntime {
    /// Start every component. When a step fails, whatever was already
    /// connected is closed in reverse order before the error is returned.
    pub async fn start(
        config: DeliveryConfig,
        gateway: GatewayConfig,
        connector: Arc<dyn BusConnector>,
    ) -> Result<Self> {
        config.validate().context("invalid delivery configuration")?;
        info!(
            service = %config.bus.service_name,
            namespace = %config.bus.namespace,
            servers = ?config.bus.servers,
            dlq_enabled = config.dlq.enabled,
            "Starting delivery runtime"
        );

        let mut started = Components::default();
        match Self::launch(config, gateway, connector, &mut started).await {
            Ok(runtime) => Ok(runtime),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "Delivery runtime failed to start");
                started.close().await;
                Err(err)
            }
        }
    }

    async fn launch(
        config: DeliveryConfig,
        gateway: GatewayConfig,
        connector: Arc<dyn BusConnector>,
        started: &mut Components,
    ) -> Result<Self> {
        let publisher = Arc::new(Publisher::new(&config, connector.clone()));
        publisher.connect().await.context("publisher failed to connect")?;
        started.publisher = Some(publisher.clone());

        let subscriber = Arc::new(
            Subscriber::new(&config, connector.clone()).context("invalid subscriber settings")?,
        );
        subscriber.connect().await.context("subscriber failed to connect")?;
        started.subscriber = Some(subscriber.clone());

        let audit = Arc::new(AuditHandler::new());
        let audit_subject = format!("{}.>", config.bus.namespace);
        subscriber
            .subscribe(
                &audit_subject,
                audit.clone(),
                SubscribeOptions::default()
                    .with_queue_group(format!("{}-audit", config.bus.service_name)),
            )
            .await
            .with_context(|| format!("failed to subscribe to {audit_subject}"))?;

        let archive = Arc::new(JsonLinesArchive::new(config.dlq.archive_dir.clone()));
        let manager = Arc::new(DlqManager::new(
            &config,
            connector.clone(),
            publisher.clone(),
            archive,
        ));
        manager.connect().await.context("DLQ manager failed to connect")?;
        started.manager = Some(manager.clone());

        let mut monitor = DlqMonitor::new(&config, connector).with_sink(Arc::new(LogAlertSink));
        if let Some(url) = &config.dlq.alert_webhook {
            let webhook = WebhookAlertSink::new(url.clone()).context("invalid alert webhook")?;
            monitor = monitor.with_sink(Arc::new(webhook));
        }
        let monitor = Arc::new(monitor);
        monitor.connect().await.context("DLQ monitor failed to connect")?;
        started.monitor = Some(monitor.clone());

        let listener = dlq_gateway::bind(&gateway)
            .await
            .with_context(|| format!("failed to bind admin API on {}", gateway.listen_addr))?;
        let admin_addr = listener.local_addr().context("admin listener has no address")?;

        // Nothing below can fail.
        let (stop, stopped) = watch::channel(false);
        let monitor_task = monitor.clone().spawn(stopped.clone());
        let state = AppState {
            manager: manager.clone(),
            publisher: publisher.clone(),
            subscriber: Some(subscriber.clone()),
        };
        let gateway_task = tokio::spawn(async move {
            dlq_gateway::serve(listener, state, &gateway, wait_for_stop(stopped)).await
        });

        info!(%admin_addr, audit_subject, "Delivery runtime started");
        Ok(Self {
            publisher,
            subscriber,
            manager,
            monitor,
            audit,
            admin_addr,
            stop,
            monitor_task,
            gateway_task,
        })
    }

    pub fn publisher(&self) -> Arc<Publisher> {
        self.publisher.clone()
    }

    pub fn subscriber(&self) -> Arc<Subscriber> {
        self.subscriber.clone()
    }

    pub fn manager(&self) -> Arc<DlqManager> {
        self.manager.clone()
    }

    pub fn audit(&self) -> Arc<AuditHandler> {
        self.audit.clone()
    }

    /// Address the admin API is bound to.
    pub fn admin_addr(&self) -> SocketAddr {
        self.admin_addr
    }

    /// Stop everything in reverse start order.
    pub async fn shutdown(self) {
        info!("Shutting down delivery runtime");
        self.stop.send_replace(true);

        match self.gateway_task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "Admin API ended with an error"),
            Err(err) => warn!(error = %err, "Admin API task panicked"),
        }
        if let Err(err) = self.monitor_task.await {
            warn!(error = %err, "DLQ monitor task panicked");
        }

        Components {
            publisher: Some(self.publisher),
            subscriber: Some(self.subscriber),
            manager: Some(self.manager),
            monitor: Some(self.monitor),
        }
        .close()
        .await;
        info!(audited = self.audit.seen(), "Delivery runtime stopped");
    }
}

/// Connected components, closed monitor first and publisher last.
#[derive(Default)]
struct Components {
    publisher: Option<Arc<Publisher>>,
    subscriber: Option<Arc<Subscriber>>,
    manager: Option<Arc<DlqManager>>,
    monitor: Option<Arc<DlqMonitor>>,
}

impl Components {
    /// Failures are logged; every component still gets its turn to close.
    async fn close(self) {
        if let Some(monitor) = self.monitor {
            if let Err(err) = monitor.close().await {
                warn!(error = %err, "DLQ monitor close failed");
            }
        }
        if let Some(manager) = self.manager {
            if let Err(err) = manager.close().await {
                warn!(error = %err, "DLQ manager close failed");
            }
        }
        if let Some(subscriber) = self.subscriber {
            if let Err(err) = subscriber.close().await {
                warn!(error = %err, "Subscriber close failed");
            }
        }
        if let Some(publisher) = self.publisher {
            if let Err(err) = publisher.close().await {
                warn!(error = %err, "Publisher close failed");
            }
        }
    }
}

async fn wait_for_stop(mut stopped: watch::Receiver<bool>) {
    while !*stopped.borrow_and_update() {
        if stopped.changed().await.is_err() {
            break;
        }
    }
}
