//! Shared fixtures for the integration tests.

pub mod concurrency;
pub mod dlq_manager;
pub mod monitor;
pub mod scenarios;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use event_delivery::{
    handler_fn, DeliveryConfig, DlqFilter, DlqManager, EventHandler, HandlerError, MemoryArchive,
    Publisher, Subscriber,
};
use shared_bus::{BusConnection, BusConnector, ConnectOptions, InMemoryBus, StreamConfig};
use shared_types::{EventEnvelope, EventPayload, FieldCreated, GeoPoint};

/// Short retry delays so scenarios finish quickly in real time.
pub fn fast_config() -> DeliveryConfig {
    let mut config = DeliveryConfig::default();
    config.bus.service_name = "integration".into();
    config.retry.max_attempts = 3;
    config.retry.initial_delay = Duration::from_millis(5);
    config.retry.max_delay = Duration::from_millis(20);
    config.concurrency.shutdown_grace = Duration::from_secs(1);
    config
}

/// Everything a scenario needs, wired to one in-memory bus.
pub struct World {
    pub bus: InMemoryBus,
    pub config: DeliveryConfig,
    pub publisher: Arc<Publisher>,
    pub subscriber: Subscriber,
    pub manager: DlqManager,
}

impl World {
    pub async fn start(config: DeliveryConfig) -> Self {
        let bus = InMemoryBus::new();
        let connector: Arc<dyn BusConnector> = Arc::new(bus.clone());

        let publisher = Arc::new(Publisher::new(&config, connector.clone()));
        publisher.connect().await.expect("publisher connects");
        let subscriber = Subscriber::new(&config, connector.clone()).expect("valid config");
        subscriber.connect().await.expect("subscriber connects");
        let manager = DlqManager::new(
            &config,
            connector,
            publisher.clone(),
            Arc::new(MemoryArchive::new()),
        );
        if config.dlq.enabled {
            manager.connect().await.expect("manager connects");
        }

        Self {
            bus,
            config,
            publisher,
            subscriber,
            manager,
        }
    }

    /// A raw connection for provisioning streams in tests.
    pub async fn raw_connection(&self) -> Arc<dyn BusConnection> {
        self.bus
            .connect(&ConnectOptions::default())
            .await
            .expect("raw connection")
    }

    /// Persist everything under `<prefix>.>` so durable routes can be used.
    pub async fn stream(&self, name: &str, prefix: &str) {
        self.raw_connection()
            .await
            .ensure_stream(StreamConfig {
                name: name.into(),
                subjects: vec![format!("{prefix}.>")],
                max_age: None,
                max_messages: None,
                max_bytes: None,
            })
            .await
            .expect("stream provisioned");
    }

    pub async fn dlq_total(&self) -> usize {
        self.manager
            .list(1, 100, &DlqFilter::default())
            .await
            .expect("dlq listing")
            .total
    }
}

pub fn field_created(field_id: &str) -> EventEnvelope {
    EventEnvelope::new(EventPayload::FieldCreated(FieldCreated {
        field_id: field_id.into(),
        farm_id: "farm-1".into(),
        name: "North paddock".into(),
        area_hectares: 12.5,
        centroid: GeoPoint::new(52.1, 5.3),
        crop_type: Some("wheat".into()),
    }))
    .with_tenant("tenant-a")
}

/// Handler returning `outcome(call_number)` and counting calls.
pub fn scripted_handler<F>(calls: Arc<AtomicU32>, outcome: F) -> Arc<dyn EventHandler>
where
    F: Fn(u32) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    let outcome = Arc::new(outcome);
    handler_fn("scripted", move |_envelope: EventEnvelope| {
        let calls = calls.clone();
        let outcome = outcome.clone();
        async move {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            outcome(call)
        }
    })
}

/// Poll `condition` for up to two seconds.
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
