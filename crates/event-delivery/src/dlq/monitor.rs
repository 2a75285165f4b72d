//! # DLQ Monitor
//!
//! Polls the DLQ depth on a fixed interval, exports it as a gauge, and
//! raises an alert when the depth exceeds the threshold. At most one alert
//! fires per cooldown window, however many polls exceed the threshold
//! within it.

use std::sync::Arc;
use std::time::Duration;

use delivery_telemetry::{metric_inc, DLQ_ALERTS, DLQ_DEPTH};
use parking_lot::Mutex;
use shared_bus::BusConnector;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{DeliveryConfig, DlqConfig};
use crate::connection::ConnectionSlot;
use crate::dlq::alerts::{AlertSink, DlqAlert};
use crate::domain::DeliveryError;

/// Background DLQ depth watcher.
pub struct DlqMonitor {
    connection: ConnectionSlot,
    config: DlqConfig,
    sinks: Vec<Arc<dyn AlertSink>>,
    last_alert: Mutex<Option<Instant>>,
}

impl DlqMonitor {
    pub fn new(config: &DeliveryConfig, connector: Arc<dyn BusConnector>) -> Self {
        Self {
            connection: ConnectionSlot::new(connector, config.bus.clone(), "dlq-monitor"),
            config: config.dlq.clone(),
            sinks: Vec::new(),
            last_alert: Mutex::new(None),
        }
    }

    /// Register a sink. Alerts go to every sink in registration order.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub async fn connect(&self) -> Result<(), DeliveryError> {
        self.connection.connect().await.map(|_| ())
    }

    pub async fn close(&self) -> Result<(), DeliveryError> {
        self.connection.close().await
    }

    /// Current number of messages in the DLQ stream.
    pub async fn depth(&self) -> Result<u64, DeliveryError> {
        let connection = self.connection.get().await?;
        let info = connection.stream_info(&self.config.stream_name).await?;
        Ok(info.messages)
    }

    /// Run one poll. Returns the alert raised, if any.
    pub async fn check(&self) -> Result<Option<DlqAlert>, DeliveryError> {
        let depth = self.depth().await?;
        DLQ_DEPTH.set(depth as f64);

        let threshold = self.config.alert_threshold;
        if depth <= threshold {
            debug!(depth, threshold, "DLQ depth within threshold");
            return Ok(None);
        }

        let now = Instant::now();
        {
            let mut last = self.last_alert.lock();
            if let Some(previous) = *last {
                if now.duration_since(previous) < self.config.alert_cooldown {
                    debug!(depth, threshold, "DLQ alert suppressed by cooldown");
                    return Ok(None);
                }
            }
            *last = Some(now);
        }

        let alert = DlqAlert::new(self.config.stream_name.clone(), depth, threshold);
        metric_inc!(DLQ_ALERTS, &[alert.severity.as_str()]);
        for sink in &self.sinks {
            if let Err(err) = sink.send(&alert).await {
                error!(sink = sink.name(), error = %err, "Alert sink failed");
            }
        }
        Ok(Some(alert))
    }

    /// Poll until `shutdown` flips to `true`. The first poll runs immediately.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let interval = self.config.alert_interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                stream = %self.config.stream_name,
                interval_secs = interval.as_secs(),
                threshold = self.config.alert_threshold,
                "DLQ monitor started"
            );

            loop {
                tokio::select! {
                    _ = stop_requested(&mut shutdown) => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.check().await {
                            warn!(error = %err, "DLQ depth check failed");
                        }
                    }
                }
            }
            info!("DLQ monitor stopped");
        })
    }
}

async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::alerts::{AlertSeverity, CallbackAlertSink};
    use crate::dlq::router::DlqRouter;
    use shared_bus::{BusConnection, ConnectOptions, InMemoryBus};

    fn config(threshold: u64) -> DeliveryConfig {
        let mut config = DeliveryConfig::default();
        config.dlq.alert_threshold = threshold;
        config.dlq.alert_interval = Duration::from_secs(10);
        config.dlq.alert_cooldown = Duration::from_secs(60);
        config
    }

    async fn fill(bus: &InMemoryBus, config: &DeliveryConfig, count: usize) -> Arc<dyn BusConnection> {
        let connection = bus.connect(&ConnectOptions::default()).await.unwrap();
        DlqRouter::new(config)
            .unwrap()
            .provision(connection.as_ref())
            .await
            .unwrap();
        for i in 0..count {
            connection
                .publish_durable(&format!("ns.dlq.field.created.{i}"), b"{}".to_vec())
                .await
                .unwrap();
        }
        connection
    }

    fn recording_sink() -> (Arc<dyn AlertSink>, Arc<Mutex<Vec<DlqAlert>>>) {
        let alerts = Arc::new(Mutex::new(Vec::new()));
        let captured = alerts.clone();
        let sink = CallbackAlertSink::new("test", move |alert: &DlqAlert| {
            captured.lock().push(alert.clone());
        });
        (Arc::new(sink), alerts)
    }

    #[tokio::test]
    async fn test_no_alert_at_threshold() {
        let bus = InMemoryBus::new();
        let config = config(3);
        let _feeder = fill(&bus, &config, 3).await;
        let monitor = DlqMonitor::new(&config, Arc::new(bus.clone()));
        monitor.connect().await.unwrap();

        assert_eq!(monitor.depth().await.unwrap(), 3);
        assert!(monitor.check().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_severity_follows_depth() {
        let bus = InMemoryBus::new();
        let config = config(2);
        let _feeder = fill(&bus, &config, 4).await;
        let monitor = DlqMonitor::new(&config, Arc::new(bus.clone()));
        monitor.connect().await.unwrap();

        let alert = monitor.check().await.unwrap().unwrap();
        assert_eq!(alert.severity, AlertSeverity::Critical);
        assert_eq!(alert.depth, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_suppresses_repeat_alerts() {
        let bus = InMemoryBus::new();
        let config = config(1);
        let _feeder = fill(&bus, &config, 2).await;
        let (sink, alerts) = recording_sink();
        let monitor = DlqMonitor::new(&config, Arc::new(bus.clone())).with_sink(sink);
        monitor.connect().await.unwrap();

        assert!(monitor.check().await.unwrap().is_some());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(monitor.check().await.unwrap().is_none());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(monitor.check().await.unwrap().is_some());
        assert_eq!(alerts.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_loop_stops_on_shutdown() {
        let bus = InMemoryBus::new();
        let config = config(1);
        let _feeder = fill(&bus, &config, 2).await;
        let (sink, alerts) = recording_sink();
        let monitor = Arc::new(DlqMonitor::new(&config, Arc::new(bus.clone())).with_sink(sink));
        monitor.connect().await.unwrap();

        let (stop, stopped) = watch::channel(false);
        let handle = monitor.clone().spawn(stopped);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(alerts.lock().len(), 1);

        stop.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_stream_is_an_error() {
        let bus = InMemoryBus::new();
        let monitor = DlqMonitor::new(&config(1), Arc::new(bus.clone()));
        monitor.connect().await.unwrap();
        assert!(monitor.check().await.is_err());
    }
}
