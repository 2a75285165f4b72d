//! # DLQ Monitor Tests
//!
//! Drives the depth monitor over simulated time against a DLQ filled by
//! real dispatch failures.

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;
    use std::time::Duration;

    use event_delivery::{
        AlertSeverity, CallbackAlertSink, DlqAlert, DlqMonitor, HandlerError, PublishOptions,
        SubscribeOptions,
    };
    use parking_lot::Mutex;
    use shared_types::SchemaError;
    use tokio::sync::watch;

    use crate::integration::{eventually, fast_config, field_created, scripted_handler, World};

    #[tokio::test(start_paused = true)]
    async fn test_alerts_respect_cooldown_until_dlq_drains() {
        let mut config = fast_config();
        config.dlq.alert_threshold = 1;
        config.dlq.alert_interval = Duration::from_secs(10);
        config.dlq.alert_cooldown = Duration::from_secs(60);
        let world = World::start(config).await;

        world
            .subscriber
            .subscribe(
                "ns.field.created",
                scripted_handler(Arc::new(AtomicU32::new(0)), |_| {
                    Err(HandlerError::Schema(SchemaError::Malformed("truncated".into())))
                }),
                SubscribeOptions::default(),
            )
            .await
            .unwrap();
        for id in ["f-500", "f-501"] {
            world
                .publisher
                .publish("ns.field.created", &field_created(id), PublishOptions::default())
                .await
                .unwrap();
        }
        assert!(eventually(|| world.subscriber.stats().moved_to_dlq == 2).await);

        let alerts: Arc<Mutex<Vec<DlqAlert>>> = Arc::default();
        let captured = alerts.clone();
        let monitor = Arc::new(
            DlqMonitor::new(&world.config, Arc::new(world.bus.clone())).with_sink(Arc::new(
                CallbackAlertSink::new("capture", move |alert| captured.lock().push(alert.clone())),
            )),
        );
        monitor.connect().await.unwrap();
        let (stop, shutdown) = watch::channel(false);
        let task = monitor.clone().spawn(shutdown);

        // Polls every 10s; alerts at 0s, 60s and 120s.
        tokio::time::sleep(Duration::from_secs(179)).await;
        {
            let alerts = alerts.lock();
            assert_eq!(alerts.len(), 3);
            assert!(alerts.iter().all(|a| a.depth == 2 && a.threshold == 1));
            assert!(alerts.iter().all(|a| a.severity == AlertSeverity::Critical));
        }

        assert_eq!(world.manager.purge().await.unwrap(), 2);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(alerts.lock().len(), 3);
        assert_eq!(monitor.depth().await.unwrap(), 0);

        stop.send(true).unwrap();
        task.await.unwrap();
    }
}
