//! # Handler Pool Tests
//!
//! The subscriber runs at most `max_concurrent_messages` handlers at once,
//! across all of its routes, and shutdown lets running handlers finish.

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use event_delivery::{handler_fn, EventHandler, PublishOptions, SubscribeOptions};
    use shared_types::EventEnvelope;

    use crate::integration::{eventually, fast_config, field_created, World};

    /// Tracks how many handler bodies overlap.
    #[derive(Default)]
    struct Occupancy {
        current: AtomicUsize,
        peak: AtomicUsize,
        finished: AtomicUsize,
    }

    fn slow_handler(occupancy: Arc<Occupancy>, work: Duration) -> Arc<dyn EventHandler> {
        handler_fn("slow", move |_envelope: EventEnvelope| {
            let occupancy = occupancy.clone();
            async move {
                let now = occupancy.current.fetch_add(1, Ordering::SeqCst) + 1;
                occupancy.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(work).await;
                occupancy.current.fetch_sub(1, Ordering::SeqCst);
                occupancy.finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    async fn world_with_pool(size: usize) -> World {
        let mut config = fast_config();
        config.concurrency.max_concurrent_messages = size;
        World::start(config).await
    }

    #[tokio::test]
    async fn test_in_flight_handlers_never_exceed_pool_size() {
        let world = world_with_pool(3).await;
        let occupancy = Arc::new(Occupancy::default());
        world
            .subscriber
            .subscribe(
                "ns.field.created",
                slow_handler(occupancy.clone(), Duration::from_millis(30)),
                SubscribeOptions::default(),
            )
            .await
            .unwrap();

        for i in 0..12 {
            world
                .publisher
                .publish(
                    "ns.field.created",
                    &field_created(&format!("f-{i}")),
                    PublishOptions::default(),
                )
                .await
                .unwrap();
        }

        assert!(eventually(|| world.subscriber.stats().acked == 12).await);
        let peak = occupancy.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency {peak}");
        assert!(peak >= 2, "handlers never overlapped");
        assert_eq!(world.subscriber.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_routes_share_one_pool() {
        let world = world_with_pool(2).await;
        let occupancy = Arc::new(Occupancy::default());
        for subject in ["ns.field.created", "ns.task.created"] {
            world
                .subscriber
                .subscribe(
                    subject,
                    slow_handler(occupancy.clone(), Duration::from_millis(20)),
                    SubscribeOptions::default(),
                )
                .await
                .unwrap();
        }

        for i in 0..5 {
            let envelope = field_created(&format!("f-{i}"));
            world
                .publisher
                .publish("ns.field.created", &envelope, PublishOptions::default())
                .await
                .unwrap();
            // The route does not pin an event type, so any valid envelope is fine.
            world
                .publisher
                .publish("ns.task.created", &envelope, PublishOptions::default())
                .await
                .unwrap();
        }

        assert!(eventually(|| world.subscriber.stats().acked == 10).await);
        assert!(occupancy.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_close_waits_for_running_handlers() {
        let world = world_with_pool(4).await;
        let occupancy = Arc::new(Occupancy::default());
        world
            .subscriber
            .subscribe(
                "ns.field.created",
                slow_handler(occupancy.clone(), Duration::from_millis(100)),
                SubscribeOptions::default(),
            )
            .await
            .unwrap();

        for i in 0..3 {
            world
                .publisher
                .publish(
                    "ns.field.created",
                    &field_created(&format!("f-{i}")),
                    PublishOptions::default(),
                )
                .await
                .unwrap();
        }
        assert!(eventually(|| occupancy.current.load(Ordering::SeqCst) == 3).await);

        world.subscriber.close().await.unwrap();

        assert_eq!(occupancy.finished.load(Ordering::SeqCst), 3);
        let stats = world.subscriber.stats();
        assert_eq!(stats.acked, 3);
        assert_eq!(stats.abandoned, 0);
        assert!(!world.subscriber.is_connected().await);
    }
}
