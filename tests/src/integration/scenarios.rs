//! # Delivery Scenarios
//!
//! End-to-end flows from publish to handler to DLQ and back:
//!
//! 1. A handler that always fails is invoked `max_attempts` times, then the
//!    message lands in the DLQ with its full retry history.
//! 2. A schema failure is never retried.
//! 3. A handler that recovers leaves no DLQ trace.
//! 4. Replaying a DLQ entry republishes the original bytes.

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use chrono::Utc;
    use event_delivery::{
        DlqFilter, HandlerError, PublishOptions, SubscribeOptions,
    };
    use shared_types::{
        EventEnvelope, EventPayload, EventType, GeoPoint, HazardLevel, SchemaError, WeatherAlert,
        WeatherHazard,
    };

    use crate::integration::{eventually, fast_config, field_created, scripted_handler, World};

    #[tokio::test]
    async fn test_exhausted_retries_move_message_to_dlq() {
        let world = World::start(fast_config()).await;
        let calls = Arc::new(AtomicU32::new(0));
        world
            .subscriber
            .subscribe(
                "ns.field.created",
                scripted_handler(calls.clone(), |_| Err(HandlerError::failed("database locked"))),
                SubscribeOptions::for_event(EventType::FieldCreated),
            )
            .await
            .unwrap();

        let envelope = field_created("f-100");
        world
            .publisher
            .publish("ns.field.created", &envelope, PublishOptions::default())
            .await
            .unwrap();

        assert!(eventually(|| world.subscriber.stats().moved_to_dlq == 1).await);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let page = world.manager.list(1, 10, &DlqFilter::default()).await.unwrap();
        assert_eq!(page.total, 1);
        let entry = &page.entries[0];
        assert_eq!(entry.subject, "ns.dlq.field.created");
        assert_eq!(entry.record.original_subject, "ns.field.created");
        assert_eq!(entry.record.event_id, Some(envelope.event_id));
        assert_eq!(entry.record.error_type, "HandlerError");
        assert_eq!(entry.record.delivery.retry_count, 3);
        assert_eq!(entry.record.delivery.attempts, 3);
        assert_eq!(entry.record.delivery.retry_timestamps.len(), 3);
        assert_eq!(entry.record.delivery.consumer_service, "integration");
    }

    #[tokio::test]
    async fn test_schema_error_goes_straight_to_dlq() {
        let world = World::start(fast_config()).await;
        let calls = Arc::new(AtomicU32::new(0));
        world
            .subscriber
            .subscribe(
                "ns.field.created",
                scripted_handler(calls.clone(), |_| {
                    Err(HandlerError::Schema(SchemaError::Malformed(
                        "centroid missing".into(),
                    )))
                }),
                SubscribeOptions::default(),
            )
            .await
            .unwrap();

        world
            .publisher
            .publish("ns.field.created", &field_created("f-101"), PublishOptions::default())
            .await
            .unwrap();

        assert!(eventually(|| world.subscriber.stats().moved_to_dlq == 1).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let page = world.manager.list(1, 10, &DlqFilter::default()).await.unwrap();
        let record = &page.entries[0].record;
        assert_eq!(record.error_type, "SchemaError");
        assert_eq!(record.delivery.retry_count, 0);
        assert_eq!(record.delivery.attempts, 1);
        assert!(record.delivery.retry_errors.is_empty());
    }

    #[tokio::test]
    async fn test_recovery_on_second_attempt_leaves_no_dlq_entry() {
        let world = World::start(fast_config()).await;
        let calls = Arc::new(AtomicU32::new(0));
        world
            .subscriber
            .subscribe(
                "ns.field.created",
                scripted_handler(calls.clone(), |call| {
                    if call == 1 {
                        Err(HandlerError::Connection("connection reset".into()))
                    } else {
                        Ok(())
                    }
                }),
                SubscribeOptions::default(),
            )
            .await
            .unwrap();

        world
            .publisher
            .publish("ns.field.created", &field_created("f-102"), PublishOptions::default())
            .await
            .unwrap();

        assert!(eventually(|| world.subscriber.stats().acked == 1).await);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(world.subscriber.stats().retries, 1);
        assert_eq!(world.dlq_total().await, 0);
    }

    #[tokio::test]
    async fn test_replay_republishes_original_payload() {
        let world = World::start(fast_config()).await;
        world.stream("WEATHER", "ns.weather").await;

        let calls = Arc::new(AtomicU32::new(0));
        world
            .subscriber
            .subscribe(
                "ns.weather.alert",
                scripted_handler(calls.clone(), |_| Err(HandlerError::permanent("no farm for location"))),
                SubscribeOptions::for_event(EventType::WeatherAlert).with_durable("weather-alerts"),
            )
            .await
            .unwrap();

        let envelope = EventEnvelope::new(EventPayload::WeatherAlert(WeatherAlert {
            field_id: None,
            location: GeoPoint::new(-33.9, 151.2),
            hazard: WeatherHazard::Frost,
            level: HazardLevel::Extreme,
            starts_at: Utc::now(),
            ends_at: None,
            message: "hard frost overnight".into(),
        }));
        world
            .publisher
            .publish("ns.weather.alert", &envelope, PublishOptions::durable())
            .await
            .unwrap();
        assert!(eventually(|| world.subscriber.stats().moved_to_dlq == 1).await);

        // Stop consuming so the replayed copy stays observable.
        world.subscriber.unsubscribe("ns.weather.alert").await.unwrap();

        let original = world.bus.published_to("ns.weather.alert");
        assert_eq!(original.len(), 1);

        let page = world.manager.list(1, 10, &DlqFilter::default()).await.unwrap();
        assert_eq!(page.total, 1);
        let sequence = page.entries[0].sequence;
        assert!(page.entries[0].record.original_durable);

        let outcome = world.manager.replay(sequence, true).await.unwrap();
        assert!(outcome.deleted);
        assert_eq!(outcome.subject, "ns.weather.alert");
        assert_eq!(outcome.event_id, Some(envelope.event_id));

        let published = world.bus.published_to("ns.weather.alert");
        assert_eq!(published.len(), 2);
        assert_eq!(published[1].payload, original[0].payload);
        assert!(published[1].durable);
        let replayed = EventEnvelope::from_slice(&published[1].payload).unwrap();
        assert_eq!(replayed.payload, envelope.payload);
        assert_eq!(replayed.event_id, envelope.event_id);

        assert_eq!(world.dlq_total().await, 0);
    }

    #[tokio::test]
    async fn test_wrong_event_type_is_dead_lettered_without_invoking_handler() {
        let world = World::start(fast_config()).await;
        let calls = Arc::new(AtomicU32::new(0));
        world
            .subscriber
            .subscribe(
                "ns.field.*",
                scripted_handler(calls.clone(), |_| Ok(())),
                SubscribeOptions::for_event(EventType::FieldDeleted),
            )
            .await
            .unwrap();

        world
            .publisher
            .publish("ns.field.created", &field_created("f-103"), PublishOptions::default())
            .await
            .unwrap();

        assert!(eventually(|| world.subscriber.stats().moved_to_dlq == 1).await);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let page = world.manager.list(1, 10, &DlqFilter::default()).await.unwrap();
        assert_eq!(page.entries[0].record.error_type, "SchemaError");
    }
}
