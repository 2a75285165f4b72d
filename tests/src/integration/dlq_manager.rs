//! # DLQ Routing and Management Tests
//!
//! Stream provisioning across instances, recovery from a failed DLQ publish,
//! the DLQ-disabled path, and archiving to disk.

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use event_delivery::{
        DlqFilter, DlqManager, HandlerError, JsonLinesArchive, PublishOptions, SubscribeOptions,
        Subscriber,
    };
    use shared_bus::{BusConnector, InMemoryBus};

    use crate::integration::{eventually, fast_config, field_created, scripted_handler, World};

    #[tokio::test]
    async fn test_concurrent_instances_provision_one_dlq_stream() {
        let bus = InMemoryBus::new();
        let connector: Arc<dyn BusConnector> = Arc::new(bus.clone());
        let config = fast_config();
        let first = Subscriber::new(&config, connector.clone()).unwrap();
        let second = Subscriber::new(&config, connector).unwrap();

        let (a, b) = tokio::join!(first.connect(), second.connect());
        a.unwrap();
        b.unwrap();

        assert_eq!(bus.stream_count(), 1);
        assert_eq!(bus.connection_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_dlq_publish_leaves_message_for_redelivery() {
        let world = World::start(fast_config()).await;
        world.stream("FIELDS", "ns.field").await;
        world
            .bus
            .inject_publish_failures(1, Some("ns.dlq.>"))
            .unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        world
            .subscriber
            .subscribe(
                "ns.field.created",
                scripted_handler(calls.clone(), |_| Err(HandlerError::failed("upstream 503"))),
                SubscribeOptions::default().with_durable("field-sync"),
            )
            .await
            .unwrap();

        world
            .publisher
            .publish("ns.field.created", &field_created("f-200"), PublishOptions::durable())
            .await
            .unwrap();

        assert!(eventually(|| world.subscriber.stats().moved_to_dlq == 1).await);
        let stats = world.subscriber.stats();
        assert_eq!(stats.dlq_failures, 1);
        // Two full retry cycles: the nacked delivery and its redelivery.
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(world.dlq_total().await, 1);
        assert!(eventually(|| world.bus.pending_count("field-sync") == 0).await);
    }

    #[tokio::test]
    async fn test_custom_namespace_and_prefix_round_trip() {
        let mut config = fast_config();
        config.bus.namespace = "app".into();
        config.dlq.subject_prefix = "events.dlq".into();
        config.validate().unwrap();
        let world = World::start(config).await;

        let calls = Arc::new(AtomicU32::new(0));
        world
            .subscriber
            .subscribe(
                "app.field.created",
                scripted_handler(calls.clone(), |call| {
                    if call == 1 {
                        Err(HandlerError::permanent("farm not found"))
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
            .publish("app.field.created", &field_created("f-210"), PublishOptions::default())
            .await
            .unwrap();

        assert!(eventually(|| world.subscriber.stats().moved_to_dlq == 1).await);
        assert_eq!(world.subscriber.stats().dlq_failures, 0);
        let page = world.manager.list(1, 10, &DlqFilter::default()).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.entries[0].subject, "events.dlq.field.created");
        assert_eq!(page.entries[0].record.original_subject, "app.field.created");

        let outcome = world.manager.replay(page.entries[0].sequence, true).await.unwrap();
        assert!(outcome.deleted);
        assert!(eventually(|| world.subscriber.stats().acked == 1).await);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(world.dlq_total().await, 0);
    }

    #[tokio::test]
    async fn test_disabled_dlq_drops_failed_messages() {
        let mut config = fast_config();
        config.dlq.enabled = false;
        let world = World::start(config).await;

        let calls = Arc::new(AtomicU32::new(0));
        world
            .subscriber
            .subscribe(
                "ns.field.created",
                scripted_handler(calls.clone(), |_| Err(HandlerError::validation("area is negative"))),
                SubscribeOptions::default(),
            )
            .await
            .unwrap();

        world
            .publisher
            .publish("ns.field.created", &field_created("f-201"), PublishOptions::default())
            .await
            .unwrap();

        assert!(eventually(|| world.subscriber.stats().dropped == 1).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(world.subscriber.stats().moved_to_dlq, 0);
        assert_eq!(world.bus.stream_count(), 0);
        assert!(world.bus.published_to("ns.dlq.field.created").is_empty());
    }

    #[tokio::test]
    async fn test_archive_writes_json_lines_and_trims_stream() {
        let world = World::start(fast_config()).await;
        let dir = tempfile::tempdir().unwrap();
        let archive = Arc::new(JsonLinesArchive::new(dir.path()));
        let manager = DlqManager::new(
            &world.config,
            Arc::new(world.bus.clone()),
            world.publisher.clone(),
            archive.clone(),
        );
        manager.connect().await.unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        world
            .subscriber
            .subscribe(
                "ns.field.created",
                scripted_handler(calls, |_| Err(HandlerError::permanent("farm archived"))),
                SubscribeOptions::default(),
            )
            .await
            .unwrap();
        for id in ["f-300", "f-301"] {
            world
                .publisher
                .publish("ns.field.created", &field_created(id), PublishOptions::default())
                .await
                .unwrap();
        }
        assert!(eventually(|| world.subscriber.stats().moved_to_dlq == 2).await);

        // Nothing is a week old yet.
        let report = manager.archive(7, true).await.unwrap();
        assert_eq!(report.archived, 0);
        assert_eq!(world.dlq_total().await, 2);

        let report = manager.archive(0, true).await.unwrap();
        assert_eq!(report.archived, 2);
        assert_eq!(report.deleted, 2);
        assert_eq!(world.dlq_total().await, 0);

        let contents = std::fs::read_to_string(archive.current_file()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let entry: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(entry["record"]["original_subject"], "ns.field.created");
            assert_eq!(entry["record"]["error_type"], "HandlerError");
        }
    }

    #[tokio::test]
    async fn test_filters_narrow_listing() {
        let world = World::start(fast_config()).await;
        let calls = Arc::new(AtomicU32::new(0));
        world
            .subscriber
            .subscribe(
                "ns.>",
                scripted_handler(calls.clone(), |call| {
                    if call % 2 == 0 {
                        Err(HandlerError::validation("bad crop"))
                    } else {
                        Err(HandlerError::permanent("no owner"))
                    }
                }),
                SubscribeOptions::default(),
            )
            .await
            .unwrap();

        for (subject, id) in [
            ("ns.field.created", "f-400"),
            ("ns.field.updated", "f-401"),
            ("ns.field.created", "f-402"),
        ] {
            world
                .publisher
                .publish(subject, &field_created(id), PublishOptions::default())
                .await
                .unwrap();
        }
        assert!(eventually(|| world.subscriber.stats().moved_to_dlq == 3).await);
        // The catch-all route acks its own dead letters without dispatching them.
        assert!(eventually(|| world.subscriber.stats().skipped == 3).await);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let created = DlqFilter {
            subject: Some("field.created".into()),
            ..DlqFilter::default()
        };
        assert_eq!(world.manager.list(1, 10, &created).await.unwrap().total, 2);

        let validation = DlqFilter {
            error_type: Some("ValidationError".into()),
            ..DlqFilter::default()
        };
        assert_eq!(world.manager.list(1, 10, &validation).await.unwrap().total, 1);

        let stats = world.manager.stats().await.unwrap();
        assert_eq!(stats.total_messages, 3);
        assert_eq!(stats.per_error_type.get("HandlerError"), Some(&2));
        assert_eq!(stats.per_subject.get("ns.field.created"), Some(&2));
    }
}
