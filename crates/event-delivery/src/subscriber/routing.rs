//! Routing table and per-route receive loops.
//!
//! Patterns are compiled once at subscribe time. Each route owns one bus
//! subscription and a loop that hands messages to handler tasks, gated by
//! the subscriber's semaphore.

use std::collections::BTreeMap;
use std::sync::Arc;

use shared_bus::{BusConnection, SubjectPattern, Subscription};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::subscriber::dispatch::{Dispatcher, RouteBinding};

/// A registered subscription.
pub(crate) struct Route {
    pub(crate) pattern: SubjectPattern,
    stop: watch::Sender<bool>,
    task: JoinHandle<Subscription>,
}

impl Route {
    /// Stop receiving and return the subscription, still registered with
    /// the bus so unacknowledged deliveries stay with this consumer.
    pub(crate) async fn stop(self) -> Option<Subscription> {
        let _ = self.stop.send(true);
        match self.task.await {
            Ok(subscription) => Some(subscription),
            Err(err) => {
                warn!(pattern = %self.pattern, error = %err, "Route loop ended abnormally");
                None
            }
        }
    }
}

/// Subject string to route.
#[derive(Default)]
pub(crate) struct RoutingTable {
    routes: BTreeMap<String, Route>,
}

impl RoutingTable {
    pub(crate) fn contains(&self, subject: &str) -> bool {
        self.routes.contains_key(subject)
    }

    pub(crate) fn insert(&mut self, subject: String, route: Route) {
        self.routes.insert(subject, route);
    }

    pub(crate) fn remove(&mut self, subject: &str) -> Option<Route> {
        self.routes.remove(subject)
    }

    pub(crate) fn drain(&mut self) -> Vec<Route> {
        std::mem::take(&mut self.routes).into_values().collect()
    }

    /// Registered subjects whose pattern matches `subject`.
    pub(crate) fn matching(&self, subject: &str) -> Vec<String> {
        self.routes
            .iter()
            .filter(|(_, route)| route.pattern.matches(subject))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub(crate) fn subjects(&self) -> Vec<String> {
        self.routes.keys().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.routes.len()
    }
}

/// Spawn the receive loop for one route.
pub(crate) fn spawn_route(
    subscription: Subscription,
    binding: Arc<RouteBinding>,
    dispatcher: Arc<Dispatcher>,
    connection: Arc<dyn BusConnection>,
    permits: Arc<Semaphore>,
) -> Route {
    let pattern = subscription.pattern().clone();
    let (stop, stopped) = watch::channel(false);
    let task = tokio::spawn(receive_loop(
        subscription,
        binding,
        dispatcher,
        connection,
        permits,
        stopped,
    ));
    Route {
        pattern,
        stop,
        task,
    }
}

async fn receive_loop(
    mut subscription: Subscription,
    binding: Arc<RouteBinding>,
    dispatcher: Arc<Dispatcher>,
    connection: Arc<dyn BusConnection>,
    permits: Arc<Semaphore>,
    mut stop: watch::Receiver<bool>,
) -> Subscription {
    debug!(subject = %binding.subject, handler = binding.handler.name(), "Route loop started");
    loop {
        let message = tokio::select! {
            biased;
            _ = stop_requested(&mut stop) => break,
            message = subscription.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        dispatcher.metrics.record_received();

        if binding.skips(&message.subject) {
            dispatcher.metrics.record_skipped();
            debug!(subject = %message.subject, route = %binding.subject, "Skipping dead letter");
            if let Err(err) = message.ack().await {
                warn!(subject = %message.subject, error = %err, "Ack failed");
            }
            continue;
        }

        let permit = tokio::select! {
            biased;
            _ = stop_requested(&mut stop) => {
                // Not dispatched; hand it back to the bus.
                let _ = message.nak(None).await;
                break;
            }
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let dispatcher = dispatcher.clone();
        let connection = connection.clone();
        let binding = binding.clone();
        tokio::spawn(async move {
            let _permit = permit;
            dispatcher
                .dispatch(connection.as_ref(), &binding, message)
                .await;
        });
    }
    debug!(subject = %binding.subject, "Route loop stopped");
    subscription
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    // A dropped sender also stops the loop.
    let _ = stop.wait_for(|stop| *stop).await;
}
