//! Per-instance delivery counters.
//!
//! Process-wide Prometheus metrics live in `delivery-telemetry`; these
//! atomics back `Publisher::stats()` and `Subscriber::stats()` so health
//! checks can read one instance without scraping.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Publisher counters
#[derive(Debug, Default)]
pub struct PublisherMetrics {
    pub published: AtomicU64,
    pub failed: AtomicU64,
    pub rejected: AtomicU64,
    pub retries: AtomicU64,
}

impl PublisherMetrics {
    pub fn record_success(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Serialization or validation refused the envelope.
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PublisherStats {
        PublisherStats {
            published: self.published.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time publisher statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherStats {
    pub published: u64,
    pub failed: u64,
    pub rejected: u64,
    pub retries: u64,
}

/// Subscriber counters
#[derive(Debug, Default)]
pub struct SubscriberMetrics {
    pub received: AtomicU64,
    pub acked: AtomicU64,
    pub handled: AtomicU64,
    pub handler_failures: AtomicU64,
    pub retries: AtomicU64,
    pub moved_to_dlq: AtomicU64,
    pub dlq_failures: AtomicU64,
    pub dropped: AtomicU64,
    pub abandoned: AtomicU64,
    pub skipped: AtomicU64,
    pub in_flight: AtomicU64,
}

impl SubscriberMetrics {
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acked(&self) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }

    /// Succeeded on a route that does not acknowledge automatically.
    pub fn record_handled(&self) {
        self.handled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_moved_to_dlq(&self) {
        self.moved_to_dlq.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dlq_failure(&self) {
        self.dlq_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abandoned(&self) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a handler invocation as in flight until the guard drops.
    #[must_use]
    pub fn track_in_flight(&self) -> InFlightGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard { metrics: self }
    }

    pub fn snapshot(&self) -> SubscriberStats {
        SubscriberStats {
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            handled: self.handled.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            moved_to_dlq: self.moved_to_dlq.load(Ordering::Relaxed),
            dlq_failures: self.dlq_failures.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

/// Decrements `in_flight` on drop, including when the invocation is cancelled.
pub struct InFlightGuard<'a> {
    metrics: &'a SubscriberMetrics,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.metrics.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Point-in-time subscriber statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberStats {
    pub received: u64,
    pub acked: u64,
    /// Succeeded without an automatic acknowledgement
    pub handled: u64,
    pub handler_failures: u64,
    pub retries: u64,
    pub moved_to_dlq: u64,
    /// DLQ publishes that failed; the original was nacked
    pub dlq_failures: u64,
    /// Exhausted with the DLQ disabled
    pub dropped: u64,
    /// Left unacknowledged at forced shutdown
    pub abandoned: u64,
    /// Dead letters seen by a non-DLQ route and acknowledged unprocessed
    pub skipped: u64,
    pub in_flight: u64,
}
