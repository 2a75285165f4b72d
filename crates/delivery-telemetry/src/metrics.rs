//! Prometheus metrics for event delivery.
//!
//! All metrics follow the naming convention: `events_<component>_<metric>_<unit>`
//!
//! ## Metric Types
//!
//! - **Counter**: Monotonically increasing value (e.g., events_publish_total)
//! - **Gauge**: Value that can go up or down (e.g., events_dlq_depth)
//! - **Histogram**: Distribution of values (e.g., events_handler_duration_seconds)

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts,
    Registry, TextEncoder,
};

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // PUBLISHER
    // =========================================================================

    /// Logical publish calls by outcome
    pub static ref PUBLISH_TOTAL: CounterVec = CounterVec::new(
        Opts::new("events_publish_total", "Logical publish calls"),
        &["outcome"]  // outcome: success/failure/rejected
    ).expect("metric creation failed");

    /// Transport-level publish retries
    pub static ref PUBLISH_RETRIES: Counter = Counter::new(
        "events_publish_retries_total",
        "Publish attempts beyond the first"
    ).expect("metric creation failed");

    // =========================================================================
    // SUBSCRIBER
    // =========================================================================

    /// Terminal handler outcomes
    pub static ref HANDLER_OUTCOMES: CounterVec = CounterVec::new(
        Opts::new("events_handler_outcomes_total", "Terminal message outcomes"),
        &["outcome"]  // outcome: acked/moved_to_dlq/nacked/dropped/abandoned
    ).expect("metric creation failed");

    /// Handler re-invocations after a retriable failure
    pub static ref HANDLER_RETRIES: Counter = Counter::new(
        "events_handler_retries_total",
        "Handler re-invocations after retriable failures"
    ).expect("metric creation failed");

    /// Handler invocations currently running
    pub static ref HANDLERS_IN_FLIGHT: Gauge = Gauge::new(
        "events_handlers_in_flight",
        "Handler invocations currently running"
    ).expect("metric creation failed");

    /// Handler invocation duration
    pub static ref HANDLER_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "events_handler_duration_seconds",
            "Time spent in a single handler invocation"
        ).buckets(exponential_buckets(0.0005, 2.0, 16).expect("bucket layout is valid"))
    ).expect("metric creation failed");

    // =========================================================================
    // DEAD LETTER QUEUE
    // =========================================================================

    /// Messages routed to the DLQ
    pub static ref DLQ_ROUTED: CounterVec = CounterVec::new(
        Opts::new("events_dlq_routed_total", "Messages routed to the DLQ"),
        &["error_type"]
    ).expect("metric creation failed");

    /// Failed DLQ publishes (original was nacked)
    pub static ref DLQ_PUBLISH_FAILURES: Counter = Counter::new(
        "events_dlq_publish_failures_total",
        "DLQ record publishes that failed"
    ).expect("metric creation failed");

    /// Current DLQ depth as seen by the monitor
    pub static ref DLQ_DEPTH: Gauge = Gauge::new(
        "events_dlq_depth",
        "Messages currently held in the DLQ stream"
    ).expect("metric creation failed");

    /// DLQ replays by outcome
    pub static ref DLQ_REPLAYS: CounterVec = CounterVec::new(
        Opts::new("events_dlq_replays_total", "DLQ replay attempts"),
        &["outcome"]  // outcome: success/failure
    ).expect("metric creation failed");

    /// Alerts raised by the DLQ monitor
    pub static ref DLQ_ALERTS: CounterVec = CounterVec::new(
        Opts::new("events_dlq_alerts_total", "DLQ depth alerts raised"),
        &["severity"]  // severity: warning/critical
    ).expect("metric creation failed");
}

/// Register all metrics with the global registry.
///
/// Safe to call more than once; metrics already registered are skipped.
pub fn register_metrics() -> Result<(), TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        // Publisher
        Box::new(PUBLISH_TOTAL.clone()),
        Box::new(PUBLISH_RETRIES.clone()),
        // Subscriber
        Box::new(HANDLER_OUTCOMES.clone()),
        Box::new(HANDLER_RETRIES.clone()),
        Box::new(HANDLERS_IN_FLIGHT.clone()),
        Box::new(HANDLER_DURATION.clone()),
        // DLQ
        Box::new(DLQ_ROUTED.clone()),
        Box::new(DLQ_PUBLISH_FAILURES.clone()),
        Box::new(DLQ_DEPTH.clone()),
        Box::new(DLQ_REPLAYS.clone()),
        Box::new(DLQ_ALERTS.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }
    Ok(())
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

/// Timer guard for automatic histogram observation.
pub struct HistogramTimer {
    histogram: Histogram,
    start: std::time::Instant,
}

impl HistogramTimer {
    /// Start a new timer for the given histogram.
    pub fn new(histogram: &Histogram) -> Self {
        Self {
            histogram: histogram.clone(),
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for HistogramTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.histogram.observe(duration);
    }
}

/// Gauge guard: increments on creation, decrements on drop.
pub struct GaugeGuard {
    gauge: Gauge,
}

impl GaugeGuard {
    pub fn new(gauge: &Gauge) -> Self {
        gauge.inc();
        Self {
            gauge: gauge.clone(),
        }
    }
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}
