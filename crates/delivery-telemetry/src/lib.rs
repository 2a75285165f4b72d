//! # Delivery Telemetry
//!
//! Logging and metrics for the event delivery workspace.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use delivery_telemetry::{init_telemetry, TelemetryConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let _guard = init_telemetry(TelemetryConfig::from_env())?;
//!     // Logs and metrics are now being collected
//!     Ok(())
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `EVENTS_SERVICE_NAME` | `event-delivery` | Service name in logs |
//! | `EVENTS_LOG_LEVEL` | `info` | Log level filter (`RUST_LOG` wins) |
//! | `EVENTS_JSON_LOGS` | `false` (`true` in containers) | JSON output |
//! | `EVENTS_CONSOLE_OUTPUT` | `true` | Write logs to stdout |

mod config;
mod logging;
pub mod metrics;

pub use config::TelemetryConfig;
pub use logging::init_logging;
pub use metrics::{
    encode_metrics, register_metrics, GaugeGuard, HistogramTimer, DLQ_ALERTS, DLQ_DEPTH,
    DLQ_PUBLISH_FAILURES, DLQ_REPLAYS, DLQ_ROUTED, HANDLERS_IN_FLIGHT, HANDLER_DURATION,
    HANDLER_OUTCOMES, HANDLER_RETRIES, PUBLISH_RETRIES, PUBLISH_TOTAL,
};

use thiserror::Error;

/// Raised when logging or the metrics registry cannot be set up.
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("tracing subscriber could not be installed: {0}")]
    LoggingInit(String),

    #[error("metrics registry rejected a collector: {0}")]
    MetricsInit(String),
}

/// Initialize metrics and logging.
///
/// Returns a guard that should be held for the lifetime of the process.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    register_metrics()?;
    init_logging(&config)?;
    Ok(TelemetryGuard {
        service_name: config.service_name,
    })
}

/// Guard that keeps telemetry active.
pub struct TelemetryGuard {
    service_name: String,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::info!(service = %self.service_name, "Shutting down telemetry");
    }
}

/// Increment a counter, optionally selecting label values first.
#[macro_export]
macro_rules! metric_inc {
    ($metric:expr) => {
        $metric.inc()
    };
    ($metric:expr, $labels:expr) => {
        $metric.with_label_values($labels).inc()
    };
}
