//! Delivery configuration with validation.
//!
//! Loaded once at process start, either deserialized (every field has a
//! default, durations are integer milliseconds) or read from
//! `EVENTS_*` environment variables with [`DeliveryConfig::from_env`].

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Main delivery configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Bus connection settings
    pub bus: BusSettings,
    /// Retry schedule shared by publisher and subscriber
    pub retry: RetryConfig,
    /// Dead Letter Queue settings
    pub dlq: DlqConfig,
    /// Handler pool settings
    pub concurrency: ConcurrencyConfig,
}

/// Bus connection settings
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    /// Broker addresses
    pub servers: Vec<String>,
    /// Stamped on envelopes without a source and on DLQ records
    pub service_name: String,
    pub service_version: String,
    /// Root subject token owned by this deployment
    pub namespace: String,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub connect_timeout: Duration,
    /// Per-attempt publish timeout
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub publish_timeout: Duration,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            servers: vec!["nats://localhost:4222".to_string()],
            service_name: "event-delivery".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            namespace: "ns".to_string(),
            connect_timeout: Duration::from_secs(5),
            publish_timeout: Duration::from_secs(5),
        }
    }
}

/// Retry schedule
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub initial_delay: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

/// Dead Letter Queue settings
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    pub enabled: bool,
    pub stream_name: String,
    /// The DLQ stream captures `<subject_prefix>.>`; dead letters replace
    /// the namespace token of their original subject with this prefix
    pub subject_prefix: String,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_age: Duration,
    pub max_messages: u64,
    pub max_bytes: u64,
    /// Alert when depth exceeds this
    pub alert_threshold: u64,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub alert_interval: Duration,
    /// Minimum spacing between two alerts
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub alert_cooldown: Duration,
    /// Optional webhook receiving alerts as JSON
    pub alert_webhook: Option<String>,
    /// Directory for JSON-lines archives
    pub archive_dir: PathBuf,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stream_name: "DLQ".to_string(),
            subject_prefix: "ns.dlq".to_string(),
            max_age: Duration::from_secs(30 * 24 * 60 * 60),
            max_messages: 100_000,
            max_bytes: 1024 * 1024 * 1024,
            alert_threshold: 100,
            alert_interval: Duration::from_secs(60),
            alert_cooldown: Duration::from_secs(300),
            alert_webhook: None,
            archive_dir: PathBuf::from("dlq-archive"),
        }
    }
}

/// Handler pool settings
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Handler invocations allowed to run at once
    pub max_concurrent_messages: usize,
    /// Local queue capacity per subscription
    pub pending_messages_limit: usize,
    /// Per-invocation handler timeout
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub handler_timeout: Duration,
    /// How long shutdown waits for in-flight handlers
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub shutdown_grace: Duration,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_messages: 10,
            pending_messages_limit: 1000,
            handler_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl DeliveryConfig {
    /// Read configuration from `EVENTS_*` environment variables, falling
    /// back to defaults for anything unset.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` when a variable is set but does
    /// not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let bus_defaults = BusSettings::default();
        let retry_defaults = RetryConfig::default();
        let dlq_defaults = DlqConfig::default();
        let pool_defaults = ConcurrencyConfig::default();

        let servers = env::var("EVENTS_SERVERS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or(bus_defaults.servers);

        let bus = BusSettings {
            servers,
            service_name: env::var("EVENTS_SERVICE_NAME").unwrap_or(bus_defaults.service_name),
            service_version: env::var("EVENTS_SERVICE_VERSION")
                .unwrap_or(bus_defaults.service_version),
            namespace: env::var("EVENTS_NAMESPACE").unwrap_or(bus_defaults.namespace),
            connect_timeout: env_millis("EVENTS_CONNECT_TIMEOUT_MS", bus_defaults.connect_timeout)?,
            publish_timeout: env_millis("EVENTS_PUBLISH_TIMEOUT_MS", bus_defaults.publish_timeout)?,
        };

        let retry = RetryConfig {
            max_attempts: env_parse("EVENTS_MAX_RETRY_ATTEMPTS", retry_defaults.max_attempts)?,
            initial_delay: env_millis(
                "EVENTS_INITIAL_RETRY_DELAY_MS",
                retry_defaults.initial_delay,
            )?,
            max_delay: env_millis("EVENTS_MAX_RETRY_DELAY_MS", retry_defaults.max_delay)?,
            backoff_multiplier: env_parse(
                "EVENTS_BACKOFF_MULTIPLIER",
                retry_defaults.backoff_multiplier,
            )?,
        };

        let dlq = DlqConfig {
            enabled: env_parse("EVENTS_DLQ_ENABLED", dlq_defaults.enabled)?,
            stream_name: env::var("EVENTS_DLQ_STREAM").unwrap_or(dlq_defaults.stream_name),
            subject_prefix: env::var("EVENTS_DLQ_SUBJECT_PREFIX")
                .unwrap_or(dlq_defaults.subject_prefix),
            max_age: env_parse::<u64>("EVENTS_DLQ_MAX_AGE_DAYS", dlq_defaults.max_age.as_secs() / 86_400)
                .map(|days| Duration::from_secs(days * 86_400))?,
            max_messages: env_parse("EVENTS_DLQ_MAX_MESSAGES", dlq_defaults.max_messages)?,
            max_bytes: env_parse("EVENTS_DLQ_MAX_BYTES", dlq_defaults.max_bytes)?,
            alert_threshold: env_parse("EVENTS_DLQ_ALERT_THRESHOLD", dlq_defaults.alert_threshold)?,
            alert_interval: env_parse::<u64>(
                "EVENTS_DLQ_ALERT_INTERVAL_SECS",
                dlq_defaults.alert_interval.as_secs(),
            )
            .map(Duration::from_secs)?,
            alert_cooldown: env_parse::<u64>(
                "EVENTS_DLQ_ALERT_COOLDOWN_SECS",
                dlq_defaults.alert_cooldown.as_secs(),
            )
            .map(Duration::from_secs)?,
            alert_webhook: env::var("EVENTS_DLQ_ALERT_WEBHOOK")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            archive_dir: env::var("EVENTS_DLQ_ARCHIVE_DIR")
                .map(PathBuf::from)
                .unwrap_or(dlq_defaults.archive_dir),
        };

        let concurrency = ConcurrencyConfig {
            max_concurrent_messages: env_parse(
                "EVENTS_MAX_CONCURRENT_MESSAGES",
                pool_defaults.max_concurrent_messages,
            )?,
            pending_messages_limit: env_parse(
                "EVENTS_PENDING_MESSAGES_LIMIT",
                pool_defaults.pending_messages_limit,
            )?,
            handler_timeout: env_millis("EVENTS_HANDLER_TIMEOUT_MS", pool_defaults.handler_timeout)?,
            shutdown_grace: env_millis("EVENTS_SHUTDOWN_GRACE_MS", pool_defaults.shutdown_grace)?,
        };

        Ok(Self {
            bus,
            retry,
            dlq,
            concurrency,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.servers.is_empty() {
            return Err(ConfigError::Invalid("at least one server is required".into()));
        }
        if self.bus.service_name.trim().is_empty() {
            return Err(ConfigError::Invalid("service_name cannot be empty".into()));
        }
        if self.bus.namespace.trim().is_empty() || self.bus.namespace.contains('.') {
            return Err(ConfigError::Invalid(
                "namespace must be a single non-empty subject token".into(),
            ));
        }
        if self.bus.publish_timeout.is_zero() || self.bus.connect_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout("bus timeouts cannot be 0".into()));
        }

        // Validate retry schedule
        if self.retry.max_attempts < 1 {
            return Err(ConfigError::InvalidRetry("max_attempts must be at least 1".into()));
        }
        let multiplier = self.retry.backoff_multiplier;
        if multiplier.is_nan() || multiplier < 1.0 {
            return Err(ConfigError::InvalidRetry(
                "backoff_multiplier must be at least 1.0".into(),
            ));
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return Err(ConfigError::InvalidRetry(
                "initial_delay cannot exceed max_delay".into(),
            ));
        }

        // Validate DLQ
        if self.dlq.stream_name.trim().is_empty() {
            return Err(ConfigError::InvalidDlq("stream_name cannot be empty".into()));
        }
        let prefix = &self.dlq.subject_prefix;
        if prefix.split('.').any(|t| t.trim().is_empty() || t == "*" || t == ">") {
            return Err(ConfigError::InvalidDlq(
                "subject_prefix must be a literal subject".into(),
            ));
        }
        if *prefix == self.bus.namespace {
            return Err(ConfigError::InvalidDlq(
                "subject_prefix cannot be the namespace itself".into(),
            ));
        }
        if self.dlq.alert_threshold < 1 {
            return Err(ConfigError::InvalidDlq("alert_threshold must be at least 1".into()));
        }
        if self.dlq.alert_interval.is_zero() {
            return Err(ConfigError::InvalidDlq("alert_interval cannot be 0".into()));
        }

        // Validate handler pool
        if self.concurrency.max_concurrent_messages < 1 {
            return Err(ConfigError::InvalidLimit(
                "max_concurrent_messages must be at least 1".into(),
            ));
        }
        if self.concurrency.pending_messages_limit < 1 {
            return Err(ConfigError::InvalidLimit(
                "pending_messages_limit must be at least 1".into(),
            ));
        }
        if self.concurrency.handler_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout("handler_timeout cannot be 0".into()));
        }

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// Invalid retry schedule
    #[error("invalid retry policy: {0}")]
    InvalidRetry(String),
    /// Invalid DLQ settings
    #[error("invalid dlq configuration: {0}")]
    InvalidDlq(String),
    /// Invalid size or count limit
    #[error("invalid limit: {0}")]
    InvalidLimit(String),
    /// Invalid timeout value
    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),
    /// An environment variable did not parse
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    /// General configuration error
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn env_parse<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        Err(_) => Ok(default),
    }
}

fn env_millis(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let millis = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    env_parse(key, millis).map(Duration::from_millis)
}
