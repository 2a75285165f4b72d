//! Gateway listener configuration.

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::GatewayError;

/// HTTP listener settings
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address the admin API binds to
    pub listen_addr: SocketAddr,
    /// Per-request deadline
    pub request_timeout: Duration,
    /// Largest accepted request body
    pub max_body_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8081)),
            request_timeout: Duration::from_secs(30),
            max_body_bytes: 1024 * 1024,
        }
    }
}

impl GatewayConfig {
    /// Read `EVENTS_ADMIN_ADDR`, `EVENTS_ADMIN_TIMEOUT_MS` and
    /// `EVENTS_ADMIN_MAX_BODY_BYTES`, defaulting anything unset.
    pub fn from_env() -> Result<Self, GatewayError> {
        let defaults = Self::default();
        let listen_addr = match env::var("EVENTS_ADMIN_ADDR") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| GatewayError::Config(format!("EVENTS_ADMIN_ADDR: invalid address {raw:?}")))?,
            Err(_) => defaults.listen_addr,
        };
        let request_timeout = match env::var("EVENTS_ADMIN_TIMEOUT_MS") {
            Ok(raw) => Duration::from_millis(raw.parse().map_err(|_| {
                GatewayError::Config(format!("EVENTS_ADMIN_TIMEOUT_MS: not a number {raw:?}"))
            })?),
            Err(_) => defaults.request_timeout,
        };
        let max_body_bytes = match env::var("EVENTS_ADMIN_MAX_BODY_BYTES") {
            Ok(raw) => raw.parse().map_err(|_| {
                GatewayError::Config(format!("EVENTS_ADMIN_MAX_BODY_BYTES: not a number {raw:?}"))
            })?,
            Err(_) => defaults.max_body_bytes,
        };

        Ok(Self {
            listen_addr,
            request_timeout,
            max_body_bytes,
        })
    }
}
