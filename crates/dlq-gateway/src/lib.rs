//! # DLQ Gateway
//!
//! Operator-facing HTTP API over the Dead Letter Queue.
//!
//! | Method | Path | Operation |
//! |--------|------|-----------|
//! | GET | `/health` | Bus connectivity of publisher and subscriber |
//! | GET | `/metrics` | Prometheus text exposition |
//! | GET | `/stats` | Publisher and subscriber counters |
//! | GET | `/dlq/messages` | Paginated, filtered listing |
//! | DELETE | `/dlq/messages?confirm=true` | Purge |
//! | GET | `/dlq/messages/:sequence` | One entry |
//! | DELETE | `/dlq/messages/:sequence` | Delete one entry |
//! | POST | `/dlq/messages/:sequence/replay` | Replay one entry |
//! | POST | `/dlq/replay` | Bulk replay |
//! | POST | `/dlq/archive` | Archive old entries |
//! | GET | `/dlq/stats` | Depth and breakdowns |

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod config;
pub mod error;
pub mod handlers;
pub mod service;

pub use config::GatewayConfig;
pub use error::{GatewayError, GatewayResult};
pub use service::{bind, router, serve, AppState};
