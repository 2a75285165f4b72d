//! DLQ Admin: operator CLI for the Dead Letter Queue admin API.
//!
//! The binary parses commands with `clap`; this library holds the HTTP
//! client and the plain-text renderers so both can be tested.

pub mod client;
pub mod render;

pub use client::{AdminClient, ApiError, ListParams};
