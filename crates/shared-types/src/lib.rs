//! # Shared Types Crate
//!
//! The event envelope and the closed set of payload schemas exchanged over
//! the bus.
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: every payload a producer may emit is a
//!   variant of [`EventPayload`]. Unknown event types fail to decode.
//! - **Validate at the Edge**: [`EventEnvelope::from_slice`] rejects
//!   out-of-range values, so a decoded envelope is always well formed.
//! - **Deterministic Failures**: every [`SchemaError`] is a property of the
//!   bytes, never of the environment. Retrying one cannot succeed.

pub mod entities;
pub mod envelope;
pub mod errors;

pub use entities::*;
pub use envelope::{EventEnvelope, SCHEMA_VERSION, SUPPORTED_MAJOR};
pub use errors::SchemaError;
