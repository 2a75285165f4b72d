//! # Event Delivery Test Suite
//!
//! Cross-crate tests that drive the publisher, subscriber and DLQ components
//! together over the in-memory bus.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── scenarios.rs    # Retry / DLQ / replay end-to-end scenarios
//!     ├── concurrency.rs  # Handler pool bound and graceful shutdown
//!     ├── dlq_manager.rs  # Provisioning, DLQ publish failure, DLQ disabled
//!     └── monitor.rs      # Alert cooldown over simulated time
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p delivery-tests
//! cargo bench -p delivery-tests
//! ```

pub mod integration;
