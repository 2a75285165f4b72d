//! Catch-all handler that records every event flowing through the namespace.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use event_delivery::{EventHandler, HandlerError};
use shared_types::EventEnvelope;
use tracing::info;

/// Logs one structured line per event.
#[derive(Debug, Default)]
pub struct AuditHandler {
    seen: AtomicU64,
}

impl AuditHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events handled so far.
    pub fn seen(&self) -> u64 {
        self.seen.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EventHandler for AuditHandler {
    fn name(&self) -> &str {
        "audit"
    }

    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        self.seen.fetch_add(1, Ordering::Relaxed);
        info!(
            event_id = %envelope.event_id,
            event_type = envelope.event_type().as_str(),
            source = envelope.source_service.as_deref().unwrap_or("unknown"),
            tenant = envelope.tenant_id.as_deref().unwrap_or("-"),
            correlation_id = envelope.correlation_id.as_deref().unwrap_or("-"),
            "Event observed"
        );
        Ok(())
    }
}
