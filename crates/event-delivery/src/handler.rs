//! Handler adapters.
//!
//! Consumers implement [`EventHandler`] or wrap an async closure with
//! [`handler_fn`]. Returning `Err` with a non-retriable [`HandlerError`]
//! short-circuits the retry loop.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use shared_types::EventEnvelope;

use crate::domain::HandlerError;

/// Processes one decoded event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name recorded in delivery metadata and logs.
    fn name(&self) -> &str;

    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError>;
}

struct FnHandler<F> {
    name: String,
    func: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        (self.func)(envelope.clone()).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(name: impl Into<String>, func: F) -> Arc<dyn EventHandler>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        func,
    })
}
