//! Router assembly and the HTTP server loop.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use event_delivery::{DlqManager, Publisher, Subscriber};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::GatewayConfig;
use crate::error::GatewayResult;
use crate::handlers;

/// Handles shared by every request.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<DlqManager>,
    pub publisher: Arc<Publisher>,
    /// Absent when this process only administers the DLQ.
    pub subscriber: Option<Arc<Subscriber>>,
}

/// Build the admin router.
pub fn router(state: AppState, config: &GatewayConfig) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(config.request_timeout));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/stats", get(handlers::delivery_stats))
        .route(
            "/dlq/messages",
            get(handlers::list_messages).delete(handlers::purge),
        )
        .route(
            "/dlq/messages/:sequence",
            get(handlers::get_message).delete(handlers::delete_message),
        )
        .route("/dlq/messages/:sequence/replay", post(handlers::replay_message))
        .route("/dlq/replay", post(handlers::replay_bulk))
        .route("/dlq/archive", post(handlers::archive))
        .route("/dlq/stats", get(handlers::dlq_stats))
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(middleware)
        .with_state(state)
}

/// Bind the configured listen address.
pub async fn bind(config: &GatewayConfig) -> GatewayResult<TcpListener> {
    Ok(TcpListener::bind(config.listen_addr).await?)
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    state: AppState,
    config: &GatewayConfig,
    shutdown: F,
) -> GatewayResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr: Option<SocketAddr> = listener.local_addr().ok();
    info!(addr = ?addr, "DLQ admin API listening");
    axum::serve(listener, router(state, config))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("DLQ admin API stopped");
    Ok(())
}
