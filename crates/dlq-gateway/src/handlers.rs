//! Request handlers. Each one is a thin wrapper over a `DlqManager` call.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use event_delivery::{
    ArchiveReport, BulkReplayReport, DlqEntry, DlqFilter, DlqPage, DlqStats, PublisherStats,
    ReplayOutcome, SubscriberStats, MAX_PAGE_SIZE,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{GatewayError, GatewayResult};
use crate::service::AppState;

const DEFAULT_PAGE_SIZE: usize = 50;
const DEFAULT_ARCHIVE_DAYS: u32 = 7;

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub page: Option<usize>,
    pub page_size: Option<usize>,
    pub subject: Option<String>,
    pub error_type: Option<String>,
    pub consumer_service: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReplayQuery {
    #[serde(default = "default_true")]
    pub delete_after: bool,
}

#[derive(Debug, Deserialize)]
pub struct BulkReplayRequest {
    pub sequences: Vec<u64>,
    #[serde(default = "default_true")]
    pub delete_after: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ArchiveRequest {
    pub older_than_days: u32,
    pub delete_after: bool,
}

impl Default for ArchiveRequest {
    fn default() -> Self {
        Self {
            older_than_days: DEFAULT_ARCHIVE_DAYS,
            delete_after: true,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PurgeQuery {
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub publisher_connected: bool,
    pub subscriber_connected: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeliveryStatsResponse {
    pub publisher: PublisherStats,
    pub subscriber: Option<SubscriberStats>,
}

fn default_true() -> bool {
    true
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let publisher_connected = state.publisher.is_connected().await;
    let subscriber_connected = match &state.subscriber {
        Some(subscriber) => Some(subscriber.is_connected().await),
        None => None,
    };
    let healthy = publisher_connected && subscriber_connected.unwrap_or(true);
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            status: if healthy { "ok" } else { "degraded" }.to_string(),
            publisher_connected,
            subscriber_connected,
        }),
    )
}

/// GET /metrics
pub async fn metrics() -> Response {
    match delivery_telemetry::encode_metrics() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

/// GET /stats
pub async fn delivery_stats(State(state): State<AppState>) -> Json<DeliveryStatsResponse> {
    Json(DeliveryStatsResponse {
        publisher: state.publisher.stats(),
        subscriber: state.subscriber.as_ref().map(|s| s.stats()),
    })
}

/// GET /dlq/messages
pub async fn list_messages(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> GatewayResult<Json<DlqPage>> {
    let page_size = query.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
    if page_size == 0 || page_size > MAX_PAGE_SIZE {
        return Err(GatewayError::BadRequest(format!(
            "page_size must be between 1 and {MAX_PAGE_SIZE}"
        )));
    }
    let filter = DlqFilter {
        subject: query.subject,
        error_type: query.error_type,
        consumer_service: query.consumer_service,
    };
    let page = state
        .manager
        .list(query.page.unwrap_or(1), page_size, &filter)
        .await?;
    Ok(Json(page))
}

/// GET /dlq/messages/:sequence
pub async fn get_message(
    State(state): State<AppState>,
    Path(sequence): Path<u64>,
) -> GatewayResult<Json<DlqEntry>> {
    Ok(Json(state.manager.get(sequence).await?))
}

/// DELETE /dlq/messages/:sequence
pub async fn delete_message(
    State(state): State<AppState>,
    Path(sequence): Path<u64>,
) -> GatewayResult<Json<Value>> {
    state.manager.delete(sequence).await?;
    Ok(Json(json!({ "deleted": sequence })))
}

/// DELETE /dlq/messages?confirm=true
pub async fn purge(
    State(state): State<AppState>,
    Query(query): Query<PurgeQuery>,
) -> GatewayResult<Json<Value>> {
    if !query.confirm {
        return Err(GatewayError::BadRequest(
            "purging the DLQ requires confirm=true".to_string(),
        ));
    }
    let purged = state.manager.purge().await?;
    Ok(Json(json!({ "purged": purged })))
}

/// POST /dlq/messages/:sequence/replay
pub async fn replay_message(
    State(state): State<AppState>,
    Path(sequence): Path<u64>,
    Query(query): Query<ReplayQuery>,
) -> GatewayResult<Json<ReplayOutcome>> {
    Ok(Json(state.manager.replay(sequence, query.delete_after).await?))
}

/// POST /dlq/replay
pub async fn replay_bulk(
    State(state): State<AppState>,
    Json(request): Json<BulkReplayRequest>,
) -> GatewayResult<Json<BulkReplayReport>> {
    if request.sequences.is_empty() {
        return Err(GatewayError::BadRequest("sequences is empty".to_string()));
    }
    if request.sequences.len() > MAX_PAGE_SIZE {
        return Err(GatewayError::BadRequest(format!(
            "at most {MAX_PAGE_SIZE} sequences per request"
        )));
    }
    Ok(Json(
        state
            .manager
            .replay_bulk(&request.sequences, request.delete_after)
            .await,
    ))
}

/// POST /dlq/archive
pub async fn archive(
    State(state): State<AppState>,
    Json(request): Json<ArchiveRequest>,
) -> GatewayResult<Json<ArchiveReport>> {
    Ok(Json(
        state
            .manager
            .archive(request.older_than_days, request.delete_after)
            .await?,
    ))
}

/// GET /dlq/stats
pub async fn dlq_stats(State(state): State<AppState>) -> GatewayResult<Json<DlqStats>> {
    Ok(Json(state.manager.stats().await?))
}
