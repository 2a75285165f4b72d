//! HTTP-facing errors.
//!
//! Every handler returns [`GatewayResult`]; the error renders as
//! `{"error": ..., "code": ...}` with a status derived from the underlying
//! [`DeliveryError`].

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use event_delivery::DeliveryError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("server error: {0}")]
    Server(#[from] std::io::Error),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    fn parts(&self) -> (StatusCode, &'static str) {
        match self {
            Self::Delivery(err) => match err {
                DeliveryError::RecordNotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                DeliveryError::InvalidRecord { .. } => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_RECORD")
                }
                DeliveryError::Schema(_) => (StatusCode::UNPROCESSABLE_ENTITY, "SCHEMA_ERROR"),
                DeliveryError::NotConnected | DeliveryError::Connection(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "BUS_UNAVAILABLE")
                }
                DeliveryError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
                DeliveryError::DlqDisabled => (StatusCode::CONFLICT, "DLQ_DISABLED"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            },
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            Self::Config(_) | Self::Server(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, code) = self.parts();
        if status.is_server_error() {
            tracing::error!(error = %self, code, "Admin request failed");
        }
        let body = json!({
            "error": self.to_string(),
            "code": code,
        });
        (status, Json(body)).into_response()
    }
}
