//! HTTP client for the DLQ admin API.

use std::time::Duration;

use event_delivery::{ArchiveReport, BulkReplayReport, DlqEntry, DlqPage, DlqStats, ReplayOutcome};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Cannot connect to {0}")]
    Connection(String),
    /// The API answered with an error body.
    #[error("{status}: {message}")]
    Api { status: StatusCode, message: String },
}

/// Listing filters and paging.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ListParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer_service: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

pub struct AdminClient {
    client: Client,
    base_url: String,
}

impl AdminClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(2))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn list(&self, params: &ListParams) -> Result<DlqPage, ApiError> {
        self.send(self.request(Method::GET, "/dlq/messages").query(params))
            .await
    }

    pub async fn show(&self, sequence: u64) -> Result<DlqEntry, ApiError> {
        self.send(self.request(Method::GET, &format!("/dlq/messages/{sequence}")))
            .await
    }

    pub async fn stats(&self) -> Result<DlqStats, ApiError> {
        self.send(self.request(Method::GET, "/dlq/stats")).await
    }

    pub async fn replay(&self, sequence: u64, delete_after: bool) -> Result<ReplayOutcome, ApiError> {
        self.send(
            self.request(Method::POST, &format!("/dlq/messages/{sequence}/replay"))
                .query(&[("delete_after", delete_after)]),
        )
        .await
    }

    pub async fn replay_bulk(
        &self,
        sequences: &[u64],
        delete_after: bool,
    ) -> Result<BulkReplayReport, ApiError> {
        self.send(
            self.request(Method::POST, "/dlq/replay")
                .json(&json!({ "sequences": sequences, "delete_after": delete_after })),
        )
        .await
    }

    pub async fn archive(
        &self,
        older_than_days: u32,
        delete_after: bool,
    ) -> Result<ArchiveReport, ApiError> {
        self.send(
            self.request(Method::POST, "/dlq/archive").json(&json!({
                "older_than_days": older_than_days,
                "delete_after": delete_after,
            })),
        )
        .await
    }

    pub async fn delete(&self, sequence: u64) -> Result<Value, ApiError> {
        self.send(self.request(Method::DELETE, &format!("/dlq/messages/{sequence}")))
            .await
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, format!("{}{path}", self.base_url))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        let response = request.send().await.map_err(|e| {
            if e.is_connect() {
                ApiError::Connection(self.base_url.clone())
            } else {
                ApiError::Http(e)
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|body| body.error)
            .unwrap_or(text);
        Err(ApiError::Api { status, message })
    }
}
