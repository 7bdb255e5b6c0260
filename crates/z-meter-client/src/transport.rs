//! Batch transport.
//!
//! [`HttpTransport`] posts sealed batches to the collector. Other transports
//! (tests, in-process sinks) implement [`Transport`] directly.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use z_meter_core::Batch;

use crate::error::{ClientError, TransportError};
use crate::types::{Ack, ApiErrorResponse, BatchUsageRequest, BatchUsageResponse};

/// Destination for sealed batches.
///
/// Implementations must be safe to call again with the same batch; the batch
/// ID is the idempotency key.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one batch.
    async fn send(&self, batch: &Batch) -> Result<Ack, TransportError>;
}

/// HTTP transport for the collector's `/v1/usage/batch` endpoint.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpTransport {
    /// Create a transport with a 30 second request timeout.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Base URL of the collector (e.g., `"http://collector:8080"`)
    /// * `api_key` - API key for authentication
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, ClientError> {
        Self::with_timeout(base_url, api_key, Duration::from_secs(30))
    }

    /// Create a transport with a custom request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn with_timeout(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(TransportError::Http)?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    /// Collector base URL without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Convert a non-success response into a `TransportError`.
    async fn error_from(response: reqwest::Response) -> TransportError {
        let status = response.status();
        let error_body: Result<ApiErrorResponse, _> = response.json().await;

        match error_body {
            Ok(api_error) => TransportError::Api {
                status: status.as_u16(),
                code: api_error.error.code,
                message: api_error.error.message,
            },
            Err(_) => TransportError::Api {
                status: status.as_u16(),
                code: "unknown".to_string(),
                message: format!("HTTP {status}"),
            },
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, batch: &Batch) -> Result<Ack, TransportError> {
        let url = format!("{}/v1/usage/batch", self.base_url);
        let body = serde_json::to_vec(&BatchUsageRequest::from(batch))?;

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("x-project-id", &batch.project_id)
            .header("idempotency-key", batch.batch_id.to_string())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let bytes = response.bytes().await?;
        let parsed: BatchUsageResponse = if bytes.is_empty() {
            BatchUsageResponse::default()
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::debug!(
                    batch_id = %batch.batch_id,
                    error = %e,
                    "Unreadable ack body, assuming every event accepted"
                );
                BatchUsageResponse::default()
            })
        };

        Ok(Ack {
            accepted: parsed.accepted.unwrap_or(batch.len()),
            duplicate: parsed.duplicate,
        })
    }
}
