//! Wire types for the collector endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use z_meter_core::{Batch, BatchId, UsageEvent};

/// Body of `POST /v1/usage/batch`.
#[derive(Debug, Clone, Serialize)]
pub struct BatchUsageRequest<'a> {
    /// Idempotency key; identical on every retry of the same batch.
    pub batch_id: BatchId,
    /// Project the events belong to.
    pub project_id: &'a str,
    /// When the batch was sealed.
    pub sealed_at: DateTime<Utc>,
    /// Events in append order.
    pub events: &'a [UsageEvent],
}

impl<'a> From<&'a Batch> for BatchUsageRequest<'a> {
    fn from(batch: &'a Batch) -> Self {
        Self {
            batch_id: batch.batch_id,
            project_id: &batch.project_id,
            sealed_at: batch.sealed_at,
            events: &batch.events,
        }
    }
}

/// Success response from the collector. Every field is optional; an empty
/// 2xx body is a valid acknowledgement.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BatchUsageResponse {
    /// Number of events the collector stored.
    #[serde(default)]
    pub accepted: Option<usize>,
    /// Set when the collector had already seen this batch ID.
    #[serde(default)]
    pub duplicate: bool,
}

/// Acknowledgement of a delivered batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// Number of events the collector accepted.
    pub accepted: usize,
    /// The collector had already stored this batch.
    pub duplicate: bool,
}

/// API error response.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorResponse {
    /// Error details.
    pub error: ApiErrorBody,
}

/// API error body.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    /// Error code.
    pub code: String,
    /// Error message.
    pub message: String,
    /// Additional details.
    pub details: Option<serde_json::Value>,
}
