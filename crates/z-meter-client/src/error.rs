//! Client error types.

use z_meter_core::MeterError;
use z_meter_store::StoreError;

/// Errors returned by a [`Transport`](crate::Transport).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// HTTP request failed before a response arrived.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The collector answered with a non-success status.
    #[error("collector error: {status} - {code}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error code from the response body, or "unknown".
        code: String,
        /// Error message.
        message: String,
    },

    /// The batch could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The destination is temporarily unreachable (non-HTTP transports).
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The destination refused the batch for good (non-HTTP transports).
    #[error("rejected: {0}")]
    Rejected(String),
}

impl TransportError {
    /// Whether the same batch may be accepted on a later attempt.
    ///
    /// Timeouts, throttling and server errors are transient; any other client
    /// error means the collector will keep rejecting this batch.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) | Self::Unavailable(_) => true,
            Self::Api { status, .. } => is_transient_status(*status),
            Self::Serialization(_) | Self::Rejected(_) => false,
        }
    }
}

pub(crate) fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 425 | 429) || status >= 500
}

impl From<TransportError> for MeterError {
    fn from(err: TransportError) -> Self {
        if err.is_transient() {
            Self::TransportTransient(err.to_string())
        } else {
            Self::TransportPermanent(err.to_string())
        }
    }
}

/// Errors from setting up or managing the metering pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Local fallback store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Core error (pricing reload, serialization).
    #[error(transparent)]
    Meter(#[from] MeterError),

    /// Transport setup failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A global meter is already installed.
    #[error("a global meter is already installed")]
    AlreadyInstalled,
}
