//! Error types for z-meter.
//!
//! None of these ever cross the instrumentation boundary. The pipeline absorbs
//! them, counts them and logs them; they exist so internal components can
//! report what went wrong to the layer that decides the disposition.

use crate::ids::IdError;

/// Result type for z-meter operations.
pub type Result<T> = std::result::Result<T, MeterError>;

/// Errors that can occur in z-meter operations.
#[derive(Debug, thiserror::Error)]
pub enum MeterError {
    /// Unit counting could not produce real counts; zero was used instead.
    #[error("counting warning: {0}")]
    CountingWarning(#[from] CountingWarning),

    /// No price record matched the (provider, model) pair.
    #[error("no price for {provider}/{model}")]
    PricingMiss {
        /// Provider name.
        provider: String,
        /// Model name.
        model: String,
    },

    /// Delivery failed in a way that may succeed on retry.
    #[error("transient transport failure: {0}")]
    TransportTransient(String),

    /// The collector rejected a batch; retrying will not help.
    #[error("permanent transport failure: {0}")]
    TransportPermanent(String),

    /// The pending batch cap was exceeded and the oldest batch was dropped.
    #[error("buffer overflow: dropped batch with {dropped_events} events")]
    BufferOverflow {
        /// Number of events in the dropped batch.
        dropped_events: usize,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl MeterError {
    /// Whether retrying the failed operation can succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransportTransient(_))
    }
}

/// Non-fatal problems hit while counting units.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CountingWarning {
    /// Both input and output were empty.
    #[error("empty input and output")]
    EmptyInput,

    /// The tokenizer for the model could not be loaded.
    #[error("tokenizer unavailable for model {model}")]
    TokenizerUnavailable {
        /// The model that was being counted.
        model: String,
    },
}

impl From<serde_json::Error> for MeterError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
