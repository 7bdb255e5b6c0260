//! Usage events, call observations and batches.
//!
//! A [`CallObservation`] is what the instrumentation hook hands over after a
//! metered call completes. The [`EventBuilder`](crate::EventBuilder) turns it
//! into an immutable [`UsageEvent`]; the batch buffer groups events into
//! [`Batch`]es for delivery.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ids::{BatchId, EventId};

/// One normalized record of a single metered call.
///
/// Events are immutable once built; all fields are public for reading and for
/// serialization, but nothing in the pipeline mutates an event after the
/// builder returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    /// Unique event ID.
    pub event_id: EventId,

    /// When the underlying call completed.
    pub timestamp: DateTime<Utc>,

    /// Project the usage is attributed to.
    pub project_id: String,

    /// Innermost agent scope active when the call completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_tag: Option<String>,

    /// Merged metadata from all active scopes.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// Provider name (e.g. "anthropic").
    pub provider: String,

    /// Model name (e.g. "claude-3-5-sonnet").
    pub model: String,

    /// Input units (prompt tokens).
    pub input_units: u64,

    /// Output units (completion tokens).
    pub output_units: u64,

    /// How the unit counts were obtained.
    pub unit_source: UnitSource,

    /// Set when counting fell back to zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counting_warning: Option<String>,

    /// Cost in USD. Never negative.
    pub computed_cost: Decimal,

    /// How much the cost can be trusted.
    pub cost_confidence: CostConfidence,

    /// Version label of the price record used, if one matched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_version: Option<String>,

    /// Wall-clock latency of the call.
    pub latency_ms: u64,

    /// Error summary if the call failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CallError>,
}

/// Qualifier on a computed cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostConfidence {
    /// A catalog record matched the provider and model.
    Exact,
    /// No record matched; a configured fallback price was used.
    Estimated,
    /// No record matched and no fallback was configured; cost is zero.
    Unknown,
}

impl CostConfidence {
    /// Get the confidence as a string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Estimated => "estimated",
            Self::Unknown => "unknown",
        }
    }
}

/// Where the unit counts of an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitSource {
    /// Echoed from the usage block of the provider response.
    Reported,
    /// Counted with the model's tokenizer.
    Tokenizer,
    /// Estimated from characters or words.
    Heuristic,
}

/// Structured summary of a failed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallError {
    /// Short machine-readable kind (e.g. "rate_limited", "timeout").
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

impl CallError {
    /// Create a new error summary.
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Usage counts reported by the provider in its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedUsage {
    /// Input tokens.
    pub input_units: u64,
    /// Output tokens.
    pub output_units: u64,
}

/// A completed call as seen by the instrumentation hook.
#[derive(Debug, Clone)]
pub struct CallObservation {
    /// Provider name.
    pub provider: String,
    /// Model name.
    pub model: String,
    /// Raw prompt text.
    pub raw_input: String,
    /// Raw completion text (empty if the call failed early).
    pub raw_output: String,
    /// Usage block from the response, if the provider returned one.
    pub reported_usage: Option<ReportedUsage>,
    /// How long the call took.
    pub latency: Duration,
    /// When the call completed.
    pub completed_at: DateTime<Utc>,
    /// Error summary if the call failed.
    pub error: Option<CallError>,
}

impl CallObservation {
    /// Create an observation for a call that completed just now.
    #[must_use]
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            raw_input: String::new(),
            raw_output: String::new(),
            reported_usage: None,
            latency: Duration::ZERO,
            completed_at: Utc::now(),
            error: None,
        }
    }

    /// Set the raw prompt and completion text.
    #[must_use]
    pub fn with_io(mut self, raw_input: impl Into<String>, raw_output: impl Into<String>) -> Self {
        self.raw_input = raw_input.into();
        self.raw_output = raw_output.into();
        self
    }

    /// Set the usage reported by the provider.
    #[must_use]
    pub fn with_reported_usage(mut self, input_units: u64, output_units: u64) -> Self {
        self.reported_usage = Some(ReportedUsage {
            input_units,
            output_units,
        });
        self
    }

    /// Set the call latency.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Set the completion time.
    #[must_use]
    pub fn with_completed_at(mut self, completed_at: DateTime<Utc>) -> Self {
        self.completed_at = completed_at;
        self
    }

    /// Mark the call as failed.
    #[must_use]
    pub fn with_error(mut self, error: CallError) -> Self {
        self.error = Some(error);
        self
    }

    /// Whether the call failed before the provider reported or produced any usage.
    #[must_use]
    pub fn failed_before_usage(&self) -> bool {
        self.error.is_some() && self.reported_usage.is_none() && self.raw_output.is_empty()
    }
}

/// What caused a batch to be sealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushTrigger {
    /// The buffer reached its size threshold.
    Size,
    /// The flush interval elapsed.
    Timer,
    /// A caller asked for a flush.
    Manual,
    /// The pipeline is shutting down.
    Shutdown,
}

/// A sealed, ordered group of usage events delivered as one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// Stable identifier, sent as the idempotency key on every attempt.
    pub batch_id: BatchId,
    /// Project all events belong to.
    pub project_id: String,
    /// When the batch was sealed.
    pub sealed_at: DateTime<Utc>,
    /// What sealed the batch.
    pub trigger: FlushTrigger,
    /// Events in append order.
    pub events: Vec<UsageEvent>,
}

impl Batch {
    /// Seal a batch from buffered events.
    #[must_use]
    pub fn seal(
        project_id: impl Into<String>,
        trigger: FlushTrigger,
        events: Vec<UsageEvent>,
    ) -> Self {
        Self {
            batch_id: BatchId::generate(),
            project_id: project_id.into(),
            sealed_at: Utc::now(),
            trigger,
            events,
        }
    }

    /// Number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Total cost of all events in the batch.
    #[must_use]
    pub fn total_cost(&self) -> Decimal {
        self.events
            .iter()
            .fold(Decimal::ZERO, |total, e| total.saturating_add(e.computed_cost))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn event(cost: Decimal) -> UsageEvent {
        UsageEvent {
            event_id: EventId::generate(),
            timestamp: Utc::now(),
            project_id: "proj".into(),
            agent_tag: None,
            metadata: BTreeMap::new(),
            provider: "openai".into(),
            model: "gpt-4o".into(),
            input_units: 10,
            output_units: 5,
            unit_source: UnitSource::Reported,
            counting_warning: None,
            computed_cost: cost,
            cost_confidence: CostConfidence::Exact,
            price_version: None,
            latency_ms: 12,
            error: None,
        }
    }

    #[test]
    fn batch_total_cost() {
        let batch = Batch::seal(
            "proj",
            FlushTrigger::Manual,
            vec![event(dec!(0.25)), event(dec!(0.5)), event(dec!(1))],
        );
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.total_cost(), dec!(1.75));
    }

    #[test]
    fn batch_total_cost_saturates() {
        let batch = Batch::seal(
            "proj",
            FlushTrigger::Manual,
            vec![event(Decimal::MAX), event(Decimal::MAX)],
        );
        assert_eq!(batch.total_cost(), Decimal::MAX);
    }

    #[test]
    fn failed_before_usage_requires_no_output() {
        let failed = CallObservation::new("openai", "gpt-4o")
            .with_io("hello", "")
            .with_error(CallError::new("timeout", "deadline exceeded"));
        assert!(failed.failed_before_usage());

        let partial = failed.clone().with_reported_usage(5, 0);
        assert!(!partial.failed_before_usage());
    }

    #[test]
    fn usage_event_wire_shape() {
        let json = serde_json::to_value(event(dec!(0.002))).unwrap();
        assert_eq!(json["cost_confidence"], "exact");
        assert_eq!(json["unit_source"], "reported");
        assert!(json.get("agent_tag").is_none());
        assert!(json.get("error").is_none());
    }

    #[test]
    fn confidence_as_str() {
        assert_eq!(CostConfidence::Exact.as_str(), "exact");
        assert_eq!(CostConfidence::Estimated.as_str(), "estimated");
        assert_eq!(CostConfidence::Unknown.as_str(), "unknown");
    }
}
