//! Event builder.

use crate::context::TagContext;
use crate::cost::CostEngine;
use crate::counting::{CounterRegistry, UnitCount};
use crate::event::{CallObservation, UsageEvent};
use crate::ids::EventId;

/// Turns call observations into usage events.
///
/// Building never fails: counting problems are recorded on the event as a
/// warning, pricing misses are handled by the engine's [`MissPolicy`], and
/// call failures are carried in [`UsageEvent::error`].
///
/// [`MissPolicy`]: crate::MissPolicy
#[derive(Debug, Clone)]
pub struct EventBuilder {
    project_id: String,
    counters: CounterRegistry,
    cost: CostEngine,
}

impl EventBuilder {
    /// Create a builder for one project.
    #[must_use]
    pub fn new(project_id: impl Into<String>, counters: CounterRegistry, cost: CostEngine) -> Self {
        Self {
            project_id: project_id.into(),
            counters,
            cost,
        }
    }

    /// Project ID stamped on every event.
    #[must_use]
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Cost engine used for pricing.
    #[must_use]
    pub fn cost_engine(&self) -> &CostEngine {
        &self.cost
    }

    /// Build an event from an observation and the tags active at completion.
    #[must_use]
    pub fn build(&self, observation: &CallObservation, context: &TagContext) -> UsageEvent {
        let units = if observation.failed_before_usage() {
            let source = self
                .counters
                .resolve(&observation.provider, &observation.model)
                .source();
            UnitCount::new(0, 0, source)
        } else {
            self.counters.count(observation)
        };

        if let Some(warning) = &units.warning {
            tracing::debug!(
                provider = %observation.provider,
                model = %observation.model,
                warning = %warning,
                "Counting fell back to zero"
            );
        }

        let cost = self.cost.compute_at(
            units.input_units,
            units.output_units,
            &observation.provider,
            &observation.model,
            observation.completed_at,
        );

        UsageEvent {
            event_id: EventId::generate(),
            timestamp: observation.completed_at,
            project_id: self.project_id.clone(),
            agent_tag: context.agent().map(str::to_string),
            metadata: context.metadata().clone(),
            provider: observation.provider.clone(),
            model: observation.model.clone(),
            input_units: units.input_units,
            output_units: units.output_units,
            unit_source: units.source,
            counting_warning: units.warning.map(|w| w.to_string()),
            computed_cost: cost.cost,
            cost_confidence: cost.confidence,
            price_version: cost.price_version,
            latency_ms: u64::try_from(observation.latency.as_millis()).unwrap_or(u64::MAX),
            error: observation.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CallError, CostConfidence, UnitSource};
    use crate::pricing::{PriceRecord, PricingCatalog};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use std::time::Duration;

    fn builder() -> EventBuilder {
        let catalog =
            PricingCatalog::new(vec![PriceRecord::new("p", "m", dec!(10), dec!(20))]).unwrap();
        EventBuilder::new(
            "proj-1",
            CounterRegistry::default(),
            CostEngine::new(Arc::new(catalog)),
        )
    }

    #[test]
    fn builds_priced_event_with_tags() {
        let ctx = TagContext::new()
            .with_agent("A")
            .with_metadata([("session", "s-1")])
            .with_agent("B");
        let observation = CallObservation::new("p", "m")
            .with_reported_usage(1000, 500)
            .with_latency(Duration::from_millis(250));

        let event = builder().build(&observation, &ctx);

        assert_eq!(event.project_id, "proj-1");
        assert_eq!(event.agent_tag.as_deref(), Some("B"));
        assert_eq!(event.metadata["session"], "s-1");
        assert_eq!(event.computed_cost, dec!(20));
        assert_eq!(event.cost_confidence, CostConfidence::Exact);
        assert_eq!(event.unit_source, UnitSource::Reported);
        assert_eq!(event.latency_ms, 250);
        assert_eq!(event.timestamp, observation.completed_at);
    }

    #[test]
    fn unknown_model_still_builds() {
        let observation = CallObservation::new("p", "unlisted").with_reported_usage(10, 10);
        let event = builder().build(&observation, &TagContext::new());
        assert_eq!(event.computed_cost, Decimal::ZERO);
        assert_eq!(event.cost_confidence, CostConfidence::Unknown);
        assert!(event.agent_tag.is_none());
    }

    #[test]
    fn early_failure_has_zero_usage() {
        let observation = CallObservation::new("p", "m")
            .with_io("a long prompt that never got answered", "")
            .with_error(CallError::new("connect", "connection refused"));

        let event = builder().build(&observation, &TagContext::new());
        assert_eq!((event.input_units, event.output_units), (0, 0));
        assert_eq!(event.computed_cost, Decimal::ZERO);
        assert_eq!(event.error.as_ref().unwrap().kind, "connect");
    }

    #[test]
    fn failure_with_reported_usage_is_billed() {
        let observation = CallObservation::new("p", "m")
            .with_reported_usage(1000, 0)
            .with_error(CallError::new("content_filter", "blocked"));

        let event = builder().build(&observation, &TagContext::new());
        assert_eq!(event.computed_cost, dec!(10));
        assert!(event.error.is_some());
    }

    #[test]
    fn oversized_usage_builds_with_unknown_cost() {
        let policy = crate::MissPolicy::Fallback {
            input_price_per_1k: dec!(10_000_000_000_000),
            output_price_per_1k: dec!(1),
        };
        let builder = EventBuilder::new(
            "proj-1",
            CounterRegistry::default(),
            CostEngine::with_policy(Arc::new(PricingCatalog::empty()), policy),
        );
        let observation = CallObservation::new("p", "unlisted").with_reported_usage(u64::MAX, 0);

        let event = builder.build(&observation, &TagContext::new());
        assert_eq!(event.input_units, u64::MAX);
        assert_eq!(event.computed_cost, Decimal::ZERO);
        assert_eq!(event.cost_confidence, CostConfidence::Unknown);
    }

    #[test]
    fn empty_call_carries_warning() {
        let event = builder().build(&CallObservation::new("p", "m"), &TagContext::new());
        assert_eq!(event.input_units, 0);
        assert_eq!(event.counting_warning.as_deref(), Some("empty input and output"));
    }
}
