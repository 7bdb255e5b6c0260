//! Cost computation.
//!
//! ```text
//! cost = input_units / 1000 × input_price_per_1k
//!      + output_units / 1000 × output_price_per_1k
//! ```
//!
//! All arithmetic is `Decimal`, so summing millions of tiny per-call costs
//! does not accumulate floating-point drift.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{MeterError, Result};
use crate::event::CostConfidence;
use crate::pricing::{check_prices, PricingCatalog};

/// What to do when the catalog has no price for a model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum MissPolicy {
    /// Report zero cost with [`CostConfidence::Unknown`].
    #[default]
    Unknown,
    /// Price with these rates and report [`CostConfidence::Estimated`].
    Fallback {
        /// USD per 1,000 input units.
        input_price_per_1k: Decimal,
        /// USD per 1,000 output units.
        output_price_per_1k: Decimal,
    },
}

impl MissPolicy {
    /// Check that fallback prices are in the catalog's accepted range.
    ///
    /// # Errors
    ///
    /// Returns `MeterError::Configuration` for negative or oversized prices.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Unknown => Ok(()),
            Self::Fallback {
                input_price_per_1k,
                output_price_per_1k,
            } => check_prices("fallback", *input_price_per_1k, *output_price_per_1k),
        }
    }
}

/// Result of a cost computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CostResult {
    /// Cost in USD, never negative.
    pub cost: Decimal,
    /// How the price was resolved.
    pub confidence: CostConfidence,
    /// Version label of the matched record, if any.
    pub price_version: Option<String>,
}

impl CostResult {
    fn unknown() -> Self {
        Self {
            cost: Decimal::ZERO,
            confidence: CostConfidence::Unknown,
            price_version: None,
        }
    }
}

/// Combines unit counts with catalog prices.
#[derive(Debug, Clone)]
pub struct CostEngine {
    catalog: Arc<PricingCatalog>,
    policy: MissPolicy,
}

impl CostEngine {
    /// Create an engine with the default miss policy ([`MissPolicy::Unknown`]).
    #[must_use]
    pub fn new(catalog: Arc<PricingCatalog>) -> Self {
        Self::with_policy(catalog, MissPolicy::default())
    }

    /// Create an engine with an explicit miss policy.
    #[must_use]
    pub fn with_policy(catalog: Arc<PricingCatalog>, policy: MissPolicy) -> Self {
        Self { catalog, policy }
    }

    /// The catalog this engine prices against.
    #[must_use]
    pub fn catalog(&self) -> &Arc<PricingCatalog> {
        &self.catalog
    }

    /// The configured miss policy.
    #[must_use]
    pub fn policy(&self) -> &MissPolicy {
        &self.policy
    }

    /// Compute the cost of a call at the current time.
    #[must_use]
    pub fn compute(
        &self,
        input_units: u64,
        output_units: u64,
        provider: &str,
        model: &str,
    ) -> CostResult {
        self.compute_at(input_units, output_units, provider, model, Utc::now())
    }

    /// Compute the cost of a call using the price in effect at `at`.
    ///
    /// A cost outside `Decimal` range is reported as unknown rather than
    /// clamped.
    #[must_use]
    pub fn compute_at(
        &self,
        input_units: u64,
        output_units: u64,
        provider: &str,
        model: &str,
        at: DateTime<Utc>,
    ) -> CostResult {
        let (input_per_1k, output_per_1k, confidence, price_version) =
            if let Some(record) = self.catalog.lookup(provider, model, at) {
                (
                    record.input_price_per_1k,
                    record.output_price_per_1k,
                    CostConfidence::Exact,
                    Some(record.version),
                )
            } else {
                let miss = MeterError::PricingMiss {
                    provider: provider.to_string(),
                    model: model.to_string(),
                };
                tracing::debug!(error = %miss, policy = ?self.policy, "Pricing miss");

                match &self.policy {
                    MissPolicy::Unknown => return CostResult::unknown(),
                    MissPolicy::Fallback {
                        input_price_per_1k,
                        output_price_per_1k,
                    } => (
                        *input_price_per_1k,
                        *output_price_per_1k,
                        CostConfidence::Estimated,
                        None,
                    ),
                }
            };

        match price(input_units, output_units, input_per_1k, output_per_1k) {
            Some(cost) => CostResult {
                cost,
                confidence,
                price_version,
            },
            None => {
                tracing::warn!(
                    provider,
                    model,
                    input_units,
                    output_units,
                    "Cost out of range, reporting unknown"
                );
                CostResult::unknown()
            }
        }
    }
}

fn price(
    input_units: u64,
    output_units: u64,
    input_per_1k: Decimal,
    output_per_1k: Decimal,
) -> Option<Decimal> {
    let thousand = Decimal::ONE_THOUSAND;
    let input = (Decimal::from(input_units) / thousand).checked_mul(input_per_1k)?;
    let output = (Decimal::from(output_units) / thousand).checked_mul(output_per_1k)?;
    Some(input.checked_add(output)?.max(Decimal::ZERO).normalize())
}
