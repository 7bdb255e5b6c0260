//! Versioned pricing catalog.
//!
//! The catalog is a snapshot of price records behind an [`ArcSwap`]. Lookups
//! load the current snapshot without locking; [`PricingCatalog::reload`]
//! validates a complete replacement set and swaps it in with one pointer
//! store, so readers see either the old catalog or the new one, never a mix.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{MeterError, Result};

/// Highest accepted price per 1,000 units, in USD.
///
/// Keeps `u64::MAX` units at this price within `Decimal` range.
pub const MAX_PRICE_PER_1K: Decimal = Decimal::from_parts(1_000_000, 0, 0, false, 0);

/// Reject negative prices and prices above [`MAX_PRICE_PER_1K`].
pub(crate) fn check_prices(
    what: &str,
    input_per_1k: Decimal,
    output_per_1k: Decimal,
) -> Result<()> {
    for price in [input_per_1k, output_per_1k] {
        if price.is_sign_negative() {
            return Err(MeterError::Configuration(format!("negative price for {what}")));
        }
        if price > MAX_PRICE_PER_1K {
            return Err(MeterError::Configuration(format!(
                "price {price} for {what} exceeds {MAX_PRICE_PER_1K} per 1K"
            )));
        }
    }
    Ok(())
}

/// Key for looking up model pricing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelKey {
    /// Provider name (e.g., "anthropic", "openai").
    pub provider: String,
    /// Model name (e.g., "claude-3-5-sonnet", "gpt-4-turbo").
    pub model: String,
}

impl ModelKey {
    /// Create a new model key.
    #[must_use]
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

/// Price of one model, valid from `effective_from` until superseded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceRecord {
    /// Provider name.
    pub provider: String,
    /// Model name.
    pub model: String,
    /// USD per 1,000 input units.
    pub input_price_per_1k: Decimal,
    /// USD per 1,000 output units.
    pub output_price_per_1k: Decimal,
    /// When this price takes effect.
    pub effective_from: DateTime<Utc>,
    /// Label of the pricing source revision this record came from.
    pub version: String,
}

impl PriceRecord {
    /// Create a record effective from the Unix epoch.
    #[must_use]
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        input_price_per_1k: Decimal,
        output_price_per_1k: Decimal,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            input_price_per_1k,
            output_price_per_1k,
            effective_from: DateTime::<Utc>::UNIX_EPOCH,
            version: "unversioned".into(),
        }
    }

    /// Set the effective-from timestamp.
    #[must_use]
    pub fn effective_from(mut self, at: DateTime<Utc>) -> Self {
        self.effective_from = at;
        self
    }

    /// Set the version label.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// The lookup key of this record.
    #[must_use]
    pub fn key(&self) -> ModelKey {
        ModelKey::new(&self.provider, &self.model)
    }
}

/// Immutable view of the catalog at one generation.
#[derive(Debug, Default)]
struct Snapshot {
    generation: u64,
    /// Records per key, sorted by `effective_from` ascending.
    records: HashMap<ModelKey, Vec<PriceRecord>>,
}

impl Snapshot {
    fn build(generation: u64, records: Vec<PriceRecord>) -> Result<Self> {
        let mut by_key: HashMap<ModelKey, Vec<PriceRecord>> = HashMap::new();

        for record in records {
            check_prices(
                &format!("{}/{}", record.provider, record.model),
                record.input_price_per_1k,
                record.output_price_per_1k,
            )?;
            by_key.entry(record.key()).or_default().push(record);
        }

        for (key, versions) in &mut by_key {
            versions.sort_by_key(|r| r.effective_from);
            if versions
                .windows(2)
                .any(|w| w[0].effective_from == w[1].effective_from)
            {
                return Err(MeterError::Configuration(format!(
                    "two prices for {}/{} share an effective_from",
                    key.provider, key.model
                )));
            }
        }

        Ok(Self {
            generation,
            records: by_key,
        })
    }

    fn lookup(&self, key: &ModelKey, at: DateTime<Utc>) -> Option<&PriceRecord> {
        let versions = self.records.get(key)?;
        // Last record that is already in effect.
        let idx = versions.partition_point(|r| r.effective_from <= at);
        idx.checked_sub(1).map(|i| &versions[i])
    }
}

/// In-memory pricing catalog with point-in-time lookup and atomic reload.
#[derive(Debug)]
pub struct PricingCatalog {
    current: ArcSwap<Snapshot>,
    reload_lock: Mutex<()>,
}

impl Default for PricingCatalog {
    fn default() -> Self {
        Self::empty()
    }
}

impl PricingCatalog {
    /// Create a catalog with no records. Every lookup misses.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            current: ArcSwap::from_pointee(Snapshot::default()),
            reload_lock: Mutex::new(()),
        }
    }

    /// Create a catalog from an initial record set.
    ///
    /// # Errors
    ///
    /// Returns `MeterError::Configuration` if the records fail validation.
    pub fn new(records: Vec<PriceRecord>) -> Result<Self> {
        let catalog = Self::empty();
        catalog.reload(records)?;
        Ok(catalog)
    }

    /// Create a catalog seeded with built-in prices for common models.
    #[must_use]
    pub fn with_defaults() -> Self {
        let catalog = Self::empty();
        let snapshot = Snapshot::build(1, default_records())
            .unwrap_or_else(|_| Snapshot::default());
        catalog.current.store(Arc::new(snapshot));
        catalog
    }

    /// Find the record for `(provider, model)` in effect at `at`.
    ///
    /// Matching is exact on both parts of the key; there is no alias or
    /// prefix resolution.
    #[must_use]
    pub fn lookup(&self, provider: &str, model: &str, at: DateTime<Utc>) -> Option<PriceRecord> {
        let key = ModelKey::new(provider, model);
        self.current.load().lookup(&key, at).cloned()
    }

    /// Find the record for `(provider, model)` in effect now.
    #[must_use]
    pub fn lookup_now(&self, provider: &str, model: &str) -> Option<PriceRecord> {
        self.lookup(provider, model, Utc::now())
    }

    /// Replace the whole record set.
    ///
    /// The new set is validated before anything is swapped; on error the
    /// previous catalog stays active. Returns the new generation.
    ///
    /// # Errors
    ///
    /// Returns `MeterError::Configuration` for negative prices or two records
    /// sharing `(provider, model, effective_from)`.
    pub fn reload(&self, records: Vec<PriceRecord>) -> Result<u64> {
        let _guard = self
            .reload_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let generation = self.current.load().generation + 1;
        let count = records.len();
        let snapshot = Snapshot::build(generation, records)?;
        self.current.store(Arc::new(snapshot));

        tracing::info!(generation, records = count, "Pricing catalog reloaded");
        Ok(generation)
    }

    /// Parse a JSON array of price records and reload from it.
    ///
    /// # Errors
    ///
    /// Returns `MeterError::Serialization` if the JSON is invalid, or any
    /// error from [`reload`](Self::reload).
    pub fn reload_json(&self, json: &str) -> Result<u64> {
        let records: Vec<PriceRecord> = serde_json::from_str(json)?;
        self.reload(records)
    }

    /// Generation of the active snapshot (0 for a never-loaded catalog).
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.current.load().generation
    }

    /// Number of distinct `(provider, model)` keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.current.load().records.len()
    }

    /// Whether the catalog has no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Built-in prices, USD per 1K tokens.
#[must_use]
pub fn default_records() -> Vec<PriceRecord> {
    // (provider, model, input, output) with prices as (mantissa, scale).
    const TABLE: &[(&str, &str, (i64, u32), (i64, u32))] = &[
        // Anthropic models
        ("anthropic", "claude-3-5-sonnet", (3, 3), (15, 3)),
        ("anthropic", "claude-3-5-sonnet-20241022", (3, 3), (15, 3)),
        ("anthropic", "claude-3-haiku", (25, 5), (125, 5)),
        ("anthropic", "claude-3-opus", (15, 3), (75, 3)),
        // OpenAI models
        ("openai", "gpt-4-turbo", (1, 2), (3, 2)),
        ("openai", "gpt-4o", (25, 4), (1, 2)),
        ("openai", "gpt-4o-mini", (15, 5), (6, 4)),
        // Google models
        ("google", "gemini-1.5-pro", (125, 5), (5, 3)),
        ("google", "gemini-1.5-flash", (75, 6), (3, 4)),
    ];

    TABLE
        .iter()
        .map(|&(provider, model, (im, is), (om, os))| {
            PriceRecord::new(provider, model, Decimal::new(im, is), Decimal::new(om, os))
                .with_version("builtin")
        })
        .collect()
}
