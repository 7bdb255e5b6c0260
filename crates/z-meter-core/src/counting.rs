//! Unit counting strategies.
//!
//! A [`UnitCounter`] turns raw prompt/completion text into unit counts. The
//! [`CounterRegistry`] picks the strategy for a call: provider-reported usage
//! when present, else the strategy registered for the exact model, else the
//! one for the provider, else the default.
//!
//! Counters never fail. When they cannot count they return zeros and a
//! [`CountingWarning`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};

use tiktoken_rs::{cl100k_base, o200k_base, CoreBPE};

use crate::error::CountingWarning;
use crate::event::{CallObservation, UnitSource};
use crate::pricing::ModelKey;

static CL100K: LazyLock<Option<CoreBPE>> = LazyLock::new(|| cl100k_base().ok());
static O200K: LazyLock<Option<CoreBPE>> = LazyLock::new(|| o200k_base().ok());

/// Input and output unit counts for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitCount {
    /// Input units.
    pub input_units: u64,
    /// Output units.
    pub output_units: u64,
    /// Strategy that produced the counts.
    pub source: UnitSource,
    /// Set when the counts are a zero fallback.
    pub warning: Option<CountingWarning>,
}

impl UnitCount {
    /// Counts with no warning.
    #[must_use]
    pub fn new(input_units: u64, output_units: u64, source: UnitSource) -> Self {
        Self {
            input_units,
            output_units,
            source,
            warning: None,
        }
    }

    /// Zero counts flagged with a warning.
    #[must_use]
    pub fn zero(source: UnitSource, warning: CountingWarning) -> Self {
        Self {
            input_units: 0,
            output_units: 0,
            source,
            warning: Some(warning),
        }
    }
}

/// A strategy for counting units in raw call text.
pub trait UnitCounter: Send + Sync {
    /// How counts produced by this strategy are labelled.
    fn source(&self) -> UnitSource;

    /// Count input and output units. Must not panic on any input.
    fn count(&self, raw_input: &str, raw_output: &str, model: &str) -> UnitCount;
}

/// Exact counting with a BPE tokenizer.
///
/// GPT-4o, the o-series, GPT-4.1 and GPT-5 use `o200k_base`; everything else
/// is counted with `cl100k_base`, which is close for most modern models.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenizerCounter;

impl TokenizerCounter {
    /// Create a tokenizer counter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn encoding_for(model: &str) -> Option<&'static CoreBPE> {
        let model = model.to_ascii_lowercase();
        let o200k = ["gpt-4o", "gpt-4.1", "gpt-5", "o1", "o3", "o4"]
            .iter()
            .any(|prefix| model.starts_with(prefix));
        if o200k {
            O200K.as_ref()
        } else {
            CL100K.as_ref()
        }
    }
}

impl UnitCounter for TokenizerCounter {
    fn source(&self) -> UnitSource {
        UnitSource::Tokenizer
    }

    fn count(&self, raw_input: &str, raw_output: &str, model: &str) -> UnitCount {
        if raw_input.is_empty() && raw_output.is_empty() {
            return UnitCount::zero(self.source(), CountingWarning::EmptyInput);
        }

        let Some(bpe) = Self::encoding_for(model) else {
            return UnitCount::zero(
                self.source(),
                CountingWarning::TokenizerUnavailable {
                    model: model.to_string(),
                },
            );
        };

        let tokens = |text: &str| bpe.encode_with_special_tokens(text).len() as u64;
        UnitCount::new(tokens(raw_input), tokens(raw_output), self.source())
    }
}

/// How a [`HeuristicCounter`] estimates units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeuristicMode {
    /// One unit per `n` characters, rounded up.
    Chars(u32),
    /// Four units per three whitespace-separated words, rounded up.
    Words,
}

/// Cheap estimate for models without a known tokenizer.
#[derive(Debug, Clone, Copy)]
pub struct HeuristicCounter {
    mode: HeuristicMode,
}

impl Default for HeuristicCounter {
    fn default() -> Self {
        Self::chars(4)
    }
}

impl HeuristicCounter {
    /// One unit per `chars_per_unit` characters (a ratio of 0 is treated as 1).
    #[must_use]
    pub const fn chars(chars_per_unit: u32) -> Self {
        Self {
            mode: HeuristicMode::Chars(chars_per_unit),
        }
    }

    /// Word-based estimate.
    #[must_use]
    pub const fn words() -> Self {
        Self {
            mode: HeuristicMode::Words,
        }
    }

    fn estimate(&self, text: &str) -> u64 {
        match self.mode {
            HeuristicMode::Chars(ratio) => {
                let chars = text.chars().count() as u64;
                chars.div_ceil(u64::from(ratio.max(1)))
            }
            HeuristicMode::Words => {
                let words = text.split_whitespace().count() as u64;
                (words * 4).div_ceil(3)
            }
        }
    }
}

impl UnitCounter for HeuristicCounter {
    fn source(&self) -> UnitSource {
        UnitSource::Heuristic
    }

    fn count(&self, raw_input: &str, raw_output: &str, _model: &str) -> UnitCount {
        if raw_input.is_empty() && raw_output.is_empty() {
            return UnitCount::zero(self.source(), CountingWarning::EmptyInput);
        }
        UnitCount::new(self.estimate(raw_input), self.estimate(raw_output), self.source())
    }
}

/// Chooses a counting strategy per call.
#[derive(Clone)]
pub struct CounterRegistry {
    default: Arc<dyn UnitCounter>,
    by_provider: HashMap<String, Arc<dyn UnitCounter>>,
    by_model: HashMap<ModelKey, Arc<dyn UnitCounter>>,
    prefer_reported: bool,
}

impl fmt::Debug for CounterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterRegistry")
            .field("default", &self.default.source())
            .field("providers", &self.by_provider.keys().collect::<Vec<_>>())
            .field("models", &self.by_model.keys().collect::<Vec<_>>())
            .field("prefer_reported", &self.prefer_reported)
            .finish()
    }
}

impl Default for CounterRegistry {
    fn default() -> Self {
        Self::new(Arc::new(TokenizerCounter::new()))
    }
}

impl CounterRegistry {
    /// Create a registry with a default strategy and no overrides.
    #[must_use]
    pub fn new(default: Arc<dyn UnitCounter>) -> Self {
        Self {
            default,
            by_provider: HashMap::new(),
            by_model: HashMap::new(),
            prefer_reported: true,
        }
    }

    /// Use `counter` for every model of `provider`.
    #[must_use]
    pub fn with_provider(
        mut self,
        provider: impl Into<String>,
        counter: Arc<dyn UnitCounter>,
    ) -> Self {
        self.by_provider.insert(provider.into(), counter);
        self
    }

    /// Use `counter` for one exact `(provider, model)` pair.
    #[must_use]
    pub fn with_model(
        mut self,
        provider: impl Into<String>,
        model: impl Into<String>,
        counter: Arc<dyn UnitCounter>,
    ) -> Self {
        self.by_model.insert(ModelKey::new(provider, model), counter);
        self
    }

    /// Whether provider-reported usage wins over local counting (default: true).
    #[must_use]
    pub fn prefer_reported(mut self, prefer: bool) -> Self {
        self.prefer_reported = prefer;
        self
    }

    /// Strategy that applies to `(provider, model)`.
    #[must_use]
    pub fn resolve(&self, provider: &str, model: &str) -> &Arc<dyn UnitCounter> {
        self.by_model
            .get(&ModelKey::new(provider, model))
            .or_else(|| self.by_provider.get(provider))
            .unwrap_or(&self.default)
    }

    /// Count units for an observed call.
    #[must_use]
    pub fn count(&self, observation: &CallObservation) -> UnitCount {
        if self.prefer_reported {
            if let Some(reported) = observation.reported_usage {
                return UnitCount::new(
                    reported.input_units,
                    reported.output_units,
                    UnitSource::Reported,
                );
            }
        }

        self.resolve(&observation.provider, &observation.model).count(
            &observation.raw_input,
            &observation.raw_output,
            &observation.model,
        )
    }
}
