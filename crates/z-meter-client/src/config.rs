//! Meter configuration.

use std::path::PathBuf;
use std::time::Duration;

use rust_decimal::Decimal;
use z_meter_core::MissPolicy;

use crate::delivery::RetryPolicy;
use crate::error::ClientError;

/// Largest accepted size trigger.
pub const MAX_FLUSH_SIZE: usize = 1_000_000;

/// Pipeline configuration loaded from environment variables or built in code.
#[derive(Debug, Clone)]
pub struct MeterConfig {
    /// Project every event is attributed to.
    pub project_id: String,

    /// Collector base URL (default: `http://localhost:8080`).
    pub collector_url: String,

    /// API key sent as `x-api-key`.
    pub api_key: String,

    /// Events per batch before a size flush (default: 100, at most
    /// [`MAX_FLUSH_SIZE`]).
    pub flush_size: usize,

    /// Time between timer flushes (default: 5s).
    pub flush_interval: Duration,

    /// Delivery attempts per batch, first attempt included (default: 5).
    pub max_attempts: u32,

    /// Delay before the first retry (default: 500ms).
    pub backoff_base: Duration,

    /// Upper bound for any retry delay (default: 30s).
    pub backoff_cap: Duration,

    /// Pricing behaviour for models missing from the catalog.
    pub miss_policy: MissPolicy,

    /// Spill undeliverable batches to local storage instead of dropping them.
    pub local_persistence: bool,

    /// Directory for spilled batches (default: `./z-meter-spill`).
    pub spill_dir: PathBuf,

    /// How long shutdown waits for in-flight delivery (default: 10s).
    pub shutdown_timeout: Duration,

    /// Sealed batches waiting for delivery before the oldest is dropped
    /// (default: 1000).
    pub max_pending_batches: usize,

    /// HTTP request timeout (default: 30s).
    pub request_timeout: Duration,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            project_id: "default".into(),
            collector_url: "http://localhost:8080".into(),
            api_key: String::new(),
            flush_size: 100,
            flush_interval: Duration::from_secs(5),
            max_attempts: 5,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
            miss_policy: MissPolicy::Unknown,
            local_persistence: false,
            spill_dir: PathBuf::from("./z-meter-spill"),
            shutdown_timeout: Duration::from_secs(10),
            max_pending_batches: 1000,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl MeterConfig {
    /// Create a configuration for a project with defaults elsewhere.
    #[must_use]
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            ..Self::default()
        }
    }

    /// Load configuration from `Z_METER_*` environment variables.
    ///
    /// Unset or unparsable values fall back to the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub(crate) fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parse = |key: &str| var(key).and_then(|s| s.trim().parse::<u64>().ok());
        let millis = |key: &str, default: Duration| {
            parse(key).map_or(default, Duration::from_millis)
        };

        let fallback_in = var("Z_METER_FALLBACK_INPUT_PRICE_PER_1K")
            .and_then(|s| s.trim().parse::<Decimal>().ok());
        let fallback_out = var("Z_METER_FALLBACK_OUTPUT_PRICE_PER_1K")
            .and_then(|s| s.trim().parse::<Decimal>().ok());
        let miss_policy = match (fallback_in, fallback_out) {
            (Some(input_price_per_1k), Some(output_price_per_1k)) => MissPolicy::Fallback {
                input_price_per_1k,
                output_price_per_1k,
            },
            _ => MissPolicy::Unknown,
        };

        Self {
            project_id: var("Z_METER_PROJECT_ID").unwrap_or(defaults.project_id),
            collector_url: var("Z_METER_COLLECTOR_URL").unwrap_or(defaults.collector_url),
            api_key: var("Z_METER_API_KEY").unwrap_or(defaults.api_key),
            flush_size: parse("Z_METER_FLUSH_SIZE")
                .and_then(|n| usize::try_from(n).ok())
                .unwrap_or(defaults.flush_size),
            flush_interval: millis("Z_METER_FLUSH_INTERVAL_MS", defaults.flush_interval),
            max_attempts: parse("Z_METER_MAX_ATTEMPTS")
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(defaults.max_attempts),
            backoff_base: millis("Z_METER_BACKOFF_BASE_MS", defaults.backoff_base),
            backoff_cap: millis("Z_METER_BACKOFF_CAP_MS", defaults.backoff_cap),
            miss_policy,
            local_persistence: var("Z_METER_LOCAL_PERSISTENCE")
                .map_or(defaults.local_persistence, |s| {
                    matches!(s.trim(), "1" | "true" | "TRUE" | "yes")
                }),
            spill_dir: var("Z_METER_SPILL_DIR").map_or(defaults.spill_dir, PathBuf::from),
            shutdown_timeout: millis("Z_METER_SHUTDOWN_TIMEOUT_MS", defaults.shutdown_timeout),
            max_pending_batches: parse("Z_METER_MAX_PENDING_BATCHES")
                .and_then(|n| usize::try_from(n).ok())
                .unwrap_or(defaults.max_pending_batches),
            request_timeout: millis("Z_METER_REQUEST_TIMEOUT_MS", defaults.request_timeout),
        }
    }

    /// Check the configuration for values the pipeline cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Configuration` naming the first invalid field.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.project_id.trim().is_empty() {
            return Err(ClientError::Configuration("project_id is empty".into()));
        }
        if self.flush_size == 0 {
            return Err(ClientError::Configuration("flush_size must be > 0".into()));
        }
        if self.flush_size > MAX_FLUSH_SIZE {
            return Err(ClientError::Configuration(format!(
                "flush_size must be <= {MAX_FLUSH_SIZE}"
            )));
        }
        if self.flush_interval.is_zero() {
            return Err(ClientError::Configuration(
                "flush_interval must be > 0".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ClientError::Configuration("max_attempts must be > 0".into()));
        }
        if self.backoff_base > self.backoff_cap {
            return Err(ClientError::Configuration(
                "backoff_base must not exceed backoff_cap".into(),
            ));
        }
        if self.max_pending_batches == 0 {
            return Err(ClientError::Configuration(
                "max_pending_batches must be > 0".into(),
            ));
        }
        self.miss_policy
            .validate()
            .map_err(|e| ClientError::Configuration(e.to_string()))?;
        Ok(())
    }

    /// Retry policy derived from the attempt ceiling and backoff bounds.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.backoff_base, self.backoff_cap)
    }

    /// Set the collector URL and API key.
    #[must_use]
    pub fn with_collector(mut self, url: impl Into<String>, api_key: impl Into<String>) -> Self {
        self.collector_url = url.into();
        self.api_key = api_key.into();
        self
    }

    /// Set the size trigger.
    #[must_use]
    pub fn with_flush_size(mut self, flush_size: usize) -> Self {
        self.flush_size = flush_size;
        self
    }

    /// Set the time trigger.
    #[must_use]
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the attempt ceiling and backoff bounds.
    #[must_use]
    pub fn with_retry(mut self, max_attempts: u32, base: Duration, cap: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    /// Set the pricing miss policy.
    #[must_use]
    pub fn with_miss_policy(mut self, policy: MissPolicy) -> Self {
        self.miss_policy = policy;
        self
    }

    /// Enable local persistence into `dir`.
    #[must_use]
    pub fn with_spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.local_persistence = true;
        self.spill_dir = dir.into();
        self
    }

    /// Set the shutdown drain timeout.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the cap on batches waiting for delivery.
    #[must_use]
    pub fn with_max_pending_batches(mut self, max: usize) -> Self {
        self.max_pending_batches = max;
        self
    }
}

/// Configuration for the resend process.
#[derive(Debug, Clone)]
pub struct ResendConfig {
    /// Collector base URL.
    pub collector_url: String,
    /// API key sent as `x-api-key`.
    pub api_key: String,
    /// Directory holding spilled batches.
    pub spill_dir: PathBuf,
    /// Maximum batches handled in one run (default: 1000).
    pub batch_limit: usize,
    /// Retry policy applied to each batch.
    pub retry: RetryPolicy,
    /// HTTP request timeout.
    pub request_timeout: Duration,
}

impl ResendConfig {
    /// Load configuration from the same `Z_METER_*` variables as the meter,
    /// plus `Z_METER_RESEND_LIMIT`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let batch_limit = var("Z_METER_RESEND_LIMIT")
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(1000);
        let meter = MeterConfig::from_lookup(var);
        Self {
            retry: meter.retry_policy(),
            collector_url: meter.collector_url,
            api_key: meter.api_key,
            spill_dir: meter.spill_dir,
            batch_limit,
            request_timeout: meter.request_timeout,
        }
    }
}
