//! Pipeline counters.
//!
//! Delivery problems never reach the instrumented call path; they show up
//! here and in logs.

use std::sync::atomic::{AtomicU64, Ordering};

use z_meter_core::CostConfidence;

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub events_recorded: AtomicU64,
    pub events_dropped: AtomicU64,
    pub events_delivered: AtomicU64,
    pub batches_sealed: AtomicU64,
    pub batches_acked: AtomicU64,
    pub batches_retried: AtomicU64,
    pub batches_failed: AtomicU64,
    pub batches_spilled: AtomicU64,
    pub batches_overflowed: AtomicU64,
    pub counting_warnings: AtomicU64,
    pub cost_exact: AtomicU64,
    pub cost_estimated: AtomicU64,
    pub cost_unknown: AtomicU64,
}

impl Counters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_confidence(&self, confidence: CostConfidence) {
        Self::incr(match confidence {
            CostConfidence::Exact => &self.cost_exact,
            CostConfidence::Estimated => &self.cost_estimated,
            CostConfidence::Unknown => &self.cost_unknown,
        });
    }

    pub fn snapshot(&self) -> MeterStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MeterStats {
            events_recorded: load(&self.events_recorded),
            events_dropped: load(&self.events_dropped),
            events_delivered: load(&self.events_delivered),
            batches_sealed: load(&self.batches_sealed),
            batches_acked: load(&self.batches_acked),
            batches_retried: load(&self.batches_retried),
            batches_failed: load(&self.batches_failed),
            batches_spilled: load(&self.batches_spilled),
            batches_overflowed: load(&self.batches_overflowed),
            counting_warnings: load(&self.counting_warnings),
            cost_exact: load(&self.cost_exact),
            cost_estimated: load(&self.cost_estimated),
            cost_unknown: load(&self.cost_unknown),
        }
    }
}

/// Point-in-time copy of the pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeterStats {
    /// Events accepted into the buffer.
    pub events_recorded: u64,
    /// Events lost: rejected after shutdown, overflowed, failed or unspillable.
    pub events_dropped: u64,
    /// Events in acknowledged batches.
    pub events_delivered: u64,
    /// Batches sealed by any trigger.
    pub batches_sealed: u64,
    /// Batches acknowledged by the collector.
    pub batches_acked: u64,
    /// Retry attempts scheduled.
    pub batches_retried: u64,
    /// Batches dropped after a permanent failure or exhausted retries.
    pub batches_failed: u64,
    /// Batches written to the local fallback store.
    pub batches_spilled: u64,
    /// Batches dropped because the delivery queue was full.
    pub batches_overflowed: u64,
    /// Events built with a counting warning.
    pub counting_warnings: u64,
    /// Events priced from the catalog.
    pub cost_exact: u64,
    /// Events priced by the fallback policy.
    pub cost_estimated: u64,
    /// Events with unknown cost.
    pub cost_unknown: u64,
}

impl MeterStats {
    /// Share of recorded events not priced from the catalog
    /// (estimated or unknown). Zero when nothing was recorded.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fallback_priced_ratio(&self) -> f64 {
        let total = self.cost_exact + self.cost_estimated + self.cost_unknown;
        if total == 0 {
            return 0.0;
        }
        (self.cost_estimated + self.cost_unknown) as f64 / total as f64
    }
}
