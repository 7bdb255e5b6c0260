//! Local fallback store for z-meter.
//!
//! When a batch cannot be delivered after all retries, the delivery worker
//! spills it here instead of dropping it. A resend pass on the next start reads
//! the spilled batches back oldest-first and tries again.
//!
//! # Backends
//!
//! - [`FileSpillStore`]: one CBOR file per batch in a directory
//! - [`MemorySpillStore`]: in-process, for tests and short-lived hosts
//! - `RocksSpillStore`: `RocksDB` column family (feature `rocksdb-backend`)
//!
//! # Example
//!
//! ```no_run
//! use z_meter_store::{FileSpillStore, SpillStore};
//!
//! let store = FileSpillStore::open("/var/lib/z-meter/spill").unwrap();
//! for batch in store.pending(100).unwrap() {
//!     println!("{} events waiting in {}", batch.len(), batch.batch_id);
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod file;
pub mod keys;
pub mod memory;
#[cfg(feature = "rocksdb-backend")]
pub mod rocks;
#[cfg(feature = "rocksdb-backend")]
pub mod schema;

pub use error::{Result, StoreError};
pub use file::FileSpillStore;
pub use memory::MemorySpillStore;
#[cfg(feature = "rocksdb-backend")]
pub use rocks::RocksSpillStore;

use z_meter_core::{Batch, BatchId};

/// Append-only queue of undelivered batches.
///
/// Implementations must be safe to share between the delivery worker and a
/// resend pass running in the same process.
pub trait SpillStore: Send + Sync {
    /// Persist a batch. Appending a batch whose ID is already stored replaces
    /// it, so a retried spill never duplicates.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch cannot be serialized or written.
    fn append(&self, batch: &Batch) -> Result<()>;

    /// Up to `limit` stored batches, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read. Unreadable individual
    /// entries are skipped and logged rather than failing the whole read.
    fn pending(&self, limit: usize) -> Result<Vec<Batch>>;

    /// Remove a batch after it has been delivered or permanently rejected.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the batch is not stored.
    fn remove(&self, batch_id: &BatchId) -> Result<()>;

    /// Number of stored batches.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn len(&self) -> Result<usize>;

    /// Whether the store holds no batches.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Serialize a value using CBOR.
pub(crate) fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(buf)
}

/// Deserialize a value from CBOR.
pub(crate) fn decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
    ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use rust_decimal::Decimal;
    use z_meter_core::{
        Batch, CostConfidence, EventId, FlushTrigger, UnitSource, UsageEvent,
    };

    pub fn batch(events: usize) -> Batch {
        let events = (0..events)
            .map(|i| UsageEvent {
                event_id: EventId::generate(),
                timestamp: Utc::now(),
                project_id: "proj".into(),
                agent_tag: Some("agent".into()),
                metadata: BTreeMap::from([("n".to_string(), i.to_string())]),
                provider: "openai".into(),
                model: "gpt-4o".into(),
                input_units: 100,
                output_units: 20,
                unit_source: UnitSource::Reported,
                counting_warning: None,
                computed_cost: Decimal::new(45, 5),
                cost_confidence: CostConfidence::Exact,
                price_version: Some("builtin".into()),
                latency_ms: 800,
                error: None,
            })
            .collect();
        Batch::seal("proj", FlushTrigger::Timer, events)
    }
}
