//! In-memory spill store.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use z_meter_core::{Batch, BatchId};

use crate::error::{Result, StoreError};
use crate::SpillStore;

/// Spill store that keeps batches in process memory.
///
/// Nothing survives a restart; useful for tests and for hosts that only want
/// spilled batches to outlive a collector outage, not the process.
#[derive(Debug, Default)]
pub struct MemorySpillStore {
    batches: Mutex<BTreeMap<BatchId, Batch>>,
}

impl MemorySpillStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SpillStore for MemorySpillStore {
    fn append(&self, batch: &Batch) -> Result<()> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(batch.batch_id, batch.clone());
        Ok(())
    }

    fn pending(&self, limit: usize) -> Result<Vec<Batch>> {
        Ok(self
            .batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .take(limit)
            .cloned()
            .collect())
    }

    fn remove(&self, batch_id: &BatchId) -> Result<()> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(batch_id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    fn len(&self) -> Result<usize> {
        Ok(self.batches.lock().unwrap_or_else(PoisonError::into_inner).len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::batch;

    #[test]
    fn keeps_batches_ordered_by_id() {
        let store = MemorySpillStore::new();
        let first = batch(1);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = batch(1);

        store.append(&second).unwrap();
        store.append(&first).unwrap();

        let ids: Vec<_> = store.pending(10).unwrap().iter().map(|b| b.batch_id).collect();
        assert_eq!(ids, vec![first.batch_id, second.batch_id]);
    }

    #[test]
    fn remove_missing_is_not_found() {
        let store = MemorySpillStore::new();
        assert!(matches!(
            store.remove(&BatchId::generate()),
            Err(StoreError::NotFound)
        ));
        assert!(store.is_empty().unwrap());
    }
}
