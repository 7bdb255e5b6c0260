//! `RocksDB` spill store.
//!
//! This module provides the `RocksSpillStore` implementation of the
//! `SpillStore` trait.

use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded,
    Options,
};

use z_meter_core::{Batch, BatchId};

use crate::error::{Result, StoreError};
use crate::schema::{all_column_families, cf};
use crate::{decode, encode, keys, SpillStore};

/// RocksDB-backed spill store.
pub struct RocksSpillStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl RocksSpillStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }
}

impl SpillStore for RocksSpillStore {
    fn append(&self, batch: &Batch) -> Result<()> {
        let cf = self.cf(cf::SPILLED_BATCHES)?;
        let key = keys::batch_key(&batch.batch_id);
        let value = encode(batch)?;

        self.db
            .put_cf(&cf, key, value)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        tracing::debug!(batch_id = %batch.batch_id, "Spilled batch to RocksDB");
        Ok(())
    }

    fn pending(&self, limit: usize) -> Result<Vec<Batch>> {
        let cf = self.cf(cf::SPILLED_BATCHES)?;
        let mut batches = Vec::new();

        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            if batches.len() >= limit {
                break;
            }
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            match decode::<Batch>(&value) {
                Ok(batch) => batches.push(batch),
                Err(e) => {
                    let batch_id = keys::batch_id_from_key(&key);
                    tracing::warn!(?batch_id, error = %e, "Skipping unreadable spilled batch");
                }
            }
        }

        Ok(batches)
    }

    fn remove(&self, batch_id: &BatchId) -> Result<()> {
        let cf = self.cf(cf::SPILLED_BATCHES)?;
        let key = keys::batch_key(batch_id);

        let exists = self
            .db
            .get_cf(&cf, &key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .is_some();
        if !exists {
            return Err(StoreError::NotFound);
        }

        self.db
            .delete_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn len(&self) -> Result<usize> {
        let cf = self.cf(cf::SPILLED_BATCHES)?;
        let mut count = 0;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            item.map_err(|e| StoreError::Database(e.to_string()))?;
            count += 1;
        }
        Ok(count)
    }
}
