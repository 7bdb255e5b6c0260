//! Column families used by the `RocksDB` backend.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Undelivered batches, keyed by `batch_id` (ULID bytes). Value is CBOR.
    pub const SPILLED_BATCHES: &str = "spilled_batches";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![cf::SPILLED_BATCHES]
}
