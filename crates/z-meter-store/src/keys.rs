//! Key and file-name encoding for spilled batches.
//!
//! Both encodings preserve ULID order, so iterating keys (or sorted file
//! names) yields batches oldest-first.

use z_meter_core::BatchId;

/// Extension of spilled batch files.
pub const BATCH_FILE_EXT: &str = "cbor";

/// Create a database key from a batch ID (16 bytes, time first).
#[must_use]
pub fn batch_key(batch_id: &BatchId) -> Vec<u8> {
    batch_id.to_bytes().to_vec()
}

/// Decode a database key back into a batch ID.
///
/// Returns `None` if the key is not exactly 16 bytes.
#[must_use]
pub fn batch_id_from_key(key: &[u8]) -> Option<BatchId> {
    let bytes: [u8; 16] = key.try_into().ok()?;
    Some(BatchId::from_bytes(bytes))
}

/// File name of a spilled batch.
#[must_use]
pub fn batch_file_name(batch_id: &BatchId) -> String {
    format!("{batch_id}.{BATCH_FILE_EXT}")
}

/// Parse a batch ID out of a spill file name.
///
/// Returns `None` for temp files and anything else that is not a batch file.
#[must_use]
pub fn batch_id_from_file_name(name: &str) -> Option<BatchId> {
    name.strip_suffix(BATCH_FILE_EXT)?
        .strip_suffix('.')?
        .parse()
        .ok()
}
