//! Replay of spilled batches.

use z_meter_store::{SpillStore, StoreError};

use crate::delivery::{send_with_retry, RetryPolicy};
use crate::error::ClientError;
use crate::transport::Transport;

/// Outcome of a resend pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResendReport {
    /// Batches read from the store.
    pub attempted: usize,
    /// Batches acknowledged and removed.
    pub delivered: usize,
    /// Batches permanently rejected and removed.
    pub rejected: usize,
    /// Batches left in the store after transient failures.
    pub remaining: usize,
}

/// Send up to `limit` spilled batches, oldest first.
///
/// Acknowledged and permanently rejected batches are removed from the store;
/// batches that keep failing transiently stay for the next pass. Batch IDs are
/// unchanged, so the collector can drop anything it already stored.
///
/// # Errors
///
/// Returns an error if the store cannot be read or updated.
pub async fn resend_spilled(
    store: &dyn SpillStore,
    transport: &dyn Transport,
    policy: &RetryPolicy,
    limit: usize,
) -> Result<ResendReport, ClientError> {
    let batches = store.pending(limit)?;
    let mut report = ResendReport {
        attempted: batches.len(),
        ..ResendReport::default()
    };

    for batch in batches {
        match send_with_retry(transport, &batch, policy).await {
            Ok(ack) => {
                tracing::info!(
                    batch_id = %batch.batch_id,
                    accepted = ack.accepted,
                    duplicate = ack.duplicate,
                    "Resent spilled batch"
                );
                remove(store, &batch.batch_id)?;
                report.delivered += 1;
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    batch_id = %batch.batch_id,
                    error = %e,
                    "Resend failed, keeping batch"
                );
                report.remaining += 1;
            }
            Err(e) => {
                tracing::error!(
                    batch_id = %batch.batch_id,
                    events = batch.len(),
                    error = %e,
                    "Spilled batch rejected, discarding"
                );
                remove(store, &batch.batch_id)?;
                report.rejected += 1;
            }
        }
    }

    Ok(report)
}

fn remove(store: &dyn SpillStore, batch_id: &z_meter_core::BatchId) -> Result<(), ClientError> {
    match store.remove(batch_id) {
        // Another pass got there first.
        Ok(()) | Err(StoreError::NotFound) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
