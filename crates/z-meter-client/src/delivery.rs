//! Delivery of sealed batches.
//!
//! Each batch moves through
//! `Pending -> Sending -> {Acked, RetryScheduled -> Sending, FinalFailure}`.
//! The worker owns all network I/O and backoff waiting so producers never
//! block on the collector.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use z_meter_core::{Batch, MeterError};
use z_meter_store::SpillStore;

use crate::error::TransportError;
use crate::queue::{DeliveryQueue, Next};
use crate::stats::Counters;
use crate::transport::Transport;
use crate::types::Ack;

/// Attempt ceiling and exponential backoff bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base: Duration,
    cap: Duration,
}

impl RetryPolicy {
    /// Create a policy. An attempt ceiling of zero is treated as one.
    #[must_use]
    pub fn new(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
            cap,
        }
    }

    /// Total attempts per batch, first attempt included.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the `retry`-th retry: `min(base * 2^(retry-1), cap)`.
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    /// Whether a batch that has made `attempts_made` attempts and just failed
    /// with `error` gets another attempt.
    #[must_use]
    pub fn should_retry(&self, attempts_made: u32, error: &TransportError) -> bool {
        error.is_transient() && attempts_made < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(500), Duration::from_secs(30))
    }
}

/// Delivery state of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Sealed, not yet attempted.
    Pending,
    /// An attempt is in progress.
    Sending,
    /// Last attempt failed transiently; waiting for the backoff to pass.
    RetryScheduled,
    /// Collector acknowledged the batch.
    Acked,
    /// Permanently rejected or out of attempts.
    FinalFailure,
}

impl DeliveryState {
    /// Whether no further transitions are possible.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Acked | Self::FinalFailure)
    }
}

/// A batch together with its delivery progress.
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    batch: Arc<Batch>,
    attempts: u32,
    state: DeliveryState,
    next_retry_at: Option<Instant>,
    last_error: Option<String>,
}

impl DeliveryAttempt {
    /// Start tracking a freshly sealed batch.
    #[must_use]
    pub fn new(batch: Arc<Batch>) -> Self {
        Self {
            batch,
            attempts: 0,
            state: DeliveryState::Pending,
            next_retry_at: None,
            last_error: None,
        }
    }

    /// The batch being delivered.
    #[must_use]
    pub fn batch(&self) -> &Arc<Batch> {
        &self.batch
    }

    /// Attempts started so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> DeliveryState {
        self.state
    }

    /// When the next attempt may start, while a retry is scheduled.
    #[must_use]
    pub fn next_retry_at(&self) -> Option<Instant> {
        self.next_retry_at
    }

    /// Error from the most recent failed attempt.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// `Pending | RetryScheduled -> Sending`.
    pub fn begin_send(&mut self) {
        debug_assert!(matches!(
            self.state,
            DeliveryState::Pending | DeliveryState::RetryScheduled
        ));
        self.state = DeliveryState::Sending;
        self.attempts += 1;
        self.next_retry_at = None;
    }

    /// `Sending -> RetryScheduled`.
    pub fn schedule_retry(&mut self, error: impl Into<String>, at: Instant) {
        debug_assert_eq!(self.state, DeliveryState::Sending);
        self.state = DeliveryState::RetryScheduled;
        self.next_retry_at = Some(at);
        self.last_error = Some(error.into());
    }

    /// `Sending -> Acked`.
    pub fn acked(&mut self) {
        debug_assert_eq!(self.state, DeliveryState::Sending);
        self.state = DeliveryState::Acked;
    }

    /// `Sending -> FinalFailure`.
    pub fn failed(&mut self, error: impl Into<String>) {
        self.state = DeliveryState::FinalFailure;
        self.next_retry_at = None;
        self.last_error = Some(error.into());
    }
}

/// What happened to a batch that could not be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    Spilled,
    Dropped,
}

/// Spill an undeliverable batch if a store is configured, otherwise count it
/// as lost. A failing store also counts as lost.
pub(crate) fn dispose_undelivered(
    batch: &Batch,
    spill: Option<&dyn SpillStore>,
    counters: &Counters,
) -> Disposition {
    if let Some(store) = spill {
        match store.append(batch) {
            Ok(()) => {
                Counters::incr(&counters.batches_spilled);
                tracing::info!(
                    batch_id = %batch.batch_id,
                    events = batch.len(),
                    "Spilled undelivered batch"
                );
                return Disposition::Spilled;
            }
            Err(e) => {
                tracing::error!(batch_id = %batch.batch_id, error = %e, "Failed to spill batch");
            }
        }
    }

    Counters::incr(&counters.batches_failed);
    Counters::add(&counters.events_dropped, batch.len());
    tracing::warn!(
        batch_id = %batch.batch_id,
        events = batch.len(),
        "Dropped undelivered batch"
    );
    Disposition::Dropped
}

/// Send one batch, retrying transient failures with backoff.
///
/// Used where a batch is handled on its own (resend); the live pipeline
/// schedules retries through the delivery queue instead.
///
/// # Errors
///
/// Returns the last error once the batch is permanently rejected or the
/// attempt ceiling is reached.
pub async fn send_with_retry(
    transport: &dyn Transport,
    batch: &Batch,
    policy: &RetryPolicy,
) -> Result<Ack, TransportError> {
    let mut attempts = 1;
    loop {
        match transport.send(batch).await {
            Ok(ack) => return Ok(ack),
            Err(e) if policy.should_retry(attempts, &e) => {
                let delay = policy.delay(attempts);
                tracing::debug!(
                    batch_id = %batch.batch_id,
                    attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Retrying batch"
                );
                tokio::time::sleep(delay).await;
                attempts += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Background task draining the delivery queue.
pub(crate) struct DeliveryWorker {
    pub transport: Arc<dyn Transport>,
    pub queue: Arc<DeliveryQueue>,
    pub policy: RetryPolicy,
    pub spill: Option<Arc<dyn SpillStore>>,
    pub counters: Arc<Counters>,
}

impl DeliveryWorker {
    /// Deliver batches until `stop` is cancelled and the queue is empty.
    pub async fn run(self, stop: CancellationToken) {
        tracing::debug!("Delivery worker started");
        loop {
            match self.queue.next_ready(Instant::now()) {
                Next::Ready(attempt) => self.deliver(attempt).await,
                Next::WaitUntil(at) => {
                    tokio::select! {
                        () = tokio::time::sleep_until(at) => {}
                        () = self.queue.notified() => {}
                    }
                }
                Next::Idle => {
                    if stop.is_cancelled() {
                        break;
                    }
                    tokio::select! {
                        () = self.queue.notified() => {}
                        () = stop.cancelled() => {}
                    }
                }
            }
        }
        tracing::debug!("Delivery worker stopped");
    }

    async fn deliver(&self, mut attempt: DeliveryAttempt) {
        attempt.begin_send();
        let batch = Arc::clone(attempt.batch());

        match self.transport.send(&batch).await {
            Ok(ack) => {
                attempt.acked();
                Counters::incr(&self.counters.batches_acked);
                Counters::add(&self.counters.events_delivered, batch.len());
                tracing::debug!(
                    batch_id = %batch.batch_id,
                    attempts = attempt.attempts(),
                    accepted = ack.accepted,
                    duplicate = ack.duplicate,
                    "Batch delivered"
                );
                self.queue.complete();
            }
            Err(e) if self.policy.should_retry(attempt.attempts(), &e) => {
                let delay = self.policy.delay(attempt.attempts());
                let error = MeterError::from(e);
                tracing::warn!(
                    batch_id = %batch.batch_id,
                    attempts = attempt.attempts(),
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "Batch delivery failed, retry scheduled"
                );
                attempt.schedule_retry(error.to_string(), Instant::now() + delay);
                Counters::incr(&self.counters.batches_retried);
                self.queue.retry_later(attempt);
            }
            Err(e) => {
                let error = MeterError::from(e);
                attempt.failed(error.to_string());
                if error.is_retryable() {
                    tracing::warn!(
                        batch_id = %batch.batch_id,
                        attempts = attempt.attempts(),
                        error = %error,
                        "Batch delivery attempts exhausted"
                    );
                    dispose_undelivered(&batch, self.spill.as_deref(), &self.counters);
                } else {
                    tracing::error!(
                        batch_id = %batch.batch_id,
                        events = batch.len(),
                        error = %error,
                        "Batch rejected by collector"
                    );
                    Counters::incr(&self.counters.batches_failed);
                    Counters::add(&self.counters.events_dropped, batch.len());
                }
                self.queue.complete();
            }
        }
    }
}
