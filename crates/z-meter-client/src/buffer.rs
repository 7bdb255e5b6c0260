//! Batch buffer with size and time flush triggers.

use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use z_meter_core::{Batch, BatchId, FlushTrigger, UsageEvent};

use crate::queue::DeliveryQueue;
use crate::stats::Counters;

#[derive(Debug)]
struct BufferState {
    events: Vec<UsageEvent>,
    last_flush: Instant,
    closed: bool,
}

/// Append-only event collector.
///
/// Sealing and enqueueing happen under the buffer lock, so an append lands
/// either in the batch being sealed or in the next one, and batches reach the
/// delivery queue in seal order.
#[derive(Debug)]
pub(crate) struct BatchBuffer {
    project_id: String,
    flush_size: usize,
    state: Mutex<BufferState>,
    queue: Arc<DeliveryQueue>,
    counters: Arc<Counters>,
}

impl BatchBuffer {
    pub fn new(
        project_id: impl Into<String>,
        flush_size: usize,
        queue: Arc<DeliveryQueue>,
        counters: Arc<Counters>,
    ) -> Self {
        let flush_size = flush_size.max(1);
        Self {
            project_id: project_id.into(),
            flush_size,
            state: Mutex::new(BufferState {
                events: Vec::new(),
                last_flush: Instant::now(),
                closed: false,
            }),
            queue,
            counters,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an event, sealing a batch if the size trigger is reached.
    ///
    /// Returns `false` if the buffer is closed; the event is counted as dropped.
    pub fn append(&self, event: UsageEvent) -> bool {
        let mut state = self.lock();
        if state.closed {
            Counters::incr(&self.counters.events_dropped);
            tracing::debug!(event_id = %event.event_id, "Buffer closed, event dropped");
            return false;
        }

        state.events.push(event);
        Counters::incr(&self.counters.events_recorded);
        if state.events.len() >= self.flush_size {
            self.seal(&mut state, FlushTrigger::Size);
        }
        true
    }

    /// Seal whatever is buffered. An empty flush only resets the timer.
    pub fn flush(&self, trigger: FlushTrigger) -> Option<BatchId> {
        let mut state = self.lock();
        self.seal(&mut state, trigger)
    }

    /// Timer flush: seal only if no other flush happened within `interval`.
    pub fn flush_if_due(&self, interval: Duration, now: Instant) -> Option<BatchId> {
        let mut state = self.lock();
        if now < state.last_flush + interval {
            return None;
        }
        self.seal(&mut state, FlushTrigger::Timer)
    }

    /// Reject further appends and seal what is left.
    pub fn close(&self) -> Option<BatchId> {
        let mut state = self.lock();
        state.closed = true;
        self.seal(&mut state, FlushTrigger::Shutdown)
    }

    pub fn last_flush(&self) -> Instant {
        self.lock().last_flush
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    fn seal(&self, state: &mut BufferState, trigger: FlushTrigger) -> Option<BatchId> {
        state.last_flush = Instant::now();
        if state.events.is_empty() {
            return None;
        }

        let events = mem::take(&mut state.events);
        let batch = Batch::seal(self.project_id.clone(), trigger, events);
        let batch_id = batch.batch_id;
        tracing::debug!(
            batch_id = %batch_id,
            events = batch.len(),
            trigger = ?trigger,
            "Sealed batch"
        );
        Counters::incr(&self.counters.batches_sealed);
        self.queue.push(batch);
        Some(batch_id)
    }
}

/// Run the time trigger until `stop` is cancelled.
///
/// The deadline is always `last_flush + interval`, so size and manual flushes
/// push the next timer flush back.
pub(crate) async fn run_timer(
    buffer: Arc<BatchBuffer>,
    interval: Duration,
    stop: CancellationToken,
) {
    loop {
        let deadline = buffer.last_flush() + interval;
        tokio::select! {
            () = stop.cancelled() => break,
            () = tokio::time::sleep_until(deadline) => {
                buffer.flush_if_due(interval, Instant::now());
            }
        }
    }
    tracing::debug!("Flush timer stopped");
}
