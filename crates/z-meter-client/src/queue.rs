//! Shared queue between the batch buffer and the delivery worker.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::time::Instant;
use z_meter_core::{Batch, MeterError};

use crate::delivery::DeliveryAttempt;
use crate::stats::Counters;

/// What the worker should do next.
#[derive(Debug)]
pub(crate) enum Next {
    /// Send this attempt now.
    Ready(DeliveryAttempt),
    /// Nothing is ready before this instant.
    WaitUntil(Instant),
    /// Queue is empty.
    Idle,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Arc<Batch>>,
    retrying: Vec<DeliveryAttempt>,
    in_flight: Option<DeliveryAttempt>,
}

impl QueueState {
    fn waiting(&self) -> usize {
        self.pending.len() + self.retrying.len()
    }

    /// Remove the oldest waiting batch, whether fresh or retrying.
    fn pop_oldest(&mut self) -> Option<Arc<Batch>> {
        let oldest_retry = self
            .retrying
            .iter()
            .enumerate()
            .min_by_key(|(_, a)| a.batch().batch_id)
            .map(|(idx, a)| (idx, a.batch().batch_id));

        match (self.pending.front(), oldest_retry) {
            (Some(front), Some((idx, retry_id))) if retry_id < front.batch_id => {
                Some(Arc::clone(self.retrying.swap_remove(idx).batch()))
            }
            (Some(_), _) => self.pending.pop_front(),
            (None, Some((idx, _))) => Some(Arc::clone(self.retrying.swap_remove(idx).batch())),
            (None, None) => None,
        }
    }
}

/// Bounded hand-off of sealed batches to the delivery worker.
///
/// Fresh batches are delivered in seal order; a retry whose backoff has
/// passed goes first.
#[derive(Debug)]
pub(crate) struct DeliveryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    max_waiting: usize,
    counters: Arc<Counters>,
}

impl DeliveryQueue {
    pub fn new(max_waiting: usize, counters: Arc<Counters>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            max_waiting: max_waiting.max(1),
            counters,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a sealed batch, dropping the oldest waiting batch when full.
    pub fn push(&self, batch: Batch) {
        {
            let mut state = self.lock();
            while state.waiting() >= self.max_waiting {
                let Some(dropped) = state.pop_oldest() else {
                    break;
                };
                Counters::incr(&self.counters.batches_overflowed);
                Counters::add(&self.counters.events_dropped, dropped.len());
                let overflow = MeterError::BufferOverflow {
                    dropped_events: dropped.len(),
                };
                tracing::warn!(
                    batch_id = %dropped.batch_id,
                    error = %overflow,
                    "Delivery queue full, dropped oldest batch"
                );
            }
            state.pending.push_back(Arc::new(batch));
        }
        self.notify.notify_one();
    }

    /// Hand out the next attempt to send, marking it in flight.
    pub fn next_ready(&self, now: Instant) -> Next {
        let mut state = self.lock();

        let due = state
            .retrying
            .iter()
            .enumerate()
            .filter_map(|(idx, a)| a.next_retry_at().map(|at| (idx, at)))
            .min_by_key(|(_, at)| *at);

        if let Some((idx, at)) = due {
            if at <= now {
                let attempt = state.retrying.swap_remove(idx);
                state.in_flight = Some(attempt.clone());
                return Next::Ready(attempt);
            }
        }

        if let Some(batch) = state.pending.pop_front() {
            let attempt = DeliveryAttempt::new(batch);
            state.in_flight = Some(attempt.clone());
            return Next::Ready(attempt);
        }

        match due {
            Some((_, at)) => Next::WaitUntil(at),
            None => Next::Idle,
        }
    }

    /// The in-flight attempt reached a terminal state.
    pub fn complete(&self) {
        self.lock().in_flight = None;
    }

    /// The in-flight attempt failed transiently and waits for its backoff.
    pub fn retry_later(&self, attempt: DeliveryAttempt) {
        {
            let mut state = self.lock();
            state.in_flight = None;
            state.retrying.push(attempt);
        }
        self.notify.notify_one();
    }

    /// Take every undelivered batch back: waiting, then retrying, then in flight.
    pub fn take_all(&self) -> Vec<Arc<Batch>> {
        let mut state = self.lock();
        let mut batches: Vec<Arc<Batch>> = state.pending.drain(..).collect();
        batches.extend(state.retrying.drain(..).map(|a| Arc::clone(a.batch())));
        if let Some(attempt) = state.in_flight.take() {
            batches.push(Arc::clone(attempt.batch()));
        }
        batches
    }

    /// Batches waiting, retrying or in flight.
    pub fn len(&self) -> usize {
        let state = self.lock();
        state.waiting() + usize::from(state.in_flight.is_some())
    }

    /// Wait until something is pushed or rescheduled.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use z_meter_core::{
        CallObservation, CostEngine, CounterRegistry, EventBuilder, FlushTrigger, PricingCatalog,
        TagContext,
    };

    fn batch(events: usize) -> Batch {
        let builder = EventBuilder::new(
            "proj",
            CounterRegistry::default(),
            CostEngine::new(Arc::new(PricingCatalog::empty())),
        );
        let events = (0..events)
            .map(|_| {
                builder.build(
                    &CallObservation::new("p", "m").with_reported_usage(1, 1),
                    &TagContext::new(),
                )
            })
            .collect();
        Batch::seal("proj", FlushTrigger::Manual, events)
    }

    #[test]
    fn fifo_order() {
        let queue = DeliveryQueue::new(10, Arc::new(Counters::default()));
        let first = batch(1);
        let second = batch(1);
        let ids = [first.batch_id, second.batch_id];
        queue.push(first);
        queue.push(second);

        for expected in ids {
            let Next::Ready(attempt) = queue.next_ready(Instant::now()) else {
                panic!("expected a ready batch");
            };
            assert_eq!(attempt.batch().batch_id, expected);
            queue.complete();
        }
        assert!(matches!(queue.next_ready(Instant::now()), Next::Idle));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn overflow_drops_oldest() {
        let counters = Arc::new(Counters::default());
        let queue = DeliveryQueue::new(2, Arc::clone(&counters));
        let batches: Vec<Batch> = (0..3).map(|_| batch(2)).collect();
        let kept: Vec<_> = batches[1..].iter().map(|b| b.batch_id).collect();
        for b in batches {
            queue.push(b);
        }

        let remaining: Vec<_> = queue.take_all().iter().map(|b| b.batch_id).collect();
        assert_eq!(remaining, kept);

        let stats = counters.snapshot();
        assert_eq!(stats.batches_overflowed, 1);
        assert_eq!(stats.events_dropped, 2);
    }

    #[test]
    fn retry_waits_for_backoff() {
        let queue = DeliveryQueue::new(10, Arc::new(Counters::default()));
        queue.push(batch(1));

        let Next::Ready(mut attempt) = queue.next_ready(Instant::now()) else {
            panic!("expected a ready batch");
        };
        attempt.begin_send();
        let retry_at = Instant::now() + Duration::from_secs(5);
        attempt.schedule_retry("timeout", retry_at);
        queue.retry_later(attempt);

        assert!(matches!(queue.next_ready(Instant::now()), Next::WaitUntil(at) if at == retry_at));
        let Next::Ready(again) = queue.next_ready(retry_at) else {
            panic!("retry should be due");
        };
        assert_eq!(again.attempts(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn take_all_includes_in_flight() {
        let queue = DeliveryQueue::new(10, Arc::new(Counters::default()));
        queue.push(batch(1));
        queue.push(batch(1));

        let Next::Ready(_) = queue.next_ready(Instant::now()) else {
            panic!("expected a ready batch");
        };
        assert_eq!(queue.take_all().len(), 2);
        assert_eq!(queue.len(), 0);
    }
}
