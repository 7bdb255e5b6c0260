//! End-to-end pipeline tests against an in-process transport.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::{test_catalog, test_config, Mode, RecordingTransport};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use z_meter_client::{scope, Meter, MeterConfig};
use z_meter_core::{CallError, CallObservation, CostConfidence, EventId, UnitSource};
use z_meter_store::{MemorySpillStore, SpillStore};

fn call() -> CallObservation {
    CallObservation::new("acme", "m1").with_reported_usage(1000, 500)
}

fn start(config: MeterConfig, transport: &Arc<RecordingTransport>) -> Meter {
    Meter::builder(config)
        .transport(transport.clone())
        .catalog(test_catalog())
        .start()
        .unwrap()
}

// ============================================================================
// Batching
// ============================================================================

#[tokio::test(start_paused = true)]
async fn every_event_delivered_once_in_order() {
    let transport = RecordingTransport::new(Mode::Accept);
    let meter = start(test_config(), &transport);

    let recorded: Vec<EventId> = (0..23).map(|_| meter.record(&call()).unwrap()).collect();
    let report = meter.shutdown().await;
    assert!(report.drained);

    let batches = transport.delivered();
    assert!(batches.len() >= 23usize.div_ceil(5));
    assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= 5));

    let delivered: Vec<EventId> = transport
        .delivered_events()
        .iter()
        .map(|e| e.event_id)
        .collect();
    assert_eq!(delivered, recorded);

    assert_eq!(report.stats.events_recorded, 23);
    assert_eq!(report.stats.events_delivered, 23);
    assert_eq!(report.stats.events_dropped, 0);
}

#[tokio::test(start_paused = true)]
async fn timer_flushes_partial_batch() {
    let transport = RecordingTransport::new(Mode::Accept);
    let config = test_config()
        .with_flush_size(100)
        .with_flush_interval(Duration::from_millis(200));
    let meter = start(config, &transport);

    meter.record(&call());
    meter.record(&call());
    tokio::time::sleep(Duration::from_secs(1)).await;

    let batches = transport.delivered();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 2);
    meter.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn empty_timer_flush_emits_nothing() {
    let transport = RecordingTransport::new(Mode::Accept);
    let config = test_config().with_flush_interval(Duration::from_millis(100));
    let meter = start(config, &transport);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(transport.attempts().is_empty());
    assert_eq!(meter.stats().batches_sealed, 0);

    let report = meter.shutdown().await;
    assert!(report.final_batch.is_none());
    assert!(transport.attempts().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_producers_lose_nothing() {
    const PRODUCERS: usize = 8;
    const PER_PRODUCER: usize = 200;

    let transport = RecordingTransport::new(Mode::Accept);
    let meter = start(test_config().with_flush_size(16), &transport);

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|_| {
            let meter = meter.clone();
            tokio::task::spawn_blocking(move || {
                for _ in 0..PER_PRODUCER {
                    meter.record(&call());
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }

    let report = meter.shutdown().await;
    assert!(report.drained);

    let ids: Vec<EventId> = transport
        .delivered_events()
        .iter()
        .map(|e| e.event_id)
        .collect();
    let unique: HashSet<EventId> = ids.iter().copied().collect();
    assert_eq!(ids.len(), PRODUCERS * PER_PRODUCER);
    assert_eq!(unique.len(), ids.len());
}

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test(start_paused = true)]
async fn fail_twice_then_succeed_keeps_batch_id() {
    let transport = RecordingTransport::new(Mode::FailFirst(2));
    let meter = start(test_config().with_flush_size(1), &transport);

    meter.record(&call());
    let report = meter.shutdown().await;
    assert!(report.drained);

    let attempts = transport.attempts();
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|id| *id == attempts[0]));
    assert_eq!(transport.delivered().len(), 1);

    assert_eq!(report.stats.batches_acked, 1);
    assert_eq!(report.stats.batches_retried, 2);
    assert_eq!(report.stats.batches_failed, 0);
}

#[tokio::test(start_paused = true)]
async fn permanent_rejection_is_not_retried() {
    let transport = RecordingTransport::new(Mode::Reject);
    let meter = Meter::builder(test_config().with_flush_size(2))
        .transport(transport.clone())
        .spill_store(Arc::new(MemorySpillStore::new()))
        .start()
        .unwrap();

    meter.record(&call());
    meter.record(&call());
    let report = meter.shutdown().await;

    assert_eq!(transport.attempts().len(), 1);
    assert_eq!(report.stats.batches_failed, 1);
    assert_eq!(report.stats.batches_spilled, 0);
    assert_eq!(report.stats.events_dropped, 2);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_spill_when_enabled() {
    let transport = RecordingTransport::new(Mode::Unavailable);
    let store = Arc::new(MemorySpillStore::new());
    let meter = Meter::builder(test_config())
        .transport(transport.clone())
        .spill_store(store.clone())
        .start()
        .unwrap();

    meter.record(&call());
    let report = meter.shutdown().await;

    assert!(report.drained);
    assert_eq!(transport.attempts().len(), 3);
    assert_eq!(report.stats.batches_spilled, 1);
    assert_eq!(store.len().unwrap(), 1);
    assert_eq!(store.pending(10).unwrap()[0].len(), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_drop_without_store() {
    let transport = RecordingTransport::new(Mode::Unavailable);
    let meter = start(test_config(), &transport);

    meter.record(&call());
    meter.record(&call());
    let report = meter.shutdown().await;

    assert_eq!(report.stats.batches_failed, 1);
    assert_eq!(report.stats.events_dropped, 2);
    assert_eq!(report.stats.events_delivered, 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_timeout_spills_in_flight_batches() {
    let transport = RecordingTransport::new(Mode::Unavailable);
    let store = Arc::new(MemorySpillStore::new());
    let config = test_config()
        .with_retry(100, Duration::from_secs(1), Duration::from_secs(1))
        .with_shutdown_timeout(Duration::from_secs(3));
    let meter = Meter::builder(config)
        .transport(transport.clone())
        .spill_store(store.clone())
        .start()
        .unwrap();

    for _ in 0..3 {
        meter.record(&call());
    }
    let report = meter.shutdown().await;

    assert!(!report.drained);
    assert!(report.final_batch.is_some());
    assert_eq!(report.abandoned_batches, 1);
    assert_eq!(report.spilled_batches, 1);
    assert_eq!(report.lost_events, 0);
    assert_eq!(store.pending(10).unwrap()[0].len(), 3);
}

#[tokio::test(start_paused = true)]
async fn shutdown_timeout_counts_lost_events_without_store() {
    let transport = RecordingTransport::new(Mode::Unavailable);
    let config = test_config()
        .with_retry(100, Duration::from_secs(1), Duration::from_secs(1))
        .with_shutdown_timeout(Duration::from_secs(3));
    let meter = start(config, &transport);

    for _ in 0..3 {
        meter.record(&call());
    }
    let report = meter.shutdown().await;

    assert!(!report.drained);
    assert_eq!(report.lost_events, 3);
    assert_eq!(report.stats.events_dropped, 3);
}

#[tokio::test(start_paused = true)]
async fn concurrent_shutdowns_share_one_report() {
    let transport = RecordingTransport::new(Mode::Unavailable);
    let config = test_config()
        .with_retry(100, Duration::from_secs(1), Duration::from_secs(1))
        .with_shutdown_timeout(Duration::from_secs(3));
    let meter = start(config, &transport);

    for _ in 0..3 {
        meter.record(&call());
    }
    let (first, second) = tokio::join!(meter.shutdown(), meter.shutdown());

    assert!(!first.drained);
    assert!(!second.drained);
    assert_eq!(first.final_batch, second.final_batch);
    assert_eq!(second.lost_events, 3);

    let later = meter.shutdown().await;
    assert!(!later.drained);
    assert_eq!(later.abandoned_batches, 1);
}

#[tokio::test(start_paused = true)]
async fn full_queue_drops_oldest_batches() {
    let transport = RecordingTransport::new(Mode::Unavailable);
    let config = test_config()
        .with_flush_size(1)
        .with_retry(100, Duration::from_secs(10), Duration::from_secs(10))
        .with_max_pending_batches(2)
        .with_shutdown_timeout(Duration::from_millis(100));
    let meter = start(config, &transport);

    for _ in 0..6 {
        meter.record(&call());
    }
    let stats = meter.stats();
    assert!(stats.batches_overflowed >= 3);
    assert!(meter.pending_batches() <= 3);

    meter.shutdown().await;
}

// ============================================================================
// Events
// ============================================================================

#[tokio::test(start_paused = true)]
async fn nested_agent_scopes_tag_events() {
    let transport = RecordingTransport::new(Mode::Accept);
    let meter = start(test_config(), &transport);

    scope::with_agent("A", async {
        meter.record(&call());
        scope::with_agent("B", async {
            meter.record(&call());
        })
        .await;
        meter.record(&call());
    })
    .await;
    meter.record(&call());
    meter.shutdown().await;

    let tags: Vec<Option<String>> = transport
        .delivered_events()
        .into_iter()
        .map(|e| e.agent_tag)
        .collect();
    assert_eq!(
        tags,
        vec![Some("A".into()), Some("B".into()), Some("A".into()), None]
    );
}

#[tokio::test(start_paused = true)]
async fn events_are_priced_from_catalog() {
    let transport = RecordingTransport::new(Mode::Accept);
    let meter = start(test_config(), &transport);

    meter.record(&call());
    meter.record(&CallObservation::new("acme", "unknown").with_reported_usage(1000, 500));
    let report = meter.shutdown().await;

    let events = transport.delivered_events();
    assert_eq!(events[0].computed_cost, dec!(20));
    assert_eq!(events[0].cost_confidence, CostConfidence::Exact);
    assert_eq!(events[0].unit_source, UnitSource::Reported);
    assert_eq!(events[1].computed_cost, Decimal::ZERO);
    assert_eq!(events[1].cost_confidence, CostConfidence::Unknown);

    assert!((report.stats.fallback_priced_ratio() - 0.5).abs() < f64::EPSILON);
}

#[tokio::test(start_paused = true)]
async fn failed_calls_are_still_recorded() {
    let transport = RecordingTransport::new(Mode::Accept);
    let meter = start(test_config(), &transport);

    let failed = CallObservation::new("acme", "m1")
        .with_io("prompt", "")
        .with_error(CallError::new("timeout", "upstream timed out"));
    meter.record(&failed);
    meter.shutdown().await;

    let events = transport.delivered_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].input_units, 0);
    assert_eq!(events[0].output_units, 0);
    assert_eq!(events[0].computed_cost, Decimal::ZERO);
    assert_eq!(events[0].error.as_ref().unwrap().kind, "timeout");
}

#[tokio::test(start_paused = true)]
async fn catalog_reload_applies_to_new_events() {
    let transport = RecordingTransport::new(Mode::Accept);
    let meter = start(test_config(), &transport);

    meter.record(&call());
    meter
        .catalog()
        .reload(vec![z_meter_core::PriceRecord::new(
            "acme",
            "m1",
            dec!(1),
            dec!(2),
        )])
        .unwrap();
    meter.record(&call());
    meter.shutdown().await;

    let costs: Vec<Decimal> = transport
        .delivered_events()
        .iter()
        .map(|e| e.computed_cost)
        .collect();
    assert_eq!(costs, vec![dec!(20), dec!(2)]);
}

#[tokio::test(start_paused = true)]
async fn records_after_shutdown_are_dropped() {
    let transport = RecordingTransport::new(Mode::Accept);
    let meter = start(test_config(), &transport);

    meter.shutdown().await;
    assert!(meter.record(&call()).is_none());
    assert_eq!(meter.stats().events_dropped, 1);
    assert_eq!(meter.stats().events_recorded, 0);
}
