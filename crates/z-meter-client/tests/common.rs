//! Common test utilities for z-meter-client integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use z_meter_client::{Ack, MeterConfig, Transport, TransportError};
use z_meter_core::{Batch, BatchId, PriceRecord, PricingCatalog, UsageEvent};

/// How the recording transport answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Acknowledge everything.
    Accept,
    /// Fail the first `n` calls transiently, then acknowledge.
    FailFirst(usize),
    /// Always fail transiently.
    Unavailable,
    /// Always reject permanently.
    Reject,
}

/// A transport that records every call.
pub struct RecordingTransport {
    mode: Mode,
    calls: AtomicUsize,
    attempts: Mutex<Vec<BatchId>>,
    delivered: Mutex<Vec<Batch>>,
}

impl RecordingTransport {
    pub fn new(mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            calls: AtomicUsize::new(0),
            attempts: Mutex::new(Vec::new()),
            delivered: Mutex::new(Vec::new()),
        })
    }

    /// Batch IDs of every attempt, in call order.
    pub fn attempts(&self) -> Vec<BatchId> {
        self.attempts.lock().unwrap().clone()
    }

    /// Acknowledged batches, in delivery order.
    pub fn delivered(&self) -> Vec<Batch> {
        self.delivered.lock().unwrap().clone()
    }

    /// Events of all acknowledged batches, in delivery order.
    pub fn delivered_events(&self) -> Vec<UsageEvent> {
        self.delivered()
            .into_iter()
            .flat_map(|b| b.events)
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, batch: &Batch) -> Result<Ack, TransportError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.attempts.lock().unwrap().push(batch.batch_id);

        let fail = match self.mode {
            Mode::Accept => None,
            Mode::FailFirst(n) if call < n => Some(TransportError::Unavailable("flaky".into())),
            Mode::FailFirst(_) => None,
            Mode::Unavailable => Some(TransportError::Unavailable("down".into())),
            Mode::Reject => Some(TransportError::Rejected("invalid batch".into())),
        };
        if let Some(err) = fail {
            return Err(err);
        }

        self.delivered.lock().unwrap().push(batch.clone());
        Ok(Ack {
            accepted: batch.len(),
            duplicate: false,
        })
    }
}

/// Config with short timings for tests.
pub fn test_config() -> MeterConfig {
    MeterConfig::new("proj-test")
        .with_flush_size(5)
        .with_flush_interval(Duration::from_secs(60))
        .with_retry(3, Duration::from_millis(10), Duration::from_millis(100))
        .with_shutdown_timeout(Duration::from_secs(5))
}

/// Catalog with a single priced model: `acme/m1` at 10 input, 20 output per 1k.
pub fn test_catalog() -> Arc<PricingCatalog> {
    Arc::new(
        PricingCatalog::new(vec![PriceRecord::new(
            "acme",
            "m1",
            rust_decimal::Decimal::from(10),
            rust_decimal::Decimal::from(20),
        )])
        .unwrap(),
    )
}
