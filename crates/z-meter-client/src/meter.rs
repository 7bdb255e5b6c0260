//! The metering pipeline.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use z_meter_core::{
    BatchId, CallObservation, CostEngine, CounterRegistry, EventBuilder, EventId, PricingCatalog,
    TagContext,
};
use z_meter_store::{FileSpillStore, SpillStore};

use crate::buffer::{run_timer, BatchBuffer};
use crate::config::MeterConfig;
use crate::delivery::{dispose_undelivered, DeliveryWorker, Disposition};
use crate::error::ClientError;
use crate::queue::DeliveryQueue;
use crate::scope;
use crate::stats::{Counters, MeterStats};
use crate::transport::{HttpTransport, Transport};

/// Builder for [`Meter`].
#[must_use]
pub struct MeterBuilder {
    config: MeterConfig,
    transport: Option<Arc<dyn Transport>>,
    spill: Option<Arc<dyn SpillStore>>,
    catalog: Option<Arc<PricingCatalog>>,
    counters: Option<CounterRegistry>,
}

impl MeterBuilder {
    /// Deliver through `transport` instead of HTTP to `config.collector_url`.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Spill undeliverable batches into `store`. Enables local persistence.
    pub fn spill_store(mut self, store: Arc<dyn SpillStore>) -> Self {
        self.spill = Some(store);
        self
    }

    /// Price against `catalog` instead of the built-in price table.
    pub fn catalog(mut self, catalog: Arc<PricingCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Count units with `counters` instead of the default tokenizer registry.
    pub fn counters(mut self, counters: CounterRegistry) -> Self {
        self.counters = Some(counters);
        self
    }

    /// Validate the configuration and start the background tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the HTTP client or
    /// spill directory cannot be set up, or no Tokio runtime is running.
    pub fn start(self) -> Result<Meter, ClientError> {
        let config = self.config;
        config.validate()?;

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            ClientError::Configuration("Meter must be started inside a Tokio runtime".into())
        })?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::with_timeout(
                config.collector_url.clone(),
                config.api_key.clone(),
                config.request_timeout,
            )?),
        };

        let spill: Option<Arc<dyn SpillStore>> = match self.spill {
            Some(store) => Some(store),
            None if config.local_persistence => {
                Some(Arc::new(FileSpillStore::open(&config.spill_dir)?))
            }
            None => None,
        };

        let catalog = self
            .catalog
            .unwrap_or_else(|| Arc::new(PricingCatalog::with_defaults()));
        let builder = EventBuilder::new(
            config.project_id.clone(),
            self.counters.unwrap_or_default(),
            CostEngine::with_policy(catalog, config.miss_policy.clone()),
        );

        let counters = Arc::new(Counters::default());
        let queue = Arc::new(DeliveryQueue::new(
            config.max_pending_batches,
            Arc::clone(&counters),
        ));
        let buffer = Arc::new(BatchBuffer::new(
            config.project_id.clone(),
            config.flush_size,
            Arc::clone(&queue),
            Arc::clone(&counters),
        ));

        let timer_stop = CancellationToken::new();
        let worker_stop = CancellationToken::new();

        let timer = runtime.spawn(run_timer(
            Arc::clone(&buffer),
            config.flush_interval,
            timer_stop.clone(),
        ));
        let worker = runtime.spawn(
            DeliveryWorker {
                transport,
                queue: Arc::clone(&queue),
                policy: config.retry_policy(),
                spill: spill.clone(),
                counters: Arc::clone(&counters),
            }
            .run(worker_stop.clone()),
        );

        tracing::info!(
            project_id = %config.project_id,
            flush_size = config.flush_size,
            flush_interval_ms =
                u64::try_from(config.flush_interval.as_millis()).unwrap_or(u64::MAX),
            max_attempts = config.max_attempts,
            local_persistence = spill.is_some(),
            "Meter started"
        );

        Ok(Meter {
            inner: Arc::new(Inner {
                builder,
                buffer,
                queue,
                counters,
                spill,
                shutdown_timeout: config.shutdown_timeout,
                timer_stop,
                worker_stop,
                tasks: Mutex::new(Some(Tasks { timer, worker })),
                report: OnceCell::new(),
            }),
        })
    }
}

struct Tasks {
    timer: JoinHandle<()>,
    worker: JoinHandle<()>,
}

struct Inner {
    builder: EventBuilder,
    buffer: Arc<BatchBuffer>,
    queue: Arc<DeliveryQueue>,
    counters: Arc<Counters>,
    spill: Option<Arc<dyn SpillStore>>,
    shutdown_timeout: Duration,
    timer_stop: CancellationToken,
    worker_stop: CancellationToken,
    tasks: Mutex<Option<Tasks>>,
    report: OnceCell<ShutdownReport>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Without an explicit shutdown, sealed batches are still drained but
        // buffered events are lost.
        self.timer_stop.cancel();
        self.worker_stop.cancel();
    }
}

/// Outcome of [`Meter::shutdown`].
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    /// Batch sealed from the events buffered at shutdown.
    pub final_batch: Option<BatchId>,
    /// Every queued batch reached a terminal state within the timeout.
    pub drained: bool,
    /// Batches still undelivered when the timeout expired.
    pub abandoned_batches: usize,
    /// Abandoned batches written to the spill store.
    pub spilled_batches: usize,
    /// Events in abandoned batches that could not be spilled.
    pub lost_events: usize,
    /// Counters after shutdown.
    pub stats: MeterStats,
}

/// Handle to a running metering pipeline.
///
/// Cloning is cheap; all clones feed the same buffer. Recording never blocks
/// on the network and never fails the caller: problems surface in
/// [`Meter::stats`] and logs.
#[derive(Clone)]
pub struct Meter {
    inner: Arc<Inner>,
}

impl Meter {
    /// Start configuring a meter.
    pub fn builder(config: MeterConfig) -> MeterBuilder {
        MeterBuilder {
            config,
            transport: None,
            spill: None,
            catalog: None,
            counters: None,
        }
    }

    /// Start a meter with default collaborators for `config`.
    ///
    /// # Errors
    ///
    /// See [`MeterBuilder::start`].
    pub fn start(config: MeterConfig) -> Result<Self, ClientError> {
        Self::builder(config).start()
    }

    /// Record a completed call, tagged with the active [`scope`].
    ///
    /// Returns the event ID, or `None` if the meter is shutting down.
    pub fn record(&self, observation: &CallObservation) -> Option<EventId> {
        self.record_with_context(observation, &scope::current())
    }

    /// Record a completed call with explicit tags.
    pub fn record_with_context(
        &self,
        observation: &CallObservation,
        context: &TagContext,
    ) -> Option<EventId> {
        let event = self.inner.builder.build(observation, context);
        let event_id = event.event_id;
        let confidence = event.cost_confidence;
        let warned = event.counting_warning.is_some();

        if !self.inner.buffer.append(event) {
            return None;
        }
        self.inner.counters.record_confidence(confidence);
        if warned {
            Counters::incr(&self.inner.counters.counting_warnings);
        }
        Some(event_id)
    }

    /// Seal buffered events now. Returns `None` if nothing was buffered.
    pub fn flush(&self) -> Option<BatchId> {
        self.inner.buffer.flush(z_meter_core::FlushTrigger::Manual)
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> MeterStats {
        self.inner.counters.snapshot()
    }

    /// Catalog used for pricing; reload it to change prices at runtime.
    #[must_use]
    pub fn catalog(&self) -> &Arc<PricingCatalog> {
        self.inner.builder.cost_engine().catalog()
    }

    /// Project every event is attributed to.
    #[must_use]
    pub fn project_id(&self) -> &str {
        self.inner.builder.project_id()
    }

    /// Events buffered and not yet sealed.
    #[must_use]
    pub fn buffered_events(&self) -> usize {
        self.inner.buffer.len()
    }

    /// Sealed batches not yet in a terminal state.
    #[must_use]
    pub fn pending_batches(&self) -> usize {
        self.inner.queue.len()
    }

    /// Stop the timer, seal remaining events and wait for delivery.
    ///
    /// Waits at most the configured shutdown timeout; batches still
    /// undelivered after that are spilled or counted as lost. Concurrent and
    /// later calls wait for the first shutdown and return its report.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.inner.report.get_or_init(|| self.drain()).await.clone()
    }

    async fn drain(&self) -> ShutdownReport {
        let tasks = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Tasks { timer, mut worker }) = tasks else {
            // An earlier shutdown was cancelled after taking the tasks.
            return ShutdownReport {
                drained: self.pending_batches() == 0,
                stats: self.stats(),
                ..ShutdownReport::default()
            };
        };

        tracing::info!(pending = self.pending_batches(), "Meter shutting down");

        self.inner.timer_stop.cancel();
        if let Err(e) = timer.await {
            tracing::warn!(error = %e, "Flush timer ended abnormally");
        }

        let final_batch = self.inner.buffer.close();
        self.inner.worker_stop.cancel();

        let drained =
            match tokio::time::timeout(self.inner.shutdown_timeout, &mut worker).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Delivery worker ended abnormally");
                    false
                }
                Err(_) => {
                    worker.abort();
                    // Wait for the abort so the queue is no longer touched.
                    let _ = worker.await;
                    false
                }
            };

        let mut report = ShutdownReport {
            final_batch,
            drained,
            ..ShutdownReport::default()
        };

        for batch in self.inner.queue.take_all() {
            report.abandoned_batches += 1;
            match dispose_undelivered(&batch, self.inner.spill.as_deref(), &self.inner.counters) {
                Disposition::Spilled => report.spilled_batches += 1,
                Disposition::Dropped => report.lost_events += batch.len(),
            }
        }

        report.stats = self.stats();
        tracing::info!(
            drained = report.drained,
            abandoned = report.abandoned_batches,
            spilled = report.spilled_batches,
            lost_events = report.lost_events,
            "Meter stopped"
        );
        report
    }
}

impl fmt::Debug for Meter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Meter")
            .field("project_id", &self.project_id())
            .field("buffered_events", &self.buffered_events())
            .field("pending_batches", &self.pending_batches())
            .field("local_persistence", &self.inner.spill.is_some())
            .finish()
    }
}
