//! Consumer engine wiring.
//!
//! Owns the pipeline tasks: one intake task per assigned partition set
//! (fetch, dedup, aggregation, pause gate), a dispatch task that drains
//! closed batches in order, the idempotency sweep, and the memory monitor.
//! Shutdown stops intake immediately and drains in-flight key groups up to
//! the configured grace timeout.

use crate::aggregator::{Batch, BatchAggregator};
use crate::backpressure::{
    default_memory_probe, BackpressureController, MemoryMonitor, MemoryProbe,
};
use crate::config::ConsumerConfig;
use crate::dedup::{default_key_extractor, IdempotencyFilter, KeyExtractor};
use crate::dispatcher::Dispatcher;
use crate::offset::OffsetTracker;
use crate::retry::{default_retry_classifier, FailureRouter, RetryClassifier};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};
use weir_core::{
    BrokerTransport, DeadLetterSink, Error, Message, MessageHandler, MetricsSink, PartitionId,
    Result,
};

/// Closed batches buffered between intake and dispatch. A small depth
/// keeps aggregation running while a batch dispatches without hoarding
/// memory.
const BATCH_QUEUE_DEPTH: usize = 2;

/// Timer granularity while no batch is open.
const IDLE_TICK: Duration = Duration::from_secs(1);

/// The consumption pipeline, constructed from explicit configuration and
/// the abstract collaborators it consumes.
pub struct ConsumerEngine {
    config: ConsumerConfig,
    transport: Arc<dyn BrokerTransport>,
    handler: Arc<dyn MessageHandler>,
    dlq: Arc<dyn DeadLetterSink>,
    metrics: Arc<dyn MetricsSink>,
    key_extractor: KeyExtractor,
    retry_classifier: RetryClassifier,
    memory_probe: MemoryProbe,
}

impl std::fmt::Debug for ConsumerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerEngine").field("config", &self.config).finish()
    }
}

impl ConsumerEngine {
    /// Create an engine from configuration and collaborators.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn new(
        config: ConsumerConfig,
        transport: Arc<dyn BrokerTransport>,
        handler: Arc<dyn MessageHandler>,
        dlq: Arc<dyn DeadLetterSink>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            transport,
            handler,
            dlq,
            metrics,
            key_extractor: default_key_extractor(),
            retry_classifier: default_retry_classifier(),
            memory_probe: default_memory_probe(),
        })
    }

    /// Replace the idempotency key extractor.
    #[must_use]
    pub fn with_key_extractor(mut self, extractor: KeyExtractor) -> Self {
        self.key_extractor = extractor;
        self
    }

    /// Replace the retry classifier.
    #[must_use]
    pub fn with_retry_classifier(mut self, classifier: RetryClassifier) -> Self {
        self.retry_classifier = classifier;
        self
    }

    /// Replace the memory probe used by the pressure monitor.
    #[must_use]
    pub fn with_memory_probe(mut self, probe: MemoryProbe) -> Self {
        self.memory_probe = probe;
        self
    }

    /// Spawn the pipeline tasks and return the running engine's handle.
    #[must_use]
    pub fn start(self) -> EngineHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (controller, pause_rx) =
            BackpressureController::new(&self.config.backpressure, Arc::clone(&self.metrics));

        let aggregator = BatchAggregator::new(self.config.batch.clone());
        let size_multiplier = aggregator.size_multiplier();
        let filter = Arc::new(IdempotencyFilter::new(&self.config.dedup, self.key_extractor));
        let pending = Arc::new(AtomicUsize::new(0));

        let router = Arc::new(FailureRouter::new(
            self.config.retry.clone(),
            self.retry_classifier,
            Arc::clone(&self.dlq),
            self.config.dlq_topic.clone(),
            Arc::clone(&self.metrics),
        ));
        let dispatcher = Dispatcher::new(
            Arc::clone(&self.handler),
            router,
            Arc::clone(&controller),
            self.config.backpressure.max_concurrency,
            Arc::clone(&self.metrics),
            Arc::clone(&pending),
        );

        let (batch_tx, batch_rx) = mpsc::channel(BATCH_QUEUE_DEPTH);

        let intake = IntakeTask {
            transport: Arc::clone(&self.transport),
            aggregator,
            filter: Arc::clone(&filter),
            tracker: OffsetTracker::new(&self.config.assignments),
            partitions: self.config.assignments.iter().map(|a| a.partition).collect(),
            batch_tx,
            pending: Arc::clone(&pending),
            metrics: Arc::clone(&self.metrics),
            fetch_idle_backoff: self.config.fetch_idle_backoff,
        };
        let intake_handle = tokio::spawn(intake.run(shutdown_rx.clone(), pause_rx));

        let dispatch_handle =
            tokio::spawn(run_dispatch(batch_rx, dispatcher, Arc::clone(&self.transport)));

        let mut aux = Vec::new();
        if self.config.dedup.enabled {
            let sweep_interval = self.config.dedup.sweep_interval;
            let mut sweep_shutdown = shutdown_rx.clone();
            aux.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(sweep_interval) => {
                            filter.sweep();
                        },
                        _ = sweep_shutdown.changed() => {
                            if *sweep_shutdown.borrow() {
                                return;
                            }
                        },
                    }
                }
            }));
        }

        let monitor = MemoryMonitor::new(
            self.config.backpressure.memory.clone(),
            self.memory_probe,
            controller,
            size_multiplier,
        );
        if monitor.enabled() {
            aux.push(tokio::spawn(monitor.run(shutdown_rx)));
        }

        info!(
            partitions = self.config.assignments.len(),
            batch_size = self.config.batch.batch_size,
            max_concurrency = self.config.backpressure.max_concurrency,
            "consumer engine started"
        );

        EngineHandle {
            shutdown_tx,
            intake: intake_handle,
            dispatch: dispatch_handle,
            aux,
            pending,
            grace: self.config.graceful_shutdown_timeout,
        }
    }
}

/// Handle to a running engine.
#[derive(Debug)]
pub struct EngineHandle {
    shutdown_tx: watch::Sender<bool>,
    intake: JoinHandle<Result<()>>,
    dispatch: JoinHandle<Result<()>>,
    aux: Vec<JoinHandle<()>>,
    pending: Arc<AtomicUsize>,
    grace: Duration,
}

impl EngineHandle {
    /// Messages accepted into dispatch that have not reached a terminal
    /// state.
    #[must_use]
    pub fn pending_messages(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Stop the engine: intake halts immediately, in-flight key groups
    /// drain up to the grace timeout, and anything still running is then
    /// aborted.
    ///
    /// # Errors
    /// Returns [`Error::ShutdownTimeout`] when the grace period expired
    /// with messages not yet terminal. Those offsets stay uncommitted; the
    /// broker redelivers them and the idempotency filter absorbs
    /// duplicates of whatever did complete.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("engine shutdown requested");
        let _ = self.shutdown_tx.send(true);
        let deadline = Instant::now() + self.grace;

        let intake_done = timeout_at(deadline, &mut self.intake).await;
        if intake_done.is_err() {
            self.intake.abort();
        }
        let dispatch_done = timeout_at(deadline, &mut self.dispatch).await;
        if dispatch_done.is_err() {
            self.dispatch.abort();
        }
        for handle in &self.aux {
            handle.abort();
        }

        match (intake_done, dispatch_done) {
            (Ok(intake_join), Ok(dispatch_join)) => {
                flatten_join("intake", intake_join)?;
                flatten_join("dispatch", dispatch_join)?;
                info!("engine stopped cleanly");
                Ok(())
            },
            _ => {
                let pending = self.pending.load(Ordering::Relaxed);
                error!(pending, "shutdown grace expired; aborting in-flight work");
                Err(Error::ShutdownTimeout { pending })
            },
        }
    }
}

fn flatten_join(
    task: &str,
    join: std::result::Result<Result<()>, tokio::task::JoinError>,
) -> Result<()> {
    match join {
        Ok(result) => result,
        Err(err) => Err(Error::Internal { message: format!("{task} task failed: {err}") }),
    }
}

/// Intake: fetches assigned partitions round-robin, filters duplicates,
/// aggregates, and ships closed batches downstream.
struct IntakeTask {
    transport: Arc<dyn BrokerTransport>,
    aggregator: BatchAggregator,
    filter: Arc<IdempotencyFilter>,
    tracker: OffsetTracker,
    partitions: Vec<PartitionId>,
    batch_tx: mpsc::Sender<Batch>,
    pending: Arc<AtomicUsize>,
    metrics: Arc<dyn MetricsSink>,
    fetch_idle_backoff: Duration,
}

impl IntakeTask {
    async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
        mut pause_gate: watch::Receiver<bool>,
    ) -> Result<()> {
        info!(partitions = self.partitions.len(), "intake started");
        let mut next_partition = 0usize;
        let mut idle_streak = 0usize;

        loop {
            let deadline =
                self.aggregator.deadline().unwrap_or_else(|| Instant::now() + IDLE_TICK);
            let paused = *pause_gate.borrow();
            let partition = self.partitions[next_partition];
            let position = self.tracker.position(partition);
            // Back off only once every partition came up empty.
            let idle_delay = if idle_streak >= self.partitions.len() {
                self.fetch_idle_backoff
            } else {
                Duration::ZERO
            };
            let transport = Arc::clone(&self.transport);
            let fetch = async move {
                if !idle_delay.is_zero() {
                    tokio::time::sleep(idle_delay).await;
                }
                transport.fetch(partition, position).await
            };

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("intake stopping on shutdown signal");
                        break;
                    }
                },
                changed = pause_gate.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *pause_gate.borrow() {
                        if let Err(err) = self.transport.pause(&self.partitions).await {
                            warn!(error = %err, "broker-level pause failed");
                        }
                    } else if let Err(err) = self.transport.resume(&self.partitions).await {
                        warn!(error = %err, "broker-level resume failed");
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    if let Some(batch) = self.aggregator.close_due(Instant::now()) {
                        self.ship(batch).await?;
                    }
                },
                fetched = fetch, if !paused => {
                    next_partition = (next_partition + 1) % self.partitions.len();
                    match fetched {
                        Ok(messages) if messages.is_empty() => idle_streak += 1,
                        Ok(messages) => {
                            idle_streak = 0;
                            self.ingest(messages).await?;
                        },
                        Err(err) => {
                            // Fetch failures are transient until proven
                            // otherwise; the position is unchanged so the
                            // next round retries the same span.
                            warn!(%partition, error = %err, "fetch failed");
                            idle_streak += 1;
                        },
                    }
                },
            }
        }
        Ok(())
    }

    async fn ingest(&mut self, messages: Vec<Message>) -> Result<()> {
        for message in messages {
            self.tracker.advance(message.partition, message.offset.next());
            if self.filter.should_process(&message) {
                if let Some(batch) = self.aggregator.offer(message) {
                    self.ship(batch).await?;
                }
            } else {
                self.metrics.record_duplicate();
            }
        }
        Ok(())
    }

    /// Stamp commit marks and hand the batch downstream. Blocks when the
    /// dispatch queue is full, which is itself a pressure signal.
    async fn ship(&mut self, mut batch: Batch) -> Result<()> {
        batch.commit_marks = self.tracker.snapshot();
        self.pending.fetch_add(batch.message_count, Ordering::Relaxed);
        debug!(messages = batch.message_count, groups = batch.groups.len(), "batch shipped");
        self.batch_tx
            .send(batch)
            .await
            .map_err(|_| Error::Internal { message: "dispatch channel closed".to_string() })
    }
}

/// Dispatch: drains closed batches in order and commits their marks once
/// every key group is terminal.
async fn run_dispatch(
    mut batch_rx: mpsc::Receiver<Batch>,
    dispatcher: Dispatcher,
    transport: Arc<dyn BrokerTransport>,
) -> Result<()> {
    while let Some(mut batch) = batch_rx.recv().await {
        let marks = std::mem::take(&mut batch.commit_marks);
        let outcome = dispatcher.dispatch(batch).await;

        if outcome.commit_eligible {
            for (partition, offset) in marks {
                if let Err(err) = transport.commit(partition, offset).await {
                    // The broker redelivers past the stale commit point on
                    // restart; the idempotency filter absorbs the overlap.
                    error!(%partition, %offset, error = %err, "offset commit failed");
                }
            }
        } else {
            warn!(
                messages = outcome.message_count,
                "batch had non-terminal messages; commit withheld for redelivery"
            );
        }
    }
    debug!("dispatch queue drained");
    Ok(())
}
