//! Concurrency limiter and batch dispatcher.
//!
//! Runs a closed batch's key groups through the user handler with bounded
//! parallelism across distinct keys and strict sequential order within a
//! key: message n+1 starts only after message n reaches a terminal
//! outcome. Batches dispatch one at a time so offset commits stay ordered.

use crate::aggregator::{Batch, KeyGroup};
use crate::backpressure::BackpressureController;
use crate::retry::{FailureRouter, RouteOutcome};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use weir_core::{Error, MessageHandler, MetricsSink};

/// Terminal outcome of one key group.
#[derive(Debug)]
pub struct GroupOutcome {
    /// Messages that completed successfully (including retry recoveries)
    pub processed: usize,
    /// Messages handed to the dead-letter sink
    pub dead_lettered: usize,
    /// Set when the group halted before all messages reached a terminal
    /// state (dead-letter publish failure or task panic)
    pub halted: Option<Error>,
}

/// Aggregate outcome of one dispatched batch.
#[derive(Debug)]
pub struct BatchOutcome {
    /// Total messages in the batch
    pub message_count: usize,
    /// Messages that completed successfully
    pub processed: usize,
    /// Messages handed to the dead-letter sink
    pub dead_lettered: usize,
    /// Whether every group reached a terminal state; gates the offset
    /// commit
    pub commit_eligible: bool,
    /// Wall-clock dispatch duration
    pub duration: Duration,
}

/// Dispatches batches with bounded cross-key parallelism.
pub struct Dispatcher {
    handler: Arc<dyn MessageHandler>,
    router: Arc<FailureRouter>,
    controller: Arc<BackpressureController>,
    semaphore: Arc<Semaphore>,
    metrics: Arc<dyn MetricsSink>,
    /// Messages accepted into dispatch but not yet terminal; read by
    /// shutdown to report stranded work
    pending: Arc<AtomicUsize>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("available_permits", &self.semaphore.available_permits())
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .finish()
    }
}

impl Dispatcher {
    /// Create a dispatcher with `max_concurrency` key-group permits.
    #[must_use]
    pub fn new(
        handler: Arc<dyn MessageHandler>,
        router: Arc<FailureRouter>,
        controller: Arc<BackpressureController>,
        max_concurrency: usize,
        metrics: Arc<dyn MetricsSink>,
        pending: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            handler,
            router,
            controller,
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            metrics,
            pending,
        }
    }

    /// Process every key group in the batch to a terminal state.
    pub async fn dispatch(&self, batch: Batch) -> BatchOutcome {
        let started = Instant::now();
        let message_count = batch.message_count;
        debug!(messages = message_count, groups = batch.groups.len(), "dispatching batch");

        // JoinSet so dropping the dispatch future (forced shutdown) aborts
        // every in-flight group task with it.
        let mut tasks = JoinSet::new();
        for (_, group) in batch.groups {
            let semaphore = Arc::clone(&self.semaphore);
            let handler = Arc::clone(&self.handler);
            let router = Arc::clone(&self.router);
            let controller = Arc::clone(&self.controller);
            let metrics = Arc::clone(&self.metrics);
            let pending = Arc::clone(&self.pending);

            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    // The semaphore is never closed while the dispatcher
                    // lives; treat closure as a halted group.
                    return GroupOutcome {
                        processed: 0,
                        dead_lettered: 0,
                        halted: Some(Error::Internal {
                            message: "dispatch semaphore closed".to_string(),
                        }),
                    };
                };
                controller.group_started();
                let group_started = Instant::now();
                let outcome = run_group(group, &handler, &router, &metrics, &pending).await;
                controller.group_completed(group_started.elapsed());
                outcome
            });
        }

        let mut processed = 0;
        let mut dead_lettered = 0;
        let mut commit_eligible = true;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    processed += outcome.processed;
                    dead_lettered += outcome.dead_lettered;
                    if let Some(err) = outcome.halted {
                        warn!(error = %err, "key group halted without reaching terminal state");
                        commit_eligible = false;
                    }
                },
                Err(join_err) => {
                    error!(error = %join_err, "key group task panicked");
                    commit_eligible = false;
                },
            }
        }

        let duration = started.elapsed();
        self.controller.observe_batch(duration);
        self.metrics.record_batch(message_count, duration);

        BatchOutcome { message_count, processed, dead_lettered, commit_eligible, duration }
    }
}

/// Process one key group strictly in arrival order.
async fn run_group(
    group: KeyGroup,
    handler: &Arc<dyn MessageHandler>,
    router: &Arc<FailureRouter>,
    metrics: &Arc<dyn MetricsSink>,
    pending: &Arc<AtomicUsize>,
) -> GroupOutcome {
    let mut outcome = GroupOutcome { processed: 0, dead_lettered: 0, halted: None };

    for message in &group.messages {
        let terminal = match handler.process(message).await {
            Ok(()) => {
                outcome.processed += 1;
                metrics.record_processed();
                true
            },
            Err(err) => match router.route(message, err, handler).await {
                RouteOutcome::Recovered => {
                    outcome.processed += 1;
                    metrics.record_processed();
                    true
                },
                RouteOutcome::DeadLettered => {
                    outcome.dead_lettered += 1;
                    true
                },
                RouteOutcome::Failed(err) => {
                    outcome.halted = Some(err);
                    false
                },
            },
        };

        if terminal {
            pending.fetch_sub(1, Ordering::Relaxed);
        } else {
            // The failed message and everything after it in this group stay
            // non-terminal; their offsets remain uncommitted for redelivery.
            debug!(key = %group.key, "halting key group");
            break;
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{BatchAggregator, GroupKey};
    use crate::backpressure::BackpressureController;
    use crate::config::{BackpressureConfig, BatchConfig, RetryConfig};
    use crate::retry::default_retry_classifier;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;
    use weir_core::{
        DeadLetterSink, HandlerError, Message, Offset, PartitionId, PipelineMetrics, Result,
    };

    /// Records the order messages were processed in, per key.
    #[derive(Default)]
    struct OrderTrackingHandler {
        seen: Mutex<HashMap<String, Vec<u64>>>,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
        fail_offsets: Vec<u64>,
    }

    #[async_trait]
    impl MessageHandler for OrderTrackingHandler {
        async fn process(&self, message: &Message) -> std::result::Result<(), HandlerError> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);

            self.seen
                .lock()
                .entry(message.key().unwrap_or("").to_string())
                .or_default()
                .push(message.offset.value());

            if self.fail_offsets.contains(&message.offset.value()) {
                Err(HandlerError::validation("rejected"))
            } else {
                Ok(())
            }
        }
    }

    #[derive(Default)]
    struct NullSink;

    #[async_trait]
    impl DeadLetterSink for NullSink {
        async fn publish(
            &self,
            _topic: &str,
            _payload: Bytes,
            _headers: HashMap<String, String>,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn message(key: &str, offset: u64) -> Message {
        Message::builder()
            .partition(PartitionId::new(0))
            .offset(Offset::new(offset))
            .key(key)
            .payload(Bytes::from("payload"))
            .build()
            .unwrap()
    }

    fn build_batch(messages: Vec<Message>) -> Batch {
        let count = messages.len();
        let mut aggregator = BatchAggregator::new(BatchConfig {
            batch_size: count,
            batch_timeout: Duration::from_secs(60),
            group_by_key: true,
        });
        let mut batch = None;
        for message in messages {
            batch = aggregator.offer(message);
        }
        batch.expect("size trigger")
    }

    fn dispatcher(
        handler: Arc<OrderTrackingHandler>,
        max_concurrency: usize,
        pending: Arc<AtomicUsize>,
    ) -> Dispatcher {
        let metrics: Arc<PipelineMetrics> = Arc::new(PipelineMetrics::new());
        let config = BackpressureConfig { max_concurrency, ..BackpressureConfig::default() };
        let (controller, _pause_rx) = BackpressureController::new(&config, metrics.clone());
        let router = Arc::new(FailureRouter::new(
            RetryConfig {
                max_retries: 0,
                backoff_base: Duration::from_millis(1),
                backoff_max: Duration::from_millis(1),
            },
            default_retry_classifier(),
            Arc::new(NullSink),
            "dead-letters",
            metrics.clone(),
        ));
        Dispatcher::new(handler, router, controller, max_concurrency, metrics, pending)
    }

    #[tokio::test]
    async fn test_intra_key_order_cross_key_parallelism() {
        let handler = Arc::new(OrderTrackingHandler::default());
        let pending = Arc::new(AtomicUsize::new(6));
        let dispatcher = dispatcher(handler.clone(), 8, pending.clone());

        let batch = build_batch(vec![
            message("a", 0),
            message("b", 1),
            message("a", 2),
            message("c", 3),
            message("a", 4),
            message("b", 5),
        ]);
        let outcome = dispatcher.dispatch(batch).await;

        assert_eq!(outcome.processed, 6);
        assert!(outcome.commit_eligible);
        assert_eq!(pending.load(Ordering::SeqCst), 0);

        let seen = handler.seen.lock();
        assert_eq!(seen["a"], vec![0, 2, 4]);
        assert_eq!(seen["b"], vec![1, 5]);
        // Groups genuinely overlapped.
        assert!(handler.max_concurrent.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let handler = Arc::new(OrderTrackingHandler::default());
        let pending = Arc::new(AtomicUsize::new(8));
        let dispatcher = dispatcher(handler.clone(), 2, pending.clone());

        let batch = build_batch((0..8).map(|i| message(&format!("k{i}"), i)).collect());
        let outcome = dispatcher.dispatch(batch).await;

        assert_eq!(outcome.processed, 8);
        assert!(handler.max_concurrent.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_failure_in_one_group_spares_siblings() {
        let handler = Arc::new(OrderTrackingHandler {
            fail_offsets: vec![2],
            ..OrderTrackingHandler::default()
        });
        let pending = Arc::new(AtomicUsize::new(4));
        let dispatcher = dispatcher(handler.clone(), 4, pending.clone());

        let batch = build_batch(vec![
            message("a", 0),
            message("a", 2), // dead-letters (validation, zero retries)
            message("a", 4), // still processed after the DLQ terminal
            message("b", 1),
        ]);
        let outcome = dispatcher.dispatch(batch).await;

        assert_eq!(outcome.processed, 3);
        assert_eq!(outcome.dead_lettered, 1);
        assert!(outcome.commit_eligible);
        assert_eq!(pending.load(Ordering::SeqCst), 0);

        let seen = handler.seen.lock();
        assert_eq!(seen["a"], vec![0, 2, 4]);
        assert_eq!(seen["b"], vec![1]);
    }
}
