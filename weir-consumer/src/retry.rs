//! Failure router.
//!
//! Drives a failing message to a terminal state: retries with exponential
//! backoff while the classifier allows it, then hands the message to the
//! dead-letter sink with its failure context. Retries run inline in the
//! calling key-group task, so a retrying message keeps blocking its
//! successors and per-key ordering holds.

use crate::config::RetryConfig;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use weir_core::{
    DeadLetterSink, Error, ErrorClass, HandlerError, Message, MessageHandler, MetricsSink,
};

/// Decides whether a failed attempt should be retried.
///
/// Receives the error and the number of retries already performed.
pub type RetryClassifier = Arc<dyn Fn(&HandlerError, u32) -> bool + Send + Sync>;

/// Default policy: transient and unknown errors retry, validation errors
/// never do.
#[must_use]
pub fn default_retry_classifier() -> RetryClassifier {
    Arc::new(|error, _attempt| match error.class {
        ErrorClass::Transient | ErrorClass::Unknown => true,
        ErrorClass::Validation => false,
    })
}

/// Terminal outcome of routing a failed message.
#[derive(Debug)]
pub enum RouteOutcome {
    /// A retry attempt succeeded.
    Recovered,
    /// The message was published to the dead-letter sink; handled for
    /// commit purposes.
    DeadLettered,
    /// The dead-letter publish itself failed; the message is not terminal
    /// and its group must halt uncommitted.
    Failed(Error),
}

/// Retry bookkeeping for one failing message; dropped on success or DLQ
/// hand-off.
#[derive(Debug)]
struct RetryRecord {
    attempt: u32,
    next_retry_at: Instant,
    last_error: HandlerError,
}

/// Routes processing failures to retry or the dead-letter sink.
pub struct FailureRouter {
    config: RetryConfig,
    classifier: RetryClassifier,
    dlq: Arc<dyn DeadLetterSink>,
    dlq_topic: String,
    metrics: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for FailureRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureRouter")
            .field("config", &self.config)
            .field("dlq_topic", &self.dlq_topic)
            .finish()
    }
}

impl FailureRouter {
    /// Create a router publishing exhausted messages to `dlq_topic`.
    #[must_use]
    pub fn new(
        config: RetryConfig,
        classifier: RetryClassifier,
        dlq: Arc<dyn DeadLetterSink>,
        dlq_topic: impl Into<String>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self { config, classifier, dlq, dlq_topic: dlq_topic.into(), metrics }
    }

    /// Drive a failed message to a terminal state.
    pub async fn route(
        &self,
        message: &Message,
        first_error: HandlerError,
        handler: &Arc<dyn MessageHandler>,
    ) -> RouteOutcome {
        let mut record =
            RetryRecord { attempt: 0, next_retry_at: Instant::now(), last_error: first_error };

        loop {
            if record.attempt >= self.config.max_retries
                || !(self.classifier)(&record.last_error, record.attempt)
            {
                return self.dead_letter(message, &record).await;
            }

            let delay = self.backoff(record.attempt);
            record.next_retry_at = Instant::now() + delay;
            debug!(
                partition = %message.partition,
                offset = %message.offset,
                attempt = record.attempt,
                ?delay,
                error = %record.last_error,
                "scheduling retry"
            );
            self.metrics.record_retry();
            tokio::time::sleep_until(record.next_retry_at).await;
            record.attempt += 1;

            match handler.process(message).await {
                Ok(()) => {
                    info!(
                        partition = %message.partition,
                        offset = %message.offset,
                        attempt = record.attempt,
                        "message recovered on retry"
                    );
                    return RouteOutcome::Recovered;
                },
                Err(err) => record.last_error = err,
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.config.backoff_base.saturating_mul(2u32.saturating_pow(attempt));
        exp.min(self.config.backoff_max)
    }

    async fn dead_letter(&self, message: &Message, record: &RetryRecord) -> RouteOutcome {
        let mut headers = message.headers.clone().unwrap_or_default();
        headers.insert("weir-original-partition".to_string(), message.partition.to_string());
        headers.insert("weir-original-offset".to_string(), message.offset.to_string());
        if let Some(key) = message.key() {
            headers.insert("weir-original-key".to_string(), key.to_string());
        }
        headers.insert("weir-failure-reason".to_string(), record.last_error.message.clone());
        headers.insert("weir-error-class".to_string(), record.last_error.class.to_string());
        headers.insert("weir-attempt-count".to_string(), record.attempt.to_string());

        match self.dlq.publish(&self.dlq_topic, message.payload.clone(), headers).await {
            Ok(()) => {
                self.metrics.record_dead_lettered();
                warn!(
                    partition = %message.partition,
                    offset = %message.offset,
                    attempts = record.attempt,
                    class = %record.last_error.class,
                    reason = %record.last_error.message,
                    "message dead-lettered"
                );
                RouteOutcome::DeadLettered
            },
            Err(err) => {
                error!(
                    partition = %message.partition,
                    offset = %message.offset,
                    error = %err,
                    "dead-letter publish failed; message remains non-terminal"
                );
                RouteOutcome::Failed(err)
            },
        }
    }
}
