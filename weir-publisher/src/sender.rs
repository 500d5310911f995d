//! Guarded outbound sender.
//!
//! Wraps a [`DeadLetterSink`] with circuit-breaker admission, a hard
//! per-attempt timeout, and bounded transport-level retries. These retries
//! govern the send attempt itself and are independent of the consumer's
//! message-level retry policy.

use crate::breaker::CircuitBreaker;
use crate::config::GuardConfig;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};
use weir_core::{DeadLetterSink, Error, Result};

/// Outbound sender protected by the front-pressure guard.
///
/// Implements [`DeadLetterSink`] itself, so it composes as a decorator
/// anywhere a sink is expected.
pub struct GuardedSender {
    sink: Arc<dyn DeadLetterSink>,
    breaker: CircuitBreaker,
    config: GuardConfig,
}

impl std::fmt::Debug for GuardedSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedSender")
            .field("destination", &self.breaker.destination())
            .field("state", &self.breaker.state())
            .field("config", &self.config)
            .finish()
    }
}

impl GuardedSender {
    /// Wrap a sink with guard protection for the named destination.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn new(
        destination: impl Into<String>,
        sink: Arc<dyn DeadLetterSink>,
        config: GuardConfig,
    ) -> Result<Self> {
        config.validate()?;
        let breaker =
            CircuitBreaker::new(destination, config.failure_threshold, config.reset_timeout);
        Ok(Self { sink, breaker, config })
    }

    /// The breaker guarding this sender.
    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.config.backoff_base.saturating_mul(2u32.saturating_pow(attempt));
        exp.min(self.config.backoff_max)
    }

    async fn send_once(
        &self,
        topic: &str,
        payload: Bytes,
        headers: HashMap<String, String>,
    ) -> Result<()> {
        self.breaker.try_admit()?;

        let attempt = timeout(self.config.send_timeout, self.sink.publish(topic, payload, headers));
        match attempt.await {
            Ok(Ok(())) => {
                self.breaker.on_success();
                Ok(())
            },
            Ok(Err(err)) => {
                self.breaker.on_failure();
                Err(err)
            },
            Err(_) => {
                self.breaker.on_failure();
                Err(Error::transport(format!(
                    "send to '{}' timed out after {:?}",
                    self.breaker.destination(),
                    self.config.send_timeout
                )))
            },
        }
    }
}

#[async_trait]
impl DeadLetterSink for GuardedSender {
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        headers: HashMap<String, String>,
    ) -> Result<()> {
        let mut last_err = None;

        for attempt in 0..self.config.max_attempts {
            match self.send_once(topic, payload.clone(), headers.clone()).await {
                Ok(()) => {
                    if attempt > 0 {
                        debug!(
                            destination = %self.breaker.destination(),
                            attempt,
                            "send succeeded after transport retry"
                        );
                    }
                    return Ok(());
                },
                // An open circuit rejects every further attempt in this
                // window; fail fast instead of sleeping through it.
                Err(err @ Error::CircuitOpen { .. }) => return Err(err),
                Err(err) => {
                    warn!(
                        destination = %self.breaker.destination(),
                        attempt,
                        error = %err,
                        "send attempt failed"
                    );
                    last_err = Some(err);
                    if attempt + 1 < self.config.max_attempts {
                        sleep(self.backoff_delay(attempt)).await;
                    }
                },
            }
        }

        Err(last_err.unwrap_or_else(|| Error::transport("send failed with no attempts made")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Sink that fails a configurable number of times before succeeding.
    struct FlakySink {
        calls: AtomicU32,
        failures_before_success: u32,
    }

    impl FlakySink {
        fn new(failures_before_success: u32) -> Self {
            Self { calls: AtomicU32::new(0), failures_before_success }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DeadLetterSink for FlakySink {
        async fn publish(
            &self,
            _topic: &str,
            _payload: Bytes,
            _headers: HashMap<String, String>,
        ) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                Err(Error::transport("connection refused"))
            } else {
                Ok(())
            }
        }
    }

    fn fast_config() -> GuardConfig {
        GuardConfig {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(1),
            max_attempts: 3,
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let sink = Arc::new(FlakySink::new(2));
        let sender = GuardedSender::new("dlq", sink.clone(), fast_config()).unwrap();

        sender.publish("dead-letters", Bytes::from("payload"), HashMap::new()).await.unwrap();
        assert_eq!(sink.calls(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_surface_last_error() {
        let sink = Arc::new(FlakySink::new(u32::MAX));
        let sender = GuardedSender::new("dlq", sink.clone(), fast_config()).unwrap();

        let err = sender
            .publish("dead-letters", Bytes::from("payload"), HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
        assert_eq!(sink.calls(), 3);
    }

    #[tokio::test]
    async fn test_open_circuit_rejects_without_network_call() {
        let sink = Arc::new(FlakySink::new(u32::MAX));
        let config = GuardConfig { failure_threshold: 2, ..fast_config() };
        let sender = GuardedSender::new("dlq", sink.clone(), config).unwrap();

        // Two failing publishes (3 attempts each) trip the breaker mid-way.
        let _ = sender.publish("t", Bytes::new(), HashMap::new()).await;
        let calls_after_trip = sink.calls();
        assert_eq!(calls_after_trip, 2);

        // The circuit is open: no further network calls are made.
        let err = sender.publish("t", Bytes::new(), HashMap::new()).await.unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { .. }));
        assert_eq!(sink.calls(), calls_after_trip);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_send_after_reset() {
        let sink = Arc::new(FlakySink::new(2));
        let config =
            GuardConfig { failure_threshold: 2, max_attempts: 1, ..fast_config() };
        let sender = GuardedSender::new("dlq", sink.clone(), config).unwrap();

        let _ = sender.publish("t", Bytes::new(), HashMap::new()).await;
        let _ = sender.publish("t", Bytes::new(), HashMap::new()).await;
        assert_eq!(sink.calls(), 2);

        tokio::time::advance(Duration::from_secs(31)).await;

        // Half-open trial goes through and closes the circuit.
        sender.publish("t", Bytes::new(), HashMap::new()).await.unwrap();
        assert_eq!(sink.calls(), 3);
        assert_eq!(
            sender.breaker().state(),
            crate::breaker::BreakerState::Closed
        );
    }
}
