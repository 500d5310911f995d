//! Traits at the pipeline's external seams.
//!
//! The engine consumes the broker, the dead-letter sink, the metrics sink,
//! and the application handler exclusively through these interfaces. Wire
//! protocol, group membership, and codec concerns live behind them.

use crate::error::HandlerError;
use crate::message::Message;
use crate::types::{Offset, PartitionId};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;

/// Broker-facing transport used by the intake path.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Fetch messages from a partition starting at the given offset.
    ///
    /// An empty result means no messages are currently available.
    async fn fetch(&self, partition: PartitionId, offset: Offset) -> Result<Vec<Message>>;

    /// Pause fetching for the given partitions at the broker level.
    async fn pause(&self, partitions: &[PartitionId]) -> Result<()>;

    /// Resume fetching for previously paused partitions.
    async fn resume(&self, partitions: &[PartitionId]) -> Result<()>;

    /// Commit the given offset for a partition.
    async fn commit(&self, partition: PartitionId, offset: Offset) -> Result<()>;
}

/// Destination for messages that exhausted their retry policy.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Publish a payload with headers to the given topic.
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        headers: HashMap<String, String>,
    ) -> Result<()>;
}

/// Application-supplied message processing logic.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process a single message.
    ///
    /// # Errors
    /// Returns a classified [`HandlerError`]; the class drives the
    /// retry/DLQ decision.
    async fn process(&self, message: &Message) -> std::result::Result<(), HandlerError>;

    /// Process a batch of messages for improved throughput.
    ///
    /// The default implementation processes sequentially and stops at the
    /// first failure, preserving in-order semantics.
    async fn process_batch(
        &self,
        messages: &[Message],
    ) -> std::result::Result<(), HandlerError> {
        for message in messages {
            self.process(message).await?;
        }
        Ok(())
    }
}

/// Sink for pipeline counters and the health probe.
///
/// Injected at construction rather than reached as ambient global state.
pub trait MetricsSink: Send + Sync {
    /// A message completed user processing successfully.
    fn record_processed(&self);

    /// A duplicate was absorbed by the idempotency filter.
    fn record_duplicate(&self);

    /// A processing attempt failed and was scheduled for retry.
    fn record_retry(&self);

    /// A message was routed to the dead-letter sink.
    fn record_dead_lettered(&self);

    /// A batch finished dispatch.
    fn record_batch(&self, messages: usize, duration: std::time::Duration);

    /// The intake gate was paused for the given duration.
    fn record_paused(&self, duration: std::time::Duration);

    /// Whether the pipeline is currently healthy.
    fn healthy(&self) -> bool;
}
