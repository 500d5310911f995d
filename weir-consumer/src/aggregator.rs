//! Key-grouped batch aggregator.
//!
//! Collects intake messages into the single open batch, partitioned by
//! grouping key so intra-key arrival order survives parallel dispatch. The
//! aggregator is owned by the intake task alone, which makes the
//! close-then-reopen transition atomic without locking.

use crate::config::BatchConfig;
use crossbeam::atomic::AtomicCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;
use weir_core::{Message, Offset, PartitionId};

/// Key a batch's messages are grouped under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupKey {
    /// Application message key
    Key(String),
    /// Source partition, for keyless messages or partition-grouped mode
    Partition(PartitionId),
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => write!(f, "key:{key}"),
            Self::Partition(partition) => write!(f, "partition:{partition}"),
        }
    }
}

/// Ordered sequence of messages sharing one grouping key within a batch.
///
/// Invariant: messages retain broker arrival order.
#[derive(Debug)]
pub struct KeyGroup {
    /// The grouping key
    pub key: GroupKey,
    /// Messages in arrival order
    pub messages: Vec<Message>,
}

impl KeyGroup {
    fn new(key: GroupKey) -> Self {
        Self { key, messages: Vec::new() }
    }

    /// Number of messages in the group.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the group is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// A closed, immutable batch of key groups awaiting dispatch.
#[derive(Debug)]
pub struct Batch {
    /// Key groups in the batch
    pub groups: HashMap<GroupKey, KeyGroup>,
    /// When the batch opened
    pub opened_at: Instant,
    /// Total messages across all groups
    pub message_count: usize,
    /// Per-partition intake positions snapshotted at close; committed once
    /// every group reaches a terminal state
    pub commit_marks: Vec<(PartitionId, Offset)>,
}

impl Batch {
    /// Total messages across all groups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.message_count
    }

    /// Whether the batch holds no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.message_count == 0
    }
}

struct OpenBatch {
    groups: HashMap<GroupKey, KeyGroup>,
    opened_at: Instant,
    message_count: usize,
    /// Size trigger captured at open, after the memory-pressure multiplier
    size_limit: usize,
}

/// Aggregates messages into time/size-bounded batches.
pub struct BatchAggregator {
    config: BatchConfig,
    open: Option<OpenBatch>,
    /// Memory-pressure multiplier applied to sizes of subsequently opened
    /// batches; shared with the memory monitor
    size_multiplier: Arc<AtomicCell<f64>>,
}

impl fmt::Debug for BatchAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchAggregator")
            .field("config", &self.config)
            .field("open_count", &self.open.as_ref().map_or(0, |b| b.message_count))
            .field("size_multiplier", &self.size_multiplier.load())
            .finish()
    }
}

impl BatchAggregator {
    /// Create an aggregator with no open batch.
    #[must_use]
    pub fn new(config: BatchConfig) -> Self {
        Self { config, open: None, size_multiplier: Arc::new(AtomicCell::new(1.0)) }
    }

    /// Handle to the batch-size multiplier, for the memory monitor.
    #[must_use]
    pub fn size_multiplier(&self) -> Arc<AtomicCell<f64>> {
        Arc::clone(&self.size_multiplier)
    }

    fn group_key(&self, message: &Message) -> GroupKey {
        if self.config.group_by_key {
            match message.key {
                Some(ref key) => GroupKey::Key(key.clone()),
                None => GroupKey::Partition(message.partition),
            }
        } else {
            GroupKey::Partition(message.partition)
        }
    }

    fn effective_size(&self) -> usize {
        let scaled = self.config.batch_size as f64 * self.size_multiplier.load();
        (scaled as usize).max(1)
    }

    /// Offer a message to the open batch, opening one if needed.
    ///
    /// Returns the closed batch when the size trigger fires. The returned
    /// batch's `commit_marks` are empty; the intake fills them before
    /// handing the batch downstream.
    pub fn offer(&mut self, message: Message) -> Option<Batch> {
        let size_limit = self.effective_size();
        let key = self.group_key(&message);

        let open = self.open.get_or_insert_with(|| OpenBatch {
            groups: HashMap::new(),
            opened_at: Instant::now(),
            message_count: 0,
            size_limit,
        });

        open.groups.entry(key.clone()).or_insert_with(|| KeyGroup::new(key)).messages.push(message);
        open.message_count += 1;

        if open.message_count >= open.size_limit {
            trace!(count = open.message_count, "batch closed on size");
            return self.close();
        }
        None
    }

    /// Close the open batch if its timeout has elapsed.
    pub fn close_due(&mut self, now: Instant) -> Option<Batch> {
        let open = self.open.as_ref()?;
        if now.duration_since(open.opened_at) >= self.config.batch_timeout {
            trace!(count = open.message_count, "batch closed on timeout");
            return self.close();
        }
        None
    }

    /// Deadline of the open batch, if one is open.
    ///
    /// An idle aggregator has no deadline: nothing closes until a message
    /// arrives and the timeout runs from that batch's open.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.open.as_ref().map(|open| open.opened_at + self.config.batch_timeout)
    }

    /// Number of messages in the open batch.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.open.as_ref().map_or(0, |open| open.message_count)
    }

    fn close(&mut self) -> Option<Batch> {
        let open = self.open.take()?;
        if open.message_count == 0 {
            return None;
        }
        Some(Batch {
            groups: open.groups,
            opened_at: open.opened_at,
            message_count: open.message_count,
            commit_marks: Vec::new(),
        })
    }

    /// Configured base batch timeout.
    #[must_use]
    pub fn batch_timeout(&self) -> Duration {
        self.config.batch_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn message(key: Option<&str>, partition: u32, offset: u64) -> Message {
        let mut builder = Message::builder()
            .partition(PartitionId::new(partition))
            .offset(Offset::new(offset))
            .payload(Bytes::from("payload"));
        if let Some(key) = key {
            builder = builder.key(key);
        }
        builder.build().unwrap()
    }

    fn config(batch_size: usize, timeout_ms: u64) -> BatchConfig {
        BatchConfig {
            batch_size,
            batch_timeout: Duration::from_millis(timeout_ms),
            group_by_key: true,
        }
    }

    #[tokio::test]
    async fn test_closes_on_size_without_timeout() {
        let mut aggregator = BatchAggregator::new(config(3, 60_000));

        assert!(aggregator.offer(message(Some("a"), 0, 0)).is_none());
        assert!(aggregator.offer(message(Some("a"), 0, 1)).is_none());
        let batch = aggregator.offer(message(Some("b"), 0, 2)).expect("size trigger");

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.groups.len(), 2);
        assert_eq!(batch.groups[&GroupKey::Key("a".into())].len(), 2);
        assert_eq!(batch.groups[&GroupKey::Key("b".into())].len(), 1);
        // A new empty batch opens lazily; nothing is pending.
        assert_eq!(aggregator.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closes_on_timeout_with_partial_count() {
        let mut aggregator = BatchAggregator::new(config(100, 1_000));

        aggregator.offer(message(Some("a"), 0, 0));
        assert!(aggregator.close_due(Instant::now()).is_none());

        tokio::time::advance(Duration::from_millis(1_001)).await;
        let batch = aggregator.close_due(Instant::now()).expect("timeout trigger");
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_idle_aggregator_has_no_deadline() {
        let mut aggregator = BatchAggregator::new(config(10, 1_000));
        assert!(aggregator.deadline().is_none());
        assert!(aggregator.close_due(Instant::now()).is_none());

        aggregator.offer(message(Some("a"), 0, 0));
        assert!(aggregator.deadline().is_some());
    }

    #[tokio::test]
    async fn test_intra_key_order_preserved() {
        let mut aggregator = BatchAggregator::new(config(4, 60_000));

        aggregator.offer(message(Some("a"), 0, 0));
        aggregator.offer(message(Some("b"), 0, 1));
        aggregator.offer(message(Some("a"), 0, 2));
        let batch = aggregator.offer(message(Some("a"), 0, 3)).unwrap();

        let group = &batch.groups[&GroupKey::Key("a".into())];
        let offsets: Vec<u64> = group.messages.iter().map(|m| m.offset.value()).collect();
        assert_eq!(offsets, vec![0, 2, 3]);
    }

    #[tokio::test]
    async fn test_single_hot_key_batches_normally() {
        let mut aggregator = BatchAggregator::new(config(3, 60_000));

        aggregator.offer(message(Some("hot"), 0, 0));
        aggregator.offer(message(Some("hot"), 0, 1));
        let batch = aggregator.offer(message(Some("hot"), 0, 2)).unwrap();
        assert_eq!(batch.groups.len(), 1);
        assert_eq!(batch.groups[&GroupKey::Key("hot".into())].len(), 3);
    }

    #[tokio::test]
    async fn test_keyless_messages_group_by_partition() {
        let mut aggregator = BatchAggregator::new(config(3, 60_000));

        aggregator.offer(message(None, 0, 0));
        aggregator.offer(message(None, 1, 0));
        let batch = aggregator.offer(message(None, 0, 1)).unwrap();

        assert_eq!(batch.groups.len(), 2);
        assert_eq!(batch.groups[&GroupKey::Partition(PartitionId::new(0))].len(), 2);
    }

    #[tokio::test]
    async fn test_partition_grouping_mode() {
        let mut aggregator = BatchAggregator::new(BatchConfig {
            group_by_key: false,
            ..config(3, 60_000)
        });

        aggregator.offer(message(Some("a"), 0, 0));
        aggregator.offer(message(Some("b"), 0, 1));
        let batch = aggregator.offer(message(Some("c"), 1, 0)).unwrap();

        // Keys are ignored; partition order is the grouping.
        assert_eq!(batch.groups.len(), 2);
        assert_eq!(batch.groups[&GroupKey::Partition(PartitionId::new(0))].len(), 2);
    }

    #[tokio::test]
    async fn test_size_multiplier_shrinks_next_batch() {
        let mut aggregator = BatchAggregator::new(config(4, 60_000));
        let multiplier = aggregator.size_multiplier();

        // Multiplier applies to batches opened after the change.
        multiplier.store(0.5);
        assert!(aggregator.offer(message(Some("a"), 0, 0)).is_none());
        let batch = aggregator.offer(message(Some("a"), 0, 1)).expect("shrunk size trigger");
        assert_eq!(batch.len(), 2);

        // Restored multiplier applies from the next open.
        multiplier.store(1.0);
        for offset in 2..5 {
            assert!(aggregator.offer(message(Some("a"), 0, offset)).is_none());
        }
        let batch = aggregator.offer(message(Some("a"), 0, 5)).unwrap();
        assert_eq!(batch.len(), 4);
    }
}
