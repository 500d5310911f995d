//! Consumer pipeline configuration types.
//!
//! Configuration is an explicit struct passed to the engine constructor;
//! loading it from files or the environment is the application's concern.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use weir_core::{Error, Offset, PartitionId, Result};

/// A partition handed to this consumer, with its start position.
///
/// Group membership and rebalancing are external collaborators; the engine
/// consumes whatever assignment it is given.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PartitionAssignment {
    /// Assigned partition
    pub partition: PartitionId,
    /// First offset to fetch
    pub start_offset: Offset,
}

impl PartitionAssignment {
    /// Assignment starting at the given offset.
    #[must_use]
    pub const fn new(partition: PartitionId, start_offset: Offset) -> Self {
        Self { partition, start_offset }
    }
}

/// Configuration for the consumption pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Partitions to consume and their start offsets
    pub assignments: Vec<PartitionAssignment>,

    /// Batch aggregation configuration
    pub batch: BatchConfig,

    /// Backpressure configuration
    pub backpressure: BackpressureConfig,

    /// Idempotency filter configuration
    pub dedup: DedupConfig,

    /// Message-level retry configuration
    pub retry: RetryConfig,

    /// Topic dead-lettered messages are published to
    pub dlq_topic: String,

    /// Delay before re-fetching a partition that returned no messages
    pub fetch_idle_backoff: Duration,

    /// Grace period for in-flight work during shutdown
    pub graceful_shutdown_timeout: Duration,
}

/// Batch aggregation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Messages per batch before it closes on size
    pub batch_size: usize,

    /// Maximum time a batch stays open before it closes on timeout
    pub batch_timeout: Duration,

    /// Group by message key (true) or by partition (false)
    pub group_by_key: bool,
}

/// Backpressure controller configuration.
///
/// Thresholds are fractions of `max_concurrency`: intake pauses when the
/// in-flight ratio reaches `pause_threshold` and resumes once it falls to
/// `pause_threshold * resume_factor`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureConfig {
    /// Maximum concurrently processing key groups
    pub max_concurrency: usize,

    /// In-flight ratio at which intake pauses
    pub pause_threshold: f64,

    /// Fraction of the pause threshold at which intake resumes
    pub resume_factor: f64,

    /// Enable latency-driven threshold tuning
    pub adaptive: bool,

    /// Target per-batch processing latency for adaptive tuning
    pub target_batch_latency: Duration,

    /// Memory watermark configuration
    pub memory: MemoryPressureConfig,
}

/// Memory watermark configuration for the pressure monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryPressureConfig {
    /// How often process memory is sampled
    pub sample_interval: Duration,

    /// RSS above which batch sizes are shrunk; None disables
    pub warning_bytes: Option<u64>,

    /// RSS above which intake is force-paused; None disables
    pub critical_bytes: Option<u64>,
}

/// Idempotency filter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Enable the filter
    pub enabled: bool,

    /// How long a seen key suppresses redeliveries
    pub ttl: Duration,

    /// Maximum tracked keys
    pub capacity: usize,

    /// Interval of the background expiry sweep
    pub sweep_interval: Duration,
}

/// Message-level retry configuration for the failure router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retry attempts after the first failure
    pub max_retries: u32,

    /// Initial retry backoff delay
    pub backoff_base: Duration,

    /// Maximum retry backoff delay
    pub backoff_max: Duration,
}

impl ConsumerConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns an error naming the first field that is out of its accepted
    /// range.
    pub fn validate(&self) -> Result<()> {
        if self.assignments.is_empty() {
            return Err(Error::configuration("at least one partition assignment is required"));
        }
        if self.batch.batch_size == 0 {
            return Err(Error::configuration("batch_size must be at least 1"));
        }
        if self.batch.batch_timeout.is_zero() {
            return Err(Error::configuration("batch_timeout must be non-zero"));
        }
        if self.backpressure.max_concurrency == 0 {
            return Err(Error::configuration("max_concurrency must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.backpressure.pause_threshold)
            || self.backpressure.pause_threshold == 0.0
        {
            return Err(Error::configuration("pause_threshold must be within (0, 1]"));
        }
        if !(0.0..1.0).contains(&self.backpressure.resume_factor)
            || self.backpressure.resume_factor == 0.0
        {
            return Err(Error::configuration("resume_factor must be within (0, 1)"));
        }
        if self.dedup.enabled && self.dedup.capacity == 0 {
            return Err(Error::configuration("dedup capacity must be at least 1"));
        }
        if self.retry.backoff_max < self.retry.backoff_base {
            return Err(Error::configuration("retry backoff_max must be >= backoff_base"));
        }
        if self.dlq_topic.is_empty() {
            return Err(Error::configuration("dlq_topic must be non-empty"));
        }
        Ok(())
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            assignments: vec![PartitionAssignment::new(PartitionId::new(0), Offset::new(0))],
            batch: BatchConfig::default(),
            backpressure: BackpressureConfig::default(),
            dedup: DedupConfig::default(),
            retry: RetryConfig::default(),
            dlq_topic: "dead-letters".to_string(),
            fetch_idle_backoff: Duration::from_millis(50),
            graceful_shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { batch_size: 500, batch_timeout: Duration::from_secs(1), group_by_key: true }
    }
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
            pause_threshold: 0.80,
            resume_factor: 0.6,
            adaptive: false,
            target_batch_latency: Duration::from_millis(500),
            memory: MemoryPressureConfig::default(),
        }
    }
}

impl Default for MemoryPressureConfig {
    fn default() -> Self {
        Self { sample_interval: Duration::from_secs(10), warning_bytes: None, critical_bytes: None }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(600),
            capacity: 100_000,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(30),
        }
    }
}
