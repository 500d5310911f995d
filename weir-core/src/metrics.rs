//! Process-wide pipeline metrics.

use crate::traits::MetricsSink;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Atomic counters covering the pipeline's externally-observable activity.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// Messages that completed user processing successfully
    pub processed: AtomicU64,
    /// Duplicates absorbed by the idempotency filter
    pub duplicates: AtomicU64,
    /// Processing attempts that were scheduled for retry
    pub retries: AtomicU64,
    /// Messages routed to the dead-letter sink
    pub dead_lettered: AtomicU64,
    /// Batches that finished dispatch
    pub batches: AtomicU64,
    /// Messages across all dispatched batches
    pub batch_messages: AtomicU64,
    /// Cumulative time spent with the intake gate paused
    paused_total: Mutex<Duration>,
    /// Number of pause episodes
    pub pause_events: AtomicUsize,
    /// Health flag, cleared on unrecoverable trouble
    healthy: AtomicBool,
}

impl PipelineMetrics {
    /// Create a fresh metrics instance.
    #[must_use]
    pub fn new() -> Self {
        Self { healthy: AtomicBool::new(true), ..Self::default() }
    }

    /// Mark the pipeline unhealthy.
    pub fn set_unhealthy(&self) {
        self.healthy.store(false, Ordering::Relaxed);
    }

    /// Get a consistent snapshot of the current counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            batch_messages: self.batch_messages.load(Ordering::Relaxed),
            paused_total: *self.paused_total.lock(),
            pause_events: self.pause_events.load(Ordering::Relaxed),
            healthy: self.healthy.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSink for PipelineMetrics {
    fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    fn record_batch(&self, messages: usize, _duration: Duration) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.batch_messages.fetch_add(messages as u64, Ordering::Relaxed);
    }

    fn record_paused(&self, duration: Duration) {
        *self.paused_total.lock() += duration;
        self.pause_events.fetch_add(1, Ordering::Relaxed);
    }

    fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of [`PipelineMetrics`].
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub duplicates: u64,
    pub retries: u64,
    pub dead_lettered: u64,
    pub batches: u64,
    pub batch_messages: u64,
    pub paused_total: Duration,
    pub pause_events: usize,
    pub healthy: bool,
}

impl MetricsSnapshot {
    /// Average messages per dispatched batch.
    #[must_use]
    pub fn avg_batch_size(&self) -> f64 {
        if self.batches > 0 {
            self.batch_messages as f64 / self.batches as f64
        } else {
            0.0
        }
    }
}
