//! Backpressure controller.
//!
//! Observes in-flight key groups against the configured concurrency
//! capacity and gates intake through a watch channel. Pause and resume use
//! separate thresholds (hysteresis) so the gate does not flap around a
//! single boundary. All pause/resume decisions happen under one mutex; no
//! two execution contexts ever decide independently.

use crate::config::{BackpressureConfig, MemoryPressureConfig};
use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use weir_core::MetricsSink;

/// Smoothing factor for the batch-latency moving average.
const EWMA_ALPHA: f64 = 0.2;

/// Step applied per adaptive threshold adjustment.
const THRESHOLD_STEP: f64 = 0.05;

/// Bounds the adaptive tuner may move the pause threshold within.
const MIN_THRESHOLD: f64 = 0.50;
const MAX_THRESHOLD: f64 = 0.90;

#[derive(Debug)]
struct ControlState {
    /// In-flight key groups
    active: usize,
    paused: bool,
    /// Memory-critical override; pauses regardless of the ratio
    forced: bool,
    paused_since: Option<Instant>,
    /// Moving average of per-batch processing latency, in milliseconds
    ewma_ms: Option<f64>,
}

/// Pause/resume decision core for the intake gate.
pub struct BackpressureController {
    capacity: usize,
    resume_factor: f64,
    adaptive: bool,
    target: Duration,
    /// Current pause threshold; written only under the state lock
    threshold: AtomicCell<f64>,
    state: Mutex<ControlState>,
    pause_tx: watch::Sender<bool>,
    metrics: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for BackpressureController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BackpressureController")
            .field("capacity", &self.capacity)
            .field("active", &state.active)
            .field("paused", &state.paused)
            .field("threshold", &self.threshold.load())
            .finish()
    }
}

impl BackpressureController {
    /// Create a controller and the pause-gate receiver for the intake task.
    #[must_use]
    pub fn new(
        config: &BackpressureConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> (Arc<Self>, watch::Receiver<bool>) {
        let (pause_tx, pause_rx) = watch::channel(false);
        let controller = Arc::new(Self {
            capacity: config.max_concurrency,
            resume_factor: config.resume_factor,
            adaptive: config.adaptive,
            target: config.target_batch_latency,
            threshold: AtomicCell::new(config.pause_threshold),
            state: Mutex::new(ControlState {
                active: 0,
                paused: false,
                forced: false,
                paused_since: None,
                ewma_ms: None,
            }),
            pause_tx,
            metrics,
        });
        (controller, pause_rx)
    }

    /// A key group entered processing.
    pub fn group_started(&self) {
        let mut state = self.state.lock();
        state.active += 1;
        self.evaluate(&mut state);
    }

    /// A key group finished processing.
    pub fn group_completed(&self, duration: Duration) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        debug!(active = state.active, ?duration, "key group completed");
        self.evaluate(&mut state);
    }

    /// A batch finished dispatch; feeds the adaptive threshold tuner.
    pub fn observe_batch(&self, duration: Duration) {
        if !self.adaptive {
            return;
        }
        let mut state = self.state.lock();
        let sample_ms = duration.as_secs_f64() * 1000.0;
        let ewma = match state.ewma_ms {
            Some(prev) => prev.mul_add(1.0 - EWMA_ALPHA, sample_ms * EWMA_ALPHA),
            None => sample_ms,
        };
        state.ewma_ms = Some(ewma);

        let target_ms = self.target.as_secs_f64() * 1000.0;
        let current = self.threshold.load();
        let adjusted = if ewma > target_ms * 1.5 {
            (current - THRESHOLD_STEP).max(MIN_THRESHOLD)
        } else if ewma < target_ms * 0.5 {
            (current + THRESHOLD_STEP).min(MAX_THRESHOLD)
        } else {
            current
        };

        if (adjusted - current).abs() > f64::EPSILON {
            self.threshold.store(adjusted);
            debug!(ewma_ms = ewma, threshold = adjusted, "pause threshold adjusted");
            self.evaluate(&mut state);
        }
    }

    /// Set or clear the memory-critical pause override.
    pub fn force_pause(&self, forced: bool) {
        let mut state = self.state.lock();
        if state.forced != forced {
            state.forced = forced;
            self.evaluate(&mut state);
        }
    }

    /// Whether intake is currently paused. Metrics/diagnostics only.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// In-flight key groups. Metrics/diagnostics only.
    #[must_use]
    pub fn active_units(&self) -> usize {
        self.state.lock().active
    }

    /// Current pause threshold.
    #[must_use]
    pub fn current_threshold(&self) -> f64 {
        self.threshold.load()
    }

    /// The single pause/resume decision point.
    fn evaluate(&self, state: &mut ControlState) {
        let ratio = state.active as f64 / self.capacity as f64;

        if state.paused {
            let resume_at = self.threshold.load() * self.resume_factor;
            if !state.forced && ratio <= resume_at {
                state.paused = false;
                if let Some(since) = state.paused_since.take() {
                    self.metrics.record_paused(since.elapsed());
                }
                let _ = self.pause_tx.send(false);
                info!(ratio, "intake resumed");
            }
        } else if state.forced || ratio >= self.threshold.load() {
            state.paused = true;
            state.paused_since = Some(Instant::now());
            let _ = self.pause_tx.send(true);
            info!(ratio, forced = state.forced, threshold = self.threshold.load(), "intake paused");
        }
    }
}

/// Samples process memory for the `BackpressureController`.
///
/// Returns resident set size in bytes, or `None` when unavailable.
pub type MemoryProbe = Arc<dyn Fn() -> Option<u64> + Send + Sync>;

/// Default probe: resident pages from `/proc/self/statm`.
#[must_use]
pub fn default_memory_probe() -> MemoryProbe {
    Arc::new(|| {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(resident_pages * 4096)
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemoryLevel {
    Normal,
    Warning,
    Critical,
}

/// Periodic memory watermark monitor.
///
/// Above the critical watermark intake is force-paused regardless of the
/// in-flight ratio; above the warning watermark batch sizes are halved for
/// subsequently opened batches. Recovery restores both.
pub struct MemoryMonitor {
    config: MemoryPressureConfig,
    probe: MemoryProbe,
    controller: Arc<BackpressureController>,
    size_multiplier: Arc<AtomicCell<f64>>,
    level: MemoryLevel,
}

impl MemoryMonitor {
    /// Create a monitor feeding the given controller and aggregator handle.
    #[must_use]
    pub fn new(
        config: MemoryPressureConfig,
        probe: MemoryProbe,
        controller: Arc<BackpressureController>,
        size_multiplier: Arc<AtomicCell<f64>>,
    ) -> Self {
        Self { config, probe, controller, size_multiplier, level: MemoryLevel::Normal }
    }

    /// Whether any watermark is configured.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.config.warning_bytes.is_some() || self.config.critical_bytes.is_some()
    }

    /// Run the sampling loop until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.sample_interval) => self.sample(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                },
            }
        }
    }

    /// Take one sample and apply watermark transitions.
    pub fn sample(&mut self) {
        let Some(rss) = (self.probe)() else {
            return;
        };

        let level = if self.config.critical_bytes.is_some_and(|limit| rss >= limit) {
            MemoryLevel::Critical
        } else if self.config.warning_bytes.is_some_and(|limit| rss >= limit) {
            MemoryLevel::Warning
        } else {
            MemoryLevel::Normal
        };

        if level == self.level {
            return;
        }

        match level {
            MemoryLevel::Critical => {
                warn!(rss, "memory above critical watermark, forcing intake pause");
                self.size_multiplier.store(0.5);
                self.controller.force_pause(true);
            },
            MemoryLevel::Warning => {
                warn!(rss, "memory above warning watermark, shrinking batches");
                self.size_multiplier.store(0.5);
                self.controller.force_pause(false);
            },
            MemoryLevel::Normal => {
                info!(rss, "memory pressure cleared");
                self.size_multiplier.store(1.0);
                self.controller.force_pause(false);
            },
        }
        self.level = level;
    }
}
