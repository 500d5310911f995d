//! # Weir Consumer
//!
//! Pressure-aware, ordering-preserving consumption pipeline for a
//! partitioned log broker.
//!
//! The pipeline ingests a continuous stream of partitioned messages,
//! batches them for throughput, preserves per-key ordering under parallel
//! processing, deduplicates redeliveries, throttles intake when downstream
//! processing lags, and routes permanently-failing messages to a
//! dead-letter sink, using local state only.
//!
//! Data flow: broker → intake → idempotency filter → key-grouped batch
//! aggregator → backpressure gate → concurrency-limited dispatch → user
//! handler → commit, with failures routed to retry or the DLQ.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use weir_consumer::{ConsumerConfig, ConsumerEngine};
//! use weir_core::{BrokerTransport, DeadLetterSink, MessageHandler, PipelineMetrics};
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     transport: Arc<dyn BrokerTransport>,
//! #     handler: Arc<dyn MessageHandler>,
//! #     dlq: Arc<dyn DeadLetterSink>,
//! # ) -> weir_core::Result<()> {
//! let metrics = Arc::new(PipelineMetrics::new());
//! let engine = ConsumerEngine::new(
//!     ConsumerConfig::default(),
//!     transport,
//!     handler,
//!     dlq,
//!     metrics,
//! )?;
//!
//! let handle = engine.start();
//! // ... application runs ...
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]

pub mod aggregator;
pub mod backpressure;
pub mod config;
pub mod dedup;
pub mod dispatcher;
pub mod engine;
pub mod offset;
pub mod registry;
pub mod retry;

pub use aggregator::{Batch, BatchAggregator, GroupKey, KeyGroup};
pub use backpressure::{BackpressureController, MemoryMonitor, MemoryProbe};
pub use config::{
    BackpressureConfig, BatchConfig, ConsumerConfig, DedupConfig, MemoryPressureConfig,
    PartitionAssignment, RetryConfig,
};
pub use dedup::{IdempotencyFilter, KeyExtractor, IDEMPOTENCY_HEADER};
pub use dispatcher::{BatchOutcome, Dispatcher, GroupOutcome};
pub use engine::{ConsumerEngine, EngineHandle};
pub use registry::HandlerRegistry;
pub use retry::{FailureRouter, RetryClassifier, RouteOutcome};
pub use weir_core::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{
        ConsumerConfig, ConsumerEngine, EngineHandle, HandlerRegistry, PartitionAssignment,
    };
    pub use weir_core::prelude::*;
}
