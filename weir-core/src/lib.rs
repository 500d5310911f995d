//! # Weir Core
//!
//! Core library for the Weir consumption engine: the message model, error
//! taxonomy, traits for external collaborators, and pipeline
//! metrics.
//!
//! The consumption pipeline itself lives in `weir-consumer`; outbound-send
//! protection lives in `weir-publisher`. This crate holds everything both
//! sides agree on:
//!
//! - [`message`]: immutable message records and builders
//! - [`types`]: partition/offset newtypes and timestamps
//! - [`error`]: pipeline errors and the handler failure taxonomy
//! - [`traits`]: interfaces for the broker transport, dead-letter sink,
//!   metrics sink, and user handler
//! - [`metrics`]: process-wide atomic pipeline counters

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod message;
pub mod metrics;
pub mod prelude;
pub mod traits;
pub mod types;

pub use crate::{
    error::{Error, ErrorClass, HandlerError, Result},
    message::{Message, MessageBuilder, MessageId},
    metrics::{MetricsSnapshot, PipelineMetrics},
    traits::{BrokerTransport, DeadLetterSink, MessageHandler, MetricsSink},
    types::{Offset, PartitionId, Timestamp},
};
