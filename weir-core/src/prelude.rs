//! Common imports for convenient usage.

pub use crate::error::{Error, ErrorClass, HandlerError, Result};
pub use crate::message::{Message, MessageBuilder, MessageId};
pub use crate::metrics::{MetricsSnapshot, PipelineMetrics};
pub use crate::traits::{BrokerTransport, DeadLetterSink, MessageHandler, MetricsSink};
pub use crate::types::{Offset, PartitionId, Timestamp};
