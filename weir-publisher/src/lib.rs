//! # Weir Publisher
//!
//! Front-pressure protection for outbound sends in the Weir consumption
//! engine.
//!
//! This crate provides:
//! - A per-destination circuit breaker (closed → open → half-open)
//! - A guarded sender composing breaker admission, hard per-attempt
//!   timeouts, and bounded transport retries with exponential backoff
//!
//! The guard protects the broker and the dead-letter sink when they are
//! slow or unavailable: once a destination accumulates consecutive
//! failures the circuit opens and callers fail fast with
//! [`Error::CircuitOpen`](weir_core::Error::CircuitOpen) instead of
//! stacking network calls onto a degraded endpoint.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use weir_publisher::{GuardConfig, GuardedSender};
//! use weir_core::DeadLetterSink;
//! use bytes::Bytes;
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! # async fn example(sink: Arc<dyn DeadLetterSink>) -> weir_core::Result<()> {
//! let sender = GuardedSender::new("dead-letters", sink, GuardConfig::default())?;
//! sender.publish("dead-letters", Bytes::from("payload"), HashMap::new()).await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod breaker;
pub mod config;
pub mod sender;

pub use breaker::{BreakerState, CircuitBreaker};
pub use config::GuardConfig;
pub use sender::GuardedSender;
pub use weir_core::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{BreakerState, CircuitBreaker, GuardConfig, GuardedSender};
    pub use weir_core::prelude::*;
}
