//! Guard configuration types.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use weir_core::{Error, Result};

/// Configuration for the front-pressure guard around outbound sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,

    /// Time the circuit stays open before admitting a half-open trial
    pub reset_timeout: Duration,

    /// Hard timeout applied to each individual send attempt
    pub send_timeout: Duration,

    /// Maximum send attempts per publish (first try included)
    pub max_attempts: u32,

    /// Initial transport-retry backoff delay
    pub backoff_base: Duration,

    /// Maximum transport-retry backoff delay
    pub backoff_max: Duration,
}

impl GuardConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns an error if any field is out of its accepted range.
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::configuration("failure_threshold must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(Error::configuration("max_attempts must be at least 1"));
        }
        if self.send_timeout.is_zero() {
            return Err(Error::configuration("send_timeout must be non-zero"));
        }
        if self.backoff_max < self.backoff_base {
            return Err(Error::configuration("backoff_max must be >= backoff_base"));
        }
        Ok(())
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(10),
            max_attempts: 3,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
        }
    }
}
