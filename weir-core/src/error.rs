//! Error types for the Weir core library.

use thiserror::Error;

/// Main error type for Weir pipeline operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Invalid message format or content
    #[error("Invalid message: {message}")]
    InvalidMessage { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Broker or sink transport failures
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Outbound circuit breaker is open; the send was rejected without a network call
    #[error("Circuit open for destination '{destination}'")]
    CircuitOpen { destination: String },

    /// Dead-letter publish failed after exhausting transport retries
    #[error("Dead-letter publish failed: {message}")]
    DeadLetter { message: String },

    /// Graceful shutdown expired with work still in flight
    #[error("Shutdown timed out with {pending} message(s) not yet terminal")]
    ShutdownTimeout { pending: usize },

    /// Internal system errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Result type alias for Weir operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for a transport error with the given message.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }

    /// Shorthand for a configuration error with the given message.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal { message: err.to_string() }
    }
}

/// Classification of a handler failure, driving the retry/DLQ decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network/timeout-shaped failures; retried with backoff.
    Transient,
    /// Malformed or rejected payloads; never retried, routed straight to the DLQ.
    Validation,
    /// Unclassified failures; retried up to the configured limit, then DLQ'd.
    Unknown,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Validation => write!(f, "validation"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Error raised by a user-supplied message handler.
///
/// The class determines routing: transient and unknown errors are eligible
/// for retry, validation errors go to the dead-letter sink on first failure.
#[derive(Error, Debug, Clone)]
#[error("{class} handler error: {message}")]
pub struct HandlerError {
    /// Failure classification
    pub class: ErrorClass,
    /// Human-readable failure description, carried into DLQ headers
    pub message: String,
}

impl HandlerError {
    /// A transient failure (network, timeout, overloaded dependency).
    pub fn transient(message: impl Into<String>) -> Self {
        Self { class: ErrorClass::Transient, message: message.into() }
    }

    /// A validation failure (malformed payload, contract violation).
    pub fn validation(message: impl Into<String>) -> Self {
        Self { class: ErrorClass::Validation, message: message.into() }
    }

    /// An unclassified failure.
    pub fn unknown(message: impl Into<String>) -> Self {
        Self { class: ErrorClass::Unknown, message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_constructors() {
        assert_eq!(HandlerError::transient("timeout").class, ErrorClass::Transient);
        assert_eq!(HandlerError::validation("bad json").class, ErrorClass::Validation);
        assert_eq!(HandlerError::unknown("boom").class, ErrorClass::Unknown);
    }

    #[test]
    fn test_error_display() {
        let err = Error::CircuitOpen { destination: "dlq".to_string() };
        assert_eq!(err.to_string(), "Circuit open for destination 'dlq'");

        let err = HandlerError::validation("missing field");
        assert_eq!(err.to_string(), "validation handler error: missing field");
    }
}
