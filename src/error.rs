//! Error types for the editor-service client.
//!
//! Every fallible operation in the crate returns [`ServiceError`]. The
//! lifecycle manager is the only layer that turns these into state
//! transitions and user notifications; nothing below it swallows them.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while driving the dprint daemon.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// No live daemon process when an operation required one.
    #[error("Daemon process unavailable: {0}")]
    ProcessUnavailable(String),

    /// Sentinel mismatch or malformed frame. The stream is out of sync.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The active protocol version cannot perform the operation.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    /// A bounded wait elapsed without an answer.
    #[error("{operation} timed out after {}ms", .after.as_millis())]
    Timeout {
        /// Operation that was waiting
        operation: &'static str,
        /// The bound that was exceeded
        after: Duration,
    },

    /// Schema version undetectable or unsupported, or a bad path.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// I/O error on the daemon's pipes.
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

impl ServiceError {
    /// Build a `Timeout` error.
    pub fn timeout(operation: &'static str, after: Duration) -> Self {
        ServiceError::Timeout { operation, after }
    }

    /// Whether this error means the daemon should be restarted.
    pub fn is_health_signal(&self) -> bool {
        matches!(
            self,
            ServiceError::Timeout { .. }
                | ServiceError::ProtocolViolation(_)
                | ServiceError::ProcessUnavailable(_)
        )
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset => {
                ServiceError::ProcessUnavailable(err.to_string())
            }
            _ => ServiceError::Io(err),
        }
    }
}
