// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication engine.
//!
//! Errors are categorized by where they occur and whether retrying can help.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Transport` | Yes | Connection refused, peer reset, stream dropped |
//! | `Journal` | Yes | Journal read failure (bounded retry, then stream failure) |
//! | `Protocol` | No | Malformed init, unknown stream id, invalid slice range |
//! | `OffsetStore` | No* | Offset read/write failure; busy errors retry locally |
//! | `Handler` | No | Application handler failed; restart re-reads the offset |
//! | `Consistency` | No | ProjectionId collision detected via version fencing |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Lifecycle state machine violation |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Propagation Policy
//!
//! Local recovery happens only where it cannot desynchronize the offset
//! (transport reconnect, journal re-read, SQLite busy retry). Everything
//! else unwinds to a stream restart, which re-grounds state from durable
//! storage. Use [`ReplicationError::is_retryable()`] to decide.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Transport-level failure on the replication stream.
    ///
    /// Recovered by reconnecting with backoff; never fatal.
    #[error("Transport error ({stream_id}): {message}")]
    Transport { stream_id: String, message: String },

    /// Protocol violation: malformed init, unknown stream id, invalid
    /// slice range, criteria cap exceeded.
    ///
    /// Fatal for the stream. The producer closes with a descriptive
    /// status; the consumer logs and reconnects after an operator-visible
    /// delay.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Journal read failure.
    ///
    /// Retried locally a bounded number of times, then propagated as a
    /// stream failure.
    #[error("Journal error: {0}")]
    Journal(String),

    /// Offset store failure.
    ///
    /// SQLite busy/locked errors are retried inside the store; anything
    /// that escapes needs attention.
    #[error("Offset store error: {0}")]
    OffsetStore(#[from] sqlx::Error),

    /// Application handler failed.
    ///
    /// Treated as a stream failure; the projection restarts and reloads
    /// the offset from the store. There is no poison-message auto-skip.
    #[error("Handler error: {0}")]
    Handler(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Two live projections share one ProjectionId.
    ///
    /// Detected by offset-row version fencing. Cannot be recovered safely;
    /// fix the deployment.
    #[error(
        "Offset version mismatch for projection {projection_id}: expected {expected}, found {found}"
    )]
    Consistency {
        projection_id: String,
        expected: i64,
        found: i64,
    },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lifecycle state machine violation (e.g. starting a running
    /// projection).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a transport error for a stream.
    pub fn transport(stream_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            stream_id: stream_id.into(),
            message: message.into(),
        }
    }

    /// Create a handler error from any error type.
    pub fn handler<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Handler(Box::new(source))
    }

    /// Check if the failed operation should be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Journal(_) => true,
            Self::Protocol(_) => false,
            Self::OffsetStore(_) => false, // busy retry already happened inside the store
            Self::Handler(_) => false,
            Self::Consistency { .. } => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn test_transport_is_retryable() {
        let err = ReplicationError::transport("cart", "connection reset");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("cart"));
    }

    #[test]
    fn test_journal_is_retryable() {
        let err = ReplicationError::Journal("read timed out".to_string());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_protocol_not_retryable() {
        let err = ReplicationError::Protocol("first message must be Init".to_string());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Init"));
    }

    #[test]
    fn test_handler_not_retryable() {
        let err = ReplicationError::handler(Boom);
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_consistency_not_retryable() {
        let err = ReplicationError::Consistency {
            projection_id: "cart-events-cart-0-255".to_string(),
            expected: 4,
            found: 7,
        };
        assert!(!err.is_retryable());
        let msg = err.to_string();
        assert!(msg.contains("cart-events-cart-0-255"));
        assert!(msg.contains('4'));
        assert!(msg.contains('7'));
    }

    #[test]
    fn test_invalid_state_formatting() {
        let err = ReplicationError::InvalidState {
            expected: "Created".to_string(),
            actual: "Running".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Created"));
        assert!(err.to_string().contains("Running"));
    }

    #[test]
    fn test_shutdown_not_retryable() {
        assert!(!ReplicationError::Shutdown.is_retryable());
    }
}
