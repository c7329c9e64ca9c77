//! Error types for repartir
//!
//! One crate-wide error enum covering the full failure taxonomy:
//! configuration validation, request shape validation, detectable
//! communication faults, and executor failures. Every error is fatal to the
//! distributed run; nothing is retried, because retrying a partially
//! executed multi-rank collective risks divergent rank state.

use thiserror::Error;

/// Result type alias using [`RepartirError`]
pub type Result<T> = std::result::Result<T, RepartirError>;

/// Errors that can occur while coordinating a distributed inference run
#[derive(Debug, Error)]
pub enum RepartirError {
    /// Static configuration is invalid (group size mismatch, indivisible
    /// layer or head counts). Always detected before any communication
    /// handle is created.
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Description of the constraint violation, with offending values
        reason: String,
    },

    /// Request-derived tensor shape exceeds capacity or is inconsistent.
    /// Detected before any output buffer is sized; buffers are allocated
    /// once to the worst case and never resized mid-call.
    #[error("invalid shape: {reason}")]
    InvalidShape {
        /// Description of the shape violation, with offending values
        reason: String,
    },

    /// A peer endpoint disconnected mid-collective. This is the detectable
    /// subset of communication failure; a peer that never reaches a
    /// collective blocks the remaining members indefinitely and is left to
    /// external process supervision.
    #[error("communication failure: {reason}")]
    CommFailure {
        /// Which channel operation failed and to/from which rank
        reason: String,
    },

    /// The model executor reported a device or numerical error. Fatal to
    /// the whole run on every rank.
    #[error("executor failure: {reason}")]
    ExecutorFailure {
        /// Executor-reported cause, propagated unmodified
        reason: String,
    },

    /// Reading request input or writing the report artifact failed
    #[error("io error: {reason}")]
    IoError {
        /// Underlying I/O failure description
        reason: String,
    },
}

impl From<std::io::Error> for RepartirError {
    fn from(err: std::io::Error) -> Self {
        RepartirError::IoError {
            reason: err.to_string(),
        }
    }
}
