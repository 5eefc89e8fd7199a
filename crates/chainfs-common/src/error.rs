//! Error types for ChainFS
//!
//! This module defines the error taxonomy shared by the transfer pipeline
//! and the data node.

use crate::types::BlockId;
use std::sync::Arc;
use thiserror::Error;

/// Common result type for ChainFS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for ChainFS
#[derive(Debug, Error)]
pub enum Error {
    // Integrity errors
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    // Transport errors
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("request timeout")]
    Timeout,

    // Protocol errors
    #[error("protocol error: {0}")]
    Protocol(String),

    // API misuse
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    // Transfer errors
    #[error("transfer of block {block_id} failed: {source}")]
    Transfer {
        block_id: BlockId,
        #[source]
        source: Arc<Error>,
    },

    #[error("all {attempts} replicas failed for block {block_id}, last: {last}")]
    ReplicasExhausted {
        block_id: BlockId,
        attempts: usize,
        #[source]
        last: Arc<Error>,
    },

    // Stream errors
    #[error("write to {path} aborted: {source}")]
    Aborted {
        path: String,
        #[source]
        source: Arc<Error>,
    },

    // Metadata errors
    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("block not found: {0}")]
    BlockNotFound(BlockId),

    #[error("metadata error: {0}")]
    Metadata(String),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an invalid operation error
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    /// Create a metadata error
    pub fn metadata(msg: impl Into<String>) -> Self {
        Self::Metadata(msg.into())
    }

    /// Wrap a stored worker error for the caller
    #[must_use]
    pub const fn transfer(block_id: BlockId, source: Arc<Self>) -> Self {
        Self::Transfer { block_id, source }
    }

    /// Map socket timeouts onto [`Error::Timeout`], everything else onto
    /// [`Error::Transport`]
    #[must_use]
    pub fn from_io(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Self::Timeout,
            _ => Self::Transport(err),
        }
    }

    /// Check if another replica could succeed where this attempt failed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_)
            | Self::Timeout
            | Self::ChecksumMismatch { .. }
            | Self::Protocol(_)
            | Self::BlockNotFound(_) => true,
            Self::Transfer { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Check if this error reports corrupted data
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        match self {
            Self::ChecksumMismatch { .. } => true,
            Self::Transfer { source, .. } | Self::Aborted { source, .. } => source.is_corruption(),
            Self::ReplicasExhausted { last, .. } => last.is_corruption(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::Timeout.is_retryable());
        assert!(Error::protocol("bad status").is_retryable());
        assert!(
            Error::ChecksumMismatch {
                expected: 1,
                actual: 2
            }
            .is_retryable()
        );
        assert!(!Error::invalid_operation("enqueue after last").is_retryable());
        assert!(!Error::FileNotFound("/a".into()).is_retryable());
    }

    #[test]
    fn test_transfer_wraps_cause() {
        let cause = Arc::new(Error::ChecksumMismatch {
            expected: 0xdead_beef,
            actual: 0,
        });
        let err = Error::transfer(BlockId::new(), Arc::clone(&cause));

        assert!(err.is_corruption());
        assert!(err.is_retryable());
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_from_io_maps_timeouts() {
        let timed_out = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(matches!(Error::from_io(timed_out), Error::Timeout));

        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "gone");
        assert!(matches!(Error::from_io(reset), Error::Transport(_)));
    }

    #[test]
    fn test_exhausted_keeps_last_cause() {
        let err = Error::ReplicasExhausted {
            block_id: BlockId::new(),
            attempts: 3,
            last: Arc::new(Error::ChecksumMismatch {
                expected: 1,
                actual: 2,
            }),
        };

        assert!(!err.is_retryable());
        assert!(err.is_corruption());
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("checksum mismatch"));
    }
}
