//! Error types for Quarry
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.

use crate::types::Etag;
use std::io;
use thiserror::Error;

/// Result type alias for Quarry operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Quarry
#[derive(Debug, Error)]
pub enum Error {
    /// Mapped input used after its original was disposed or its region released
    #[error("Mapped input already disposed")]
    AlreadyDisposed,

    /// Single-byte read at the end of the input
    #[error("End of input at position {position}")]
    EndOfInput {
        /// Position of the failed read (equal to the input length)
        position: u64,
    },

    /// Block read asked for more bytes than remain
    #[error("Truncated read: requested {requested} bytes, {available} available")]
    TruncatedRead {
        /// Bytes requested by the caller
        requested: usize,
        /// Bytes remaining after the current position
        available: u64,
    },

    /// Seek outside `[0, length]`
    #[error("Invalid offset {offset} for input of length {length}")]
    InvalidOffset {
        /// Requested absolute offset
        offset: i64,
        /// Length of the input
        length: u64,
    },

    /// Transaction-bound data used after its transaction ended
    #[error("Transaction context is no longer active")]
    StaleContext,

    /// Map logic failed for one item
    #[error("Map failure in index '{index}' for '{document_id}' (etag {etag}): {message}")]
    Map {
        /// Index being built
        index: String,
        /// Identity of the failing item
        document_id: String,
        /// Change sequence of the failing item
        etag: Etag,
        /// Failure description
        message: String,
    },

    /// Schema migration step failed or is missing
    #[error("Schema upgrade {from} -> {to} failed: {message}")]
    Upgrade {
        /// Version before the step
        from: u32,
        /// Version the step targets
        to: u32,
        /// Failure description
        message: String,
    },

    /// Operation stopped by a cancellation request
    #[error("Operation cancelled")]
    Cancelled,

    /// I/O error (journal, segment files, config)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Invalid argument from the caller
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid operation or state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Named entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration file could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create an `InvalidInput` error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create an `InvalidOperation` error
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Error::InvalidOperation(msg.into())
    }

    /// Create a `Corruption` error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// Create a `NotFound` error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// True for errors raised by a mapped input whose region is gone.
    pub fn is_disposed(&self) -> bool {
        matches!(self, Error::AlreadyDisposed)
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_truncated_read() {
        let err = Error::TruncatedRead {
            requested: 8,
            available: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("Truncated read"));
        assert!(msg.contains('8'));
        assert!(msg.contains('3'));
    }

    #[test]
    fn test_error_display_map() {
        let err = Error::Map {
            index: "Users/ByName".to_string(),
            document_id: "users/1".to_string(),
            etag: 42,
            message: "missing field".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Users/ByName"));
        assert!(msg.contains("users/1"));
        assert!(msg.contains("42"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_error_from_msgpack() {
        let result: std::result::Result<String, rmp_serde::decode::Error> =
            rmp_serde::from_slice(&[0xC1]);
        let err: Error = result.unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_is_disposed() {
        assert!(Error::AlreadyDisposed.is_disposed());
        assert!(!Error::StaleContext.is_disposed());
    }
}
