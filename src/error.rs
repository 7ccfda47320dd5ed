//! Error types for dns-transmit

use std::time::Duration;
use thiserror::Error;

use crate::domain::DomainError;
use crate::packer::PackError;

/// Errors raised by a [`QueryExecutor`](crate::query::QueryExecutor) or while
/// parsing the TXT answer it returned.
#[derive(Debug, Error)]
pub enum QueryError {
    /// Socket level failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The resolver did not answer in time
    #[error("Query timed out after {0:?}")]
    Timeout(Duration),

    /// The answer could not be understood
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// Anything else the executor wants to report
    #[error("Query failed: {0}")]
    Other(String),
}

/// Errors surfaced by a transmission
#[derive(Debug, Error)]
pub enum TransmitError {
    /// A required attribute is missing, or carries a value outside its allowed set
    #[error("Unexpected server response: {key} = {}", .value.as_deref().unwrap_or("<missing>"))]
    UnexpectedServerResponse { key: String, value: Option<String> },

    /// The server answered `success=False`
    #[error("Server error: {}", .reason.as_deref().unwrap_or("no reason given"))]
    ServerErrorResponse { reason: Option<String> },

    /// Failure reported by the query layer
    #[error("Transport fault: {0}")]
    Transport(#[from] QueryError),

    /// The first chunk that failed during the transfer phase
    #[error("Chunk {sequence} failed: {source}")]
    ChunkFailed {
        sequence: u64,
        #[source]
        source: Box<TransmitError>,
    },

    /// Payload could not be packed into domains
    #[error("Packing error: {0}")]
    Pack(#[from] PackError),

    /// A domain built from server data or configuration is invalid
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// The transmission deadline expired
    #[error("Transmission timed out after {0:?}")]
    Timeout(Duration),

    /// The transmission was cancelled by the caller
    #[error("Transmission cancelled")]
    Cancelled,

    /// A session phase was invoked out of order
    #[error("Invalid session state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// A worker task panicked or was torn down by the runtime
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl TransmitError {
    pub(crate) fn missing(key: &str) -> Self {
        TransmitError::UnexpectedServerResponse {
            key: key.to_string(),
            value: None,
        }
    }

    pub(crate) fn unexpected(key: &str, value: impl Into<String>) -> Self {
        TransmitError::UnexpectedServerResponse {
            key: key.to_string(),
            value: Some(value.into()),
        }
    }
}

/// Result type alias using TransmitError.
pub type Result<T> = std::result::Result<T, TransmitError>;
