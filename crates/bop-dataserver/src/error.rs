//! Error types and codes for the block write data path.
//!
//! Every stream failure is classified by an [`ErrorCode`] so responses, logs and
//! metrics agree on a stable identifier. [`WriteError`] is the stream-level
//! taxonomy; [`AllocationError`] is what a resource allocator reports back.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{BlockId, SessionId};

/// Error codes for the failure classes of a write stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Message sequence broke the write protocol.
    ProtocolViolation,
    /// Temp block creation or space reservation failed.
    AllocationFailure,
    /// Appending bytes to or closing the block sink failed.
    IoFailure,
    /// Stream was cancelled by the client or the connection.
    OperationCancelled,
    /// Packet writer task panicked.
    WorkerPanic,
    /// Writer pool or runtime has shut down.
    ServiceUnavailable,
    /// Configuration error
    ConfigurationError,
}

impl ErrorCode {
    /// Returns a string identifier for this error code.
    ///
    /// Useful for metrics, logging, and wire responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ProtocolViolation => "protocol_violation",
            ErrorCode::AllocationFailure => "allocation_failure",
            ErrorCode::IoFailure => "io_failure",
            ErrorCode::OperationCancelled => "operation_cancelled",
            ErrorCode::WorkerPanic => "worker_panic",
            ErrorCode::ServiceUnavailable => "service_unavailable",
            ErrorCode::ConfigurationError => "configuration_error",
        }
    }

    /// Returns a human-readable description of this error code.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::ProtocolViolation => "Write protocol violated",
            ErrorCode::AllocationFailure => "Temp block allocation failed",
            ErrorCode::IoFailure => "Block sink I/O failed",
            ErrorCode::OperationCancelled => "Write stream cancelled",
            ErrorCode::WorkerPanic => "Packet writer panicked",
            ErrorCode::ServiceUnavailable => "Write service is shut down",
            ErrorCode::ConfigurationError => "Configuration error",
        }
    }

    /// Whether a client may retry the whole stream after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::AllocationFailure | ErrorCode::IoFailure | ErrorCode::ServiceUnavailable
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Failures reported by a [`BlockAllocator`](crate::BlockAllocator).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AllocationError {
    #[error("temp block {block_id} of session {session_id} already exists")]
    AlreadyExists {
        session_id: SessionId,
        block_id: BlockId,
    },
    #[error("temp block {block_id} of session {session_id} not found")]
    NotFound {
        session_id: SessionId,
        block_id: BlockId,
    },
    #[error("unknown storage tier {0}")]
    UnknownTier(String),
    #[error("no space left: requested {requested} bytes, {available} available")]
    NoSpace { requested: u64, available: u64 },
    #[error("allocator I/O error: {0}")]
    Io(String),
}

impl From<io::Error> for AllocationError {
    fn from(value: io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

/// Stream-level error taxonomy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WriteError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("allocation failed: {0}")]
    Allocation(#[from] AllocationError),
    #[error("I/O fault: {0}")]
    Io(String),
    #[error("write stream cancelled")]
    Cancelled,
    #[error("packet writer panic: {0}")]
    Panic(String),
    #[error("writer pool is shut down")]
    PoolClosed,
}

impl WriteError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolViolation(message.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            WriteError::ProtocolViolation(_) => ErrorCode::ProtocolViolation,
            WriteError::Allocation(_) => ErrorCode::AllocationFailure,
            WriteError::Io(_) => ErrorCode::IoFailure,
            WriteError::Cancelled => ErrorCode::OperationCancelled,
            WriteError::Panic(_) => ErrorCode::WorkerPanic,
            WriteError::PoolClosed => ErrorCode::ServiceUnavailable,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, WriteError::Cancelled)
    }

    /// Structured cause carried by an error response.
    pub fn status(&self) -> ErrorStatus {
        ErrorStatus {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

impl From<io::Error> for WriteError {
    fn from(value: io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

/// Error code plus message, as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorStatus {
    pub code: ErrorCode,
    pub message: String,
}

impl fmt::Display for ErrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)
    }
}

/// Errors raised while validating or loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::ConfigurationError
    }
}
