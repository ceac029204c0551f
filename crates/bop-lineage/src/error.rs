use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::LineageId;

/// Failures reported by a [`LineageMaster`](crate::LineageMaster).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LineageError {
    #[error("lineage {0} does not exist")]
    LineageDoesNotExist(LineageId),
    #[error("lineage {0} has children and cascade was not requested")]
    LineageDeletion(LineageId),
    #[error("file {0} does not exist")]
    FileDoesNotExist(String),
    #[error("file {0} already exists")]
    FileAlreadyExists(String),
    #[error("file {0} is already complete")]
    FileAlreadyCompleted(String),
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl LineageError {
    /// Wire classification; `None` for I/O failures, which travel separately.
    pub fn kind(&self) -> Option<ServiceErrorKind> {
        let kind = match self {
            LineageError::LineageDoesNotExist(_) => ServiceErrorKind::LineageDoesNotExist,
            LineageError::LineageDeletion(_) => ServiceErrorKind::LineageDeletion,
            LineageError::FileDoesNotExist(_) => ServiceErrorKind::FileDoesNotExist,
            LineageError::FileAlreadyExists(_) => ServiceErrorKind::FileAlreadyExists,
            LineageError::FileAlreadyCompleted(_) => ServiceErrorKind::FileAlreadyCompleted,
            LineageError::InvalidPath { .. } => ServiceErrorKind::InvalidPath,
            LineageError::InvalidArgument(_) => ServiceErrorKind::InvalidArgument,
            LineageError::Io(_) => return None,
        };
        Some(kind)
    }
}

impl From<io::Error> for LineageError {
    fn from(value: io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

/// Error classes a lineage service client can tell apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceErrorKind {
    LineageDoesNotExist,
    LineageDeletion,
    FileDoesNotExist,
    FileAlreadyExists,
    FileAlreadyCompleted,
    InvalidPath,
    InvalidArgument,
}

impl ServiceErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceErrorKind::LineageDoesNotExist => "lineage_does_not_exist",
            ServiceErrorKind::LineageDeletion => "lineage_deletion",
            ServiceErrorKind::FileDoesNotExist => "file_does_not_exist",
            ServiceErrorKind::FileAlreadyExists => "file_already_exists",
            ServiceErrorKind::FileAlreadyCompleted => "file_already_completed",
            ServiceErrorKind::InvalidPath => "invalid_path",
            ServiceErrorKind::InvalidArgument => "invalid_argument",
        }
    }
}

impl fmt::Display for ServiceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error as returned by the lineage service.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceError {
    #[error("I/O error: {message}")]
    Io { message: String },
    #[error("[{kind}] {message}")]
    Lineage {
        kind: ServiceErrorKind,
        message: String,
    },
}

impl From<LineageError> for ServiceError {
    fn from(value: LineageError) -> Self {
        match value.kind() {
            Some(kind) => ServiceError::Lineage {
                kind,
                message: value.to_string(),
            },
            None => ServiceError::Io {
                message: match value {
                    LineageError::Io(message) => message,
                    other => other.to_string(),
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_translate_one_to_one() {
        let err = ServiceError::from(LineageError::LineageDoesNotExist(LineageId::new(9)));
        assert_eq!(
            err,
            ServiceError::Lineage {
                kind: ServiceErrorKind::LineageDoesNotExist,
                message: "lineage 9 does not exist".to_string(),
            }
        );

        let err = ServiceError::from(LineageError::Io("disk gone".to_string()));
        assert_eq!(
            err,
            ServiceError::Io {
                message: "disk gone".to_string()
            }
        );
    }

    #[test]
    fn service_error_wire_shape() {
        let err = ServiceError::Lineage {
            kind: ServiceErrorKind::InvalidPath,
            message: "bad".to_string(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "lineage");
        assert_eq!(json["kind"], "invalid_path");
        assert_eq!(err.to_string(), "[invalid_path] bad");
    }
}
