//! Error types for the filestore core

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for filestore operations
pub type FilestoreResult<T = ()> = Result<T, FilestoreError>;

/// Machine-readable error classification.
///
/// Every error that crosses a component boundary carries exactly one of these
/// kinds; external adapters map them to transport status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidPath,
    InvalidRequest,
    InvalidChecksum,
    ChecksumMismatch,
    BackendNotFound,
    ExecutorNotFound,
    NodeNotFound,
    ParentNotFound,
    NodeExists,
    NotADirectory,
    NotAFile,
    ChildrenExist,
    IdempotencyConflict,
    MissingScope,
    NotSupported,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            Self::InvalidPath => "INVALID_PATH",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::InvalidChecksum => "INVALID_CHECKSUM",
            Self::ChecksumMismatch => "CHECKSUM_MISMATCH",
            Self::BackendNotFound => "BACKEND_NOT_FOUND",
            Self::ExecutorNotFound => "EXECUTOR_NOT_FOUND",
            Self::NodeNotFound => "NODE_NOT_FOUND",
            Self::ParentNotFound => "PARENT_NOT_FOUND",
            Self::NodeExists => "NODE_EXISTS",
            Self::NotADirectory => "NOT_A_DIRECTORY",
            Self::NotAFile => "NOT_A_FILE",
            Self::ChildrenExist => "CHILDREN_EXIST",
            Self::IdempotencyConflict => "IDEMPOTENCY_CONFLICT",
            Self::MissingScope => "MISSING_SCOPE",
            Self::NotSupported => "NOT_SUPPORTED",
            Self::Internal => "INTERNAL",
        };
        write!(f, "{code}")
    }
}

/// Error carried through the command pipeline and reconciliation engine.
///
/// Never a bare string: the kind is always one of the enumerated codes, and
/// `details` holds whatever structured context the failure site attached.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct FilestoreError {
    kind: ErrorKind,
    message: String,
    details: serde_json::Value,
}

impl FilestoreError {
    pub fn new<T: fmt::Display>(kind: ErrorKind, message: T) -> Self {
        Self {
            kind,
            message: message.to_string(),
            details: serde_json::Value::Null,
        }
    }

    /// Attach a structured details payload
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> &serde_json::Value {
        &self.details
    }

    /// JSON projection stored in journal rows and job records
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "code": self.kind,
            "message": self.message,
            "details": self.details,
        })
    }

    pub fn invalid_path<T: fmt::Display>(message: T) -> Self {
        Self::new(ErrorKind::InvalidPath, message)
    }

    pub fn invalid_request<T: fmt::Display>(message: T) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn invalid_checksum<T: fmt::Display>(message: T) -> Self {
        Self::new(ErrorKind::InvalidChecksum, message)
    }

    pub fn checksum_mismatch<T: fmt::Display>(message: T) -> Self {
        Self::new(ErrorKind::ChecksumMismatch, message)
    }

    pub fn backend_not_found<T: fmt::Display>(message: T) -> Self {
        Self::new(ErrorKind::BackendNotFound, message)
    }

    pub fn executor_not_found<T: fmt::Display>(message: T) -> Self {
        Self::new(ErrorKind::ExecutorNotFound, message)
    }

    pub fn node_not_found<T: fmt::Display>(message: T) -> Self {
        Self::new(ErrorKind::NodeNotFound, message)
    }

    pub fn parent_not_found<T: fmt::Display>(message: T) -> Self {
        Self::new(ErrorKind::ParentNotFound, message)
    }

    pub fn node_exists<T: fmt::Display>(message: T) -> Self {
        Self::new(ErrorKind::NodeExists, message)
    }

    pub fn not_a_directory<T: fmt::Display>(message: T) -> Self {
        Self::new(ErrorKind::NotADirectory, message)
    }

    pub fn not_a_file<T: fmt::Display>(message: T) -> Self {
        Self::new(ErrorKind::NotAFile, message)
    }

    pub fn children_exist<T: fmt::Display>(message: T) -> Self {
        Self::new(ErrorKind::ChildrenExist, message)
    }

    pub fn idempotency_conflict<T: fmt::Display>(message: T) -> Self {
        Self::new(ErrorKind::IdempotencyConflict, message)
    }

    pub fn missing_scope<T: fmt::Display>(message: T) -> Self {
        Self::new(ErrorKind::MissingScope, message)
    }

    pub fn not_supported<T: fmt::Display>(message: T) -> Self {
        Self::new(ErrorKind::NotSupported, message)
    }

    pub fn internal<T: fmt::Display>(message: T) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Whether callers may safely retry the command that produced this error
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::Internal)
    }
}

impl From<sea_orm::DbErr> for FilestoreError {
    fn from(err: sea_orm::DbErr) -> Self {
        Self::internal(format!("database error: {err}"))
    }
}

impl From<std::io::Error> for FilestoreError {
    fn from(err: std::io::Error) -> Self {
        Self::internal(format!("i/o error: {err}"))
    }
}

impl From<serde_json::Error> for FilestoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("serialization error: {err}"))
    }
}
