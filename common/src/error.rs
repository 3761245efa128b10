//! Error kinds shared by every component and the body they travel in.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classified failure reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    StageMismatch,
    NoAvailableWorker,
    InvalidSession,
    ModelNotLoaded,
    SchemaMismatch,
    ExecutionError,
    DeadlineExceeded,
    Unavailable,
    BadRequest,
    Unauthorized,
    Forbidden,
    Conflict,
    RateLimited,
    Internal,
}

/// What a client should do after an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryHint {
    /// Retry against the same worker with the same credential.
    SameAssignment,
    /// Obtain a fresh assignment, then retry.
    NewAssignment,
    /// Retrying will not help.
    Abort,
}

impl ErrorKind {
    pub fn retry_hint(&self) -> RetryHint {
        match self {
            ErrorKind::Unavailable | ErrorKind::RateLimited => RetryHint::SameAssignment,
            ErrorKind::NoAvailableWorker
            | ErrorKind::InvalidSession
            | ErrorKind::ModelNotLoaded
            | ErrorKind::DeadlineExceeded => RetryHint::NewAssignment,
            ErrorKind::NotFound
            | ErrorKind::StageMismatch
            | ErrorKind::SchemaMismatch
            | ErrorKind::ExecutionError
            | ErrorKind::BadRequest
            | ErrorKind::Unauthorized
            | ErrorKind::Forbidden
            | ErrorKind::Conflict
            | ErrorKind::Internal => RetryHint::Abort,
        }
    }

    /// HTTP status the kind is served with.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::StageMismatch => 409,
            ErrorKind::NoAvailableWorker => 503,
            ErrorKind::InvalidSession => 401,
            ErrorKind::ModelNotLoaded => 409,
            ErrorKind::SchemaMismatch => 400,
            ErrorKind::ExecutionError => 500,
            ErrorKind::DeadlineExceeded => 504,
            ErrorKind::Unavailable => 503,
            ErrorKind::BadRequest => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::Conflict => 409,
            ErrorKind::RateLimited => 429,
            ErrorKind::Internal => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::StageMismatch => "stage_mismatch",
            ErrorKind::NoAvailableWorker => "no_available_worker",
            ErrorKind::InvalidSession => "invalid_session",
            ErrorKind::ModelNotLoaded => "model_not_loaded",
            ErrorKind::SchemaMismatch => "schema_mismatch",
            ErrorKind::ExecutionError => "execution_error",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Conflict => "conflict",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error body returned by every endpoint: `{ "success": false, "kind", "message" }`.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ErrorBody {
    #[serde(default)]
    pub success: bool,
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            kind,
            message: message.into(),
        }
    }

    pub fn retry_hint(&self) -> RetryHint {
        self.kind.retry_hint()
    }
}
