use crate::db::DbError;
use crate::services::api_keys::AuthError;
use crate::services::directory::DirectoryError;
use crate::services::dispatcher::DispatchError;
use crate::services::model_registry::RegistryError;
use crate::services::session_authority::SessionError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use infermesh_common::{ErrorBody, ErrorKind};
use thiserror::Error;

/// API error types
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("{1}")]
    Classified(ErrorKind, String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::Classified(ErrorKind::BadRequest, message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::Classified(ErrorKind::NotFound, message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Classified(kind, _) => *kind,
            ApiError::Database(_) | ApiError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        let kind = match &e {
            RegistryError::NotFound(_) => ErrorKind::NotFound,
            RegistryError::StageMismatch { .. } => ErrorKind::StageMismatch,
            RegistryError::AlreadyExists(_) | RegistryError::InUse(_) => ErrorKind::Conflict,
            RegistryError::InvalidVersion(_) => ErrorKind::BadRequest,
            RegistryError::Unavailable => ErrorKind::Unavailable,
            RegistryError::Storage(_) => ErrorKind::Internal,
        };
        match e {
            RegistryError::Storage(db) => ApiError::Database(db),
            other => ApiError::Classified(kind, other.to_string()),
        }
    }
}

impl From<DirectoryError> for ApiError {
    fn from(e: DirectoryError) -> Self {
        let kind = match &e {
            DirectoryError::NotFound(_) => ErrorKind::NotFound,
            DirectoryError::InvalidHeartbeat(_) => ErrorKind::BadRequest,
            DirectoryError::Busy | DirectoryError::Unavailable => ErrorKind::Unavailable,
        };
        ApiError::Classified(kind, e.to_string())
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        let kind = match &e {
            SessionError::Unavailable => ErrorKind::Unavailable,
            _ => ErrorKind::InvalidSession,
        };
        ApiError::Classified(kind, e.to_string())
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::Registry(e) => e.into(),
            DispatchError::Session(e) => e.into(),
            DispatchError::NoAvailableWorker(_) | DispatchError::ColdStart(_) => {
                ApiError::Classified(ErrorKind::NoAvailableWorker, e.to_string())
            }
            DispatchError::Unavailable => {
                ApiError::Classified(ErrorKind::Unavailable, e.to_string())
            }
            DispatchError::DeadlineExceeded(_) => {
                ApiError::Classified(ErrorKind::DeadlineExceeded, e.to_string())
            }
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        let kind = match &e {
            AuthError::MissingKey
            | AuthError::InvalidKey
            | AuthError::Expired
            | AuthError::Revoked => ErrorKind::Unauthorized,
            AuthError::Forbidden(_) => ErrorKind::Forbidden,
            AuthError::RateLimited(_) => ErrorKind::RateLimited,
            AuthError::NotFound(_) => ErrorKind::NotFound,
            AuthError::Invalid(_) => ErrorKind::BadRequest,
            AuthError::Unavailable => ErrorKind::Unavailable,
            AuthError::Storage(_) => ErrorKind::Internal,
        };
        match e {
            AuthError::Storage(db) => ApiError::Database(db),
            other => ApiError::Classified(kind, other.to_string()),
        }
    }
}

/// Convert ApiError into HTTP response
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match self {
            ApiError::Classified(kind, message) => ErrorBody::new(kind, message),
            ApiError::Database(e) => {
                tracing::error!(error = %e, "Database error");
                ErrorBody::new(ErrorKind::Internal, "Internal server error")
            }
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                ErrorBody::new(ErrorKind::Internal, msg)
            }
        };

        let status = StatusCode::from_u16(body.kind.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
