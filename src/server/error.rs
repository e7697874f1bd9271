use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

use crate::models::ModelError;
use crate::naming::NameError;
use crate::operations::{OperationError, Status};
use crate::storage::CacheError;
use crate::toolchain::CompileError;

/// Errors of synchronous requests. Rendered as a [`Status`] body.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unprocessable(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.status_code();
        if code.is_server_error() {
            error!(error = %self, "Request failed");
        }
        let body = Status::new(
            code.as_u16(),
            code.canonical_reason().unwrap_or("Error"),
            self.to_string(),
        );
        (code, Json(body)).into_response()
    }
}

impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::NotFound(what) => ApiError::NotFound(format!("{what} not found")),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

// An id that does not parse cannot name anything that exists.
impl From<NameError> for ApiError {
    fn from(err: NameError) -> Self {
        ApiError::NotFound(err.to_string())
    }
}

impl From<ModelError> for ApiError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::Compile(CompileError::Rejected(diagnostic)) => ApiError::BadRequest(diagnostic),
            ModelError::Compile(e @ CompileError::Unavailable(_)) => ApiError::Internal(e.to_string()),
            ModelError::Cache(e) => e.into(),
            ModelError::Worker(e) => ApiError::BadRequest(e.report()),
        }
    }
}

impl From<OperationError> for ApiError {
    fn from(err: OperationError) -> Self {
        match err {
            OperationError::Cache(e) => e.into(),
            OperationError::Fingerprint(e) => ApiError::Internal(e.to_string()),
            other => ApiError::Unprocessable(other.to_string()),
        }
    }
}
