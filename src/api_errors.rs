use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::errors::HermesError;
use crate::object_store::StorageError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    PayloadTooLarge(String),
    #[error("{0}")]
    Internal(String),
}

/// Message of an error response, carried in the response extensions so the
/// instrumentation boundary can record it on the request's trace.
#[derive(Debug, Clone)]
pub struct ErrorMessage(pub String);

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn payload_too_large() -> Self {
        Self::PayloadTooLarge("payload too large".to_string())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrBody {
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = self.status();
        let msg = self.to_string();
        let mut response = (code, Json(ErrBody { error: msg.clone() })).into_response();
        response.extensions_mut().insert(ErrorMessage(msg));
        response
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::BucketNotFound { .. } => AppError::not_found("bucket not found"),
            StorageError::ObjectNotFound { .. } => AppError::not_found("object not found"),
            StorageError::InvalidKey { key } => AppError::bad_request(format!("invalid key: {key}")),
            StorageError::SameObject { .. } => {
                AppError::bad_request("source and destination are the same object")
            }
            other => {
                tracing::error!(error = %other, "storage operation failed");
                AppError::internal("storage operation failed")
            }
        }
    }
}

// Server-side failures are logged here and answered generically.
impl From<HermesError> for AppError {
    fn from(err: HermesError) -> Self {
        match err {
            HermesError::NotFound { resource, .. } => AppError::NotFound(format!("{resource} not found")),
            HermesError::Storage(inner) => inner.into(),
            other => {
                tracing::error!(error = %other, "request failed");
                AppError::internal("internal error")
            }
        }
    }
}
