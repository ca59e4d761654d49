//! HTTP error mapping.
//!
//! Error responses carry a status code and an empty body; details are only
//! logged server-side.

use crate::error::StoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// The append id does not advance the stream.
    #[error("conflict: {0}")]
    Conflict(StoreError),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { .. } => ApiError::Conflict(err),
            StoreError::InvalidId(message) => ApiError::BadRequest(message),
            other => {
                tracing::error!(error = %other, "store failure");
                ApiError::Internal(other.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            ApiError::Conflict(err) => tracing::debug!(error = %err, "append rejected"),
            ApiError::BadRequest(message) => tracing::debug!(%message, "bad request"),
            ApiError::Internal(_) => {}
        }
        self.status().into_response()
    }
}
