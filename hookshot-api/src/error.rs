use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hookshot_common::capture::ErrorEnvelope;
use hookshot_common::store::StoreError;
use hookshot_worker::error::DispatchError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ErrorResponse {
    pub error: String,
}

/// Errors a handler can answer with.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Payload too large")]
    PayloadTooLarge,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    StoreError(#[from] StoreError),
    #[error("dispatch error: {0}")]
    DispatchError(DispatchError),
}

impl From<DispatchError> for ApiError {
    fn from(error: DispatchError) -> Self {
        match error {
            DispatchError::EventNotFound(_)
            | DispatchError::DestinationNotFound(_)
            | DispatchError::DeliveryNotFound(_) => ApiError::NotFound(error.to_string()),
            DispatchError::NotRetryable { .. } | DispatchError::Conflict(_) => {
                ApiError::Conflict(error.to_string())
            }
            DispatchError::StoreError(error) => ApiError::StoreError(error),
            other => ApiError::DispatchError(other),
        }
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::StoreError(_) | ApiError::DispatchError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Server errors carry an `ErrorEnvelope` in the response extensions for `capture_errors`.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ErrorResponse {
            error: self.to_string(),
        });

        if !status.is_server_error() {
            return (status, body).into_response();
        }

        error!("internal error: {}", self);
        let envelope = match &self {
            ApiError::StoreError(error) => ErrorEnvelope::from_error(error),
            ApiError::DispatchError(error) => ErrorEnvelope::from_error(error),
            other => ErrorEnvelope::from_error(other),
        };

        let mut response = (status, body).into_response();
        drop(response.extensions_mut().insert(envelope));
        response
    }
}
