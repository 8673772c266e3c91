//! Common API error types and responses.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

/// Standard error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Human-readable error message naming the violation.
    pub error: String,
}

/// API error type that can be converted to a response.
///
/// A malformed request body gets the bare `[]` body clients of this API
/// have historically been handed; every other rejection carries an
/// `{"error": ...}` object.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub error: Option<String>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: Some(message.into()),
        }
    }

    /// Unparseable request body: `400` with an empty JSON array.
    pub fn malformed_body() -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: Some(message.into()),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: Some(message.into()),
        }
    }
}

impl From<imageforge_store::StoreError> for ApiError {
    fn from(err: imageforge_store::StoreError) -> Self {
        Self::internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        match self.error {
            Some(error) => (self.status, Json(ErrorResponse { error })).into_response(),
            None => (self.status, Json(Vec::<()>::new())).into_response(),
        }
    }
}
