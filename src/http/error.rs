//! Error-to-response mapping.
//!
//! Validation, not-found and authorization failures surface as 4xx with
//! the structured error body; infrastructure failures are logged in
//! full and surface as an opaque 500.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::AppError;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "Request failed");
        }

        let body = Json(serde_json::json!({
            "status": "error",
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}
