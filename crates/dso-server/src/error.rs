//! The problem+json error boundary.
//!
//! Every handler returns `Result<_, AppError>`; this is the single place an
//! [`ApiError`] becomes an HTTP response.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use dso_error::ApiError;

/// Wrapper carrying the request URI for the `instance` field.
#[derive(Debug)]
pub struct AppError {
    pub error: ApiError,
    pub instance: Option<String>,
}

impl AppError {
    #[must_use]
    pub fn new(error: ApiError, instance: impl Into<String>) -> Self {
        Self {
            error,
            instance: Some(instance.into()),
        }
    }
}

impl From<ApiError> for AppError {
    fn from(error: ApiError) -> Self {
        Self {
            error,
            instance: None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.error.status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let problem = self.error.to_problem(self.instance.as_deref());

        (
            status,
            [(header::CONTENT_TYPE, "application/problem+json")],
            Json(problem),
        )
            .into_response()
    }
}
