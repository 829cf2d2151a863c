use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Never leaks driver/hostname/port/stack detail to the client — every
/// variant maps to a fixed, generic message; the real cause only ever
/// reaches `tracing::error!` (spec.md §4.6/§7).
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("API key required")]
    MissingApiKey,
    #[error("Invalid API key")]
    InvalidApiKey,
    #[error("rate limited")]
    RateLimited,
    #[error(transparent)]
    Service(#[from] crate::error::ServiceError),
    #[error("internal error")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    code: u16,
    timestamp: chrono::DateTime<Utc>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response<axum::body::Body> {
        error!("API error: {self}");

        let (status, error_kind, message): (StatusCode, &'static str, String) = match &self {
            ApiError::Validation(detail) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "validation_error", detail.clone())
            }
            ApiError::MissingApiKey => {
                (StatusCode::UNAUTHORIZED, "unauthorized", "API key required".to_string())
            }
            ApiError::InvalidApiKey => {
                (StatusCode::UNAUTHORIZED, "unauthorized", "Invalid API key".to_string())
            }
            ApiError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "Too many requests".to_string(),
            ),
            ApiError::Service(_) | ApiError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "An internal error occurred".to_string(),
            ),
        };

        let body = ErrorBody {
            error: error_kind,
            message,
            code: status.as_u16(),
            timestamp: Utc::now(),
        };

        let mut response = (status, Json(body)).into_response();
        if matches!(self, ApiError::RateLimited) {
            response
                .headers_mut()
                .insert("Retry-After", "60".parse().expect("static header value"));
        }
        response
    }
}
