use crate::api::error::ApiError;
use crate::api::ApiState;
use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use aws_lc_rs::constant_time::verify_slices_are_equal;

/// Authenticates `X-API-Key` against the configured key using a
/// constant-time comparison (spec.md §4.6). A no-op (always authorized)
/// extractor when `API_KEY` is empty — matches the "empty disables auth"
/// contract of spec.md §6.5.
pub struct ApiKeyAuth;

impl<S> FromRequestParts<S> for ApiKeyAuth
where
    S: Send + Sync,
    ApiState: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let api_state = ApiState::from_ref(state);
        if api_state.config.api_key.is_empty() {
            return Ok(ApiKeyAuth);
        }

        let Some(header) = parts.headers.get("X-API-Key") else {
            return Err(ApiError::MissingApiKey);
        };
        let Ok(provided) = header.to_str() else {
            return Err(ApiError::InvalidApiKey);
        };

        let expected = api_state.config.api_key.as_bytes();
        if provided.len() == expected.len()
            && verify_slices_are_equal(provided.as_bytes(), expected).is_ok()
        {
            Ok(ApiKeyAuth)
        } else {
            Err(ApiError::InvalidApiKey)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn constant_time_compare_accepts_matching_key() {
        assert!(verify_slices_are_equal(b"secret", b"secret").is_ok());
    }

    #[test]
    fn constant_time_compare_rejects_mismatch() {
        assert!(verify_slices_are_equal(b"secret", b"wrong!").is_err());
    }
}
