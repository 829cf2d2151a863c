use crate::api::error::ApiError;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Request};
use axum::Json;
use garde::Validate;
use serde::de::DeserializeOwned;

/// Validates the deserialized body against its `garde::Validate` impl
/// before handing it to the handler — same `ValidatedJson` idiom the
/// teacher uses in `api/validation.rs`, retargeted at this taxonomy's
/// `ApiError`.
pub struct ValidatedJson<T>(pub T);

impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate,
    <T as Validate>::Context: Default,
    S: Send + Sync,
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|err| ApiError::Validation(err.to_string()))?;
        value
            .validate()
            .map_err(|report| ApiError::Validation(report.to_string()))?;
        Ok(ValidatedJson(value))
    }
}
