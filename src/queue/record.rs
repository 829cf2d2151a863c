use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category of an outgoing email. Unknown values arriving from the wire
/// (an unrecognised `template_id`) coerce to `Transactional` rather than
/// being rejected — see `EmailType::coerce`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "email_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EmailType {
    Transactional,
    BookingCreated,
    BookingCancelled,
    BookingRescheduled,
    Reminder24h,
    Reminder1h,
    ReminderCustom,
    OtpVerification,
}

impl EmailType {
    /// Parses a template/type identifier, coercing anything unrecognised
    /// to `Transactional` per spec.md §6.2 / §3.
    pub fn coerce(raw: &str) -> Self {
        match raw {
            "booking_created" => EmailType::BookingCreated,
            "booking_cancelled" => EmailType::BookingCancelled,
            "booking_rescheduled" => EmailType::BookingRescheduled,
            "reminder_24h" => EmailType::Reminder24h,
            "reminder_1h" => EmailType::Reminder1h,
            "reminder_custom" => EmailType::ReminderCustom,
            "otp_verification" => EmailType::OtpVerification,
            "transactional" => EmailType::Transactional,
            _ => EmailType::Transactional,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EmailType::Transactional => "transactional",
            EmailType::BookingCreated => "booking_created",
            EmailType::BookingCancelled => "booking_cancelled",
            EmailType::BookingRescheduled => "booking_rescheduled",
            EmailType::Reminder24h => "reminder_24h",
            EmailType::Reminder1h => "reminder_1h",
            EmailType::ReminderCustom => "reminder_custom",
            EmailType::OtpVerification => "otp_verification",
        }
    }
}

/// Status DAG of spec.md §3: `pending|scheduled -> processing ->
/// {sent, scheduled, failed}`. `sent` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "email_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EmailStatus {
    Pending,
    Scheduled,
    Processing,
    Sent,
    Failed,
}

impl EmailStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailStatus::Pending => "pending",
            EmailStatus::Scheduled => "scheduled",
            EmailStatus::Processing => "processing",
            EmailStatus::Sent => "sent",
            EmailStatus::Failed => "failed",
        }
    }
}

/// One row of the `email_queue` table — one (recipient, logical message)
/// pair, per spec.md §3.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmailRecord {
    pub id: i64,
    pub email_type: EmailType,
    pub recipient_email: String,
    pub recipient_name: Option<String>,
    pub subject: String,
    pub body_html: String,
    pub body_text: Option<String>,
    pub status: EmailStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub scheduled_for: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub priority: i32,
    pub booking_id: Option<i64>,
    pub template_context: Option<sqlx::types::Json<serde_json::Value>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EmailRecord {
    pub fn template_context_value(&self) -> Option<&serde_json::Value> {
        self.template_context.as_ref().map(|json| &json.0)
    }
}

/// Per-status counts returned by `EmailQueueStore::stats`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub scheduled: i64,
    pub processing: i64,
    pub sent: i64,
    pub failed: i64,
}
