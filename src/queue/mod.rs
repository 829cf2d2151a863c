//! Persistent queue store: all SQL for the email_queue table lives here.
//! See spec.md §4.2 / §6.3 for the operation contract.

mod record;

pub use record::{EmailRecord, EmailStatus, EmailType, QueueStats};

use crate::error::ServiceError;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

const LAST_ERROR_MAX_LEN: usize = 500;

fn truncate_error(message: &str) -> String {
    if message.chars().count() <= LAST_ERROR_MAX_LEN {
        message.to_string()
    } else {
        message.chars().take(LAST_ERROR_MAX_LEN).collect()
    }
}

/// Retries a fallible connection-pool operation up to `attempts` times,
/// but only for errors that look like a dropped/transient connection —
/// constraint violations and other `sqlx::Error::Database` causes fail
/// fast. Mirrors the "decorator pattern applies bounded retry to
/// transient connection errors; non-connection errors fail fast" rule of
/// spec.md §4.2.
async fn with_db_retry<T, F, Fut>(attempts: u32, mut op: F) -> Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut last_err = None;
    for attempt in 0..attempts.max(1) {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 < attempts && is_retryable_connection_error(&err) => {
                warn!("transient queue store error (attempt {attempt}): {err}, retrying");
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.expect("attempts >= 1 guarantees at least one iteration ran"))
}

fn is_retryable_connection_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
    )
}

#[derive(Debug, Clone)]
pub struct EmailQueueStore {
    pool: PgPool,
    /// A `processing` row whose `updated_at` is older than this is treated
    /// as an orphaned lease and becomes eligible again (spec.md §4.2).
    lease_timeout: Duration,
}

impl EmailQueueStore {
    /// Builds a bounded connection pool (`min_connections`/`max_connections`,
    /// defaults 1/10 per spec.md §4.2) with `test_before_acquire` enabled —
    /// sqlx's own liveness probe before a connection is handed to a caller,
    /// which is the idiomatic way to express the "trivial liveness probe
    /// before handing out a connection" requirement without hand-rolling
    /// a `SELECT 1` loop around the pool.
    pub async fn connect(
        database_url: &str,
        min_connections: u32,
        max_connections: u32,
        lease_timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let pool = PgPoolOptions::new()
            .min_connections(min_connections)
            .max_connections(max_connections)
            .test_before_acquire(true)
            .connect(database_url)
            .await
            .map_err(|err| ServiceError::Config(format!("could not connect to database: {err}")))?;

        Ok(Self { pool, lease_timeout })
    }

    pub fn from_pool(pool: PgPool, lease_timeout: Duration) -> Self {
        Self { pool, lease_timeout }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs pending migrations. Used by the `migrate` binary and by tests
    /// that spin up a throwaway database.
    pub async fn migrate(&self) -> Result<(), ServiceError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| ServiceError::queue(err.to_string()))?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn enqueue(
        &self,
        email_type: EmailType,
        recipient_email: &str,
        recipient_name: Option<&str>,
        subject: &str,
        body_html: &str,
        body_text: Option<&str>,
        booking_id: Option<i64>,
        template_context: Option<&Value>,
        scheduled_for: DateTime<Utc>,
        priority: i32,
    ) -> Result<i64, ServiceError> {
        let context_json = template_context.map(sqlx::types::Json);

        let id = with_db_retry(2, || async {
            sqlx::query_scalar!(
                r#"
                INSERT INTO email_queue (
                    email_type, recipient_email, recipient_name, subject,
                    body_html, body_text, booking_id, template_context,
                    scheduled_for, priority
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                RETURNING id
                "#,
                email_type as EmailType,
                recipient_email,
                recipient_name,
                subject,
                body_html,
                body_text,
                booking_id,
                context_json as _,
                scheduled_for,
                priority,
            )
            .fetch_one(&self.pool)
            .await
        })
        .await?;

        Ok(id)
    }

    /// Leases up to `limit` eligible rows in a single round trip: a
    /// `SELECT ... FOR UPDATE SKIP LOCKED` against the eligibility
    /// predicate (with the stale-lease sweep folded in, per spec.md
    /// §4.2's explicit allowance), piped into an `UPDATE ... RETURNING`
    /// that flips status to `processing` in the same statement. Two
    /// concurrent leasers can never return overlapping row sets.
    pub async fn lease(&self, limit: i64) -> Result<Vec<EmailRecord>, ServiceError> {
        let limit = limit.clamp(1, 1000);
        let lease_timeout_secs = self.lease_timeout.as_secs() as f64;

        let rows = with_db_retry(2, || async {
            sqlx::query_as!(
                EmailRecord,
                r#"
                WITH eligible AS (
                    SELECT id
                    FROM email_queue
                    WHERE (
                        status IN ('pending', 'scheduled')
                        AND scheduled_for <= now()
                        AND (next_retry_at IS NULL OR next_retry_at <= now())
                    )
                    OR (
                        status = 'processing'
                        AND updated_at < now() - make_interval(secs => $2)
                    )
                    ORDER BY priority ASC, created_at ASC, id ASC
                    LIMIT $1
                    FOR UPDATE SKIP LOCKED
                )
                UPDATE email_queue
                SET status = 'processing', updated_at = now()
                FROM eligible
                WHERE email_queue.id = eligible.id
                RETURNING
                    email_queue.id,
                    email_queue.email_type AS "email_type: EmailType",
                    email_queue.recipient_email,
                    email_queue.recipient_name,
                    email_queue.subject,
                    email_queue.body_html,
                    email_queue.body_text,
                    email_queue.status AS "status: EmailStatus",
                    email_queue.retry_count,
                    email_queue.max_retries,
                    email_queue.last_error,
                    email_queue.next_retry_at,
                    email_queue.scheduled_for,
                    email_queue.sent_at,
                    email_queue.priority,
                    email_queue.booking_id,
                    email_queue.template_context AS "template_context: sqlx::types::Json<serde_json::Value>",
                    email_queue.created_at,
                    email_queue.updated_at
                "#,
                limit,
                lease_timeout_secs,
            )
            .fetch_all(&self.pool)
            .await
        })
        .await?;

        debug!(leased = rows.len(), "leased batch from email queue");
        Ok(rows)
    }

    pub async fn mark_sent(&self, id: i64, sent_at: DateTime<Utc>) -> Result<(), ServiceError> {
        with_db_retry(2, || async {
            sqlx::query!(
                r#"
                UPDATE email_queue
                SET status = 'sent', sent_at = $2, updated_at = now()
                WHERE id = $1
                "#,
                id,
                sent_at,
            )
            .execute(&self.pool)
            .await
        })
        .await
        .map_err(|err| ServiceError::queue_for(id, err.to_string()))?;

        Ok(())
    }

    pub async fn mark_failed(&self, id: i64, error: &str) -> Result<(), ServiceError> {
        let error = truncate_error(error);

        with_db_retry(2, || async {
            sqlx::query!(
                r#"
                UPDATE email_queue
                SET status = 'failed', last_error = $2, updated_at = now()
                WHERE id = $1
                "#,
                id,
                error,
            )
            .execute(&self.pool)
            .await
        })
        .await
        .map_err(|err| ServiceError::queue_for(id, err.to_string()))?;

        Ok(())
    }

    /// Schedules a retry: bumps `retry_count`, sets `next_retry_at = now()
    /// + backoff_seconds`, and flips status back to `scheduled`. If the
    /// row has already exhausted `max_retries`, this falls back to
    /// `mark_failed` instead — defence for invariant 2 (`retry_count <=
    /// max_retries` always) regardless of what the caller believed.
    pub async fn schedule_retry(
        &self,
        id: i64,
        error: &str,
        backoff_seconds: i64,
    ) -> Result<(), ServiceError> {
        let error_truncated = truncate_error(error);

        let updated = with_db_retry(2, || async {
            sqlx::query!(
                r#"
                UPDATE email_queue
                SET status = 'scheduled',
                    retry_count = retry_count + 1,
                    last_error = $2,
                    next_retry_at = now() + make_interval(secs => $3),
                    updated_at = now()
                WHERE id = $1 AND retry_count < max_retries
                "#,
                id,
                error_truncated,
                backoff_seconds as f64,
            )
            .execute(&self.pool)
            .await
        })
        .await
        .map_err(|err| ServiceError::queue_for(id, err.to_string()))?;

        if updated.rows_affected() == 0 {
            self.mark_failed(id, error).await?;
        }

        Ok(())
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<EmailRecord>, ServiceError> {
        let row = with_db_retry(2, || async {
            sqlx::query_as!(
                EmailRecord,
                r#"
                SELECT
                    id,
                    email_type AS "email_type: EmailType",
                    recipient_email,
                    recipient_name,
                    subject,
                    body_html,
                    body_text,
                    status AS "status: EmailStatus",
                    retry_count,
                    max_retries,
                    last_error,
                    next_retry_at,
                    scheduled_for,
                    sent_at,
                    priority,
                    booking_id,
                    template_context AS "template_context: sqlx::types::Json<serde_json::Value>",
                    created_at,
                    updated_at
                FROM email_queue
                WHERE id = $1
                "#,
                id,
            )
            .fetch_optional(&self.pool)
            .await
        })
        .await
        .map_err(|err| ServiceError::queue_for(id, err.to_string()))?;

        Ok(row)
    }

    pub async fn stats(&self) -> Result<QueueStats, ServiceError> {
        let rows = with_db_retry(2, || async {
            sqlx::query!(
                r#"
                SELECT status AS "status: EmailStatus", COUNT(*) AS "count!"
                FROM email_queue
                GROUP BY status
                "#
            )
            .fetch_all(&self.pool)
            .await
        })
        .await
        .map_err(|err| ServiceError::queue(err.to_string()))?;

        let mut stats = QueueStats::default();
        for row in rows {
            match row.status {
                EmailStatus::Pending => stats.pending = row.count,
                EmailStatus::Scheduled => stats.scheduled = row.count,
                EmailStatus::Processing => stats.processing = row.count,
                EmailStatus::Sent => stats.sent = row.count,
                EmailStatus::Failed => stats.failed = row.count,
            }
        }
        Ok(stats)
    }

    /// Deletes terminal (`sent`/`failed`) rows older than `retention_days`,
    /// returning how many were removed.
    pub async fn cleanup(&self, retention_days: i64) -> Result<u64, ServiceError> {
        let result = with_db_retry(2, || async {
            sqlx::query!(
                r#"
                DELETE FROM email_queue
                WHERE status IN ('sent', 'failed')
                  AND updated_at < now() - make_interval(days => $1::int)
                "#,
                retention_days as i32,
            )
            .execute(&self.pool)
            .await
        })
        .await
        .map_err(|err| ServiceError::queue(err.to_string()))?;

        Ok(result.rows_affected())
    }

    pub async fn health_check(&self) -> bool {
        sqlx::query_scalar!("SELECT 1 AS \"ok!\"")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sqlx::PgPool;

    fn sample_context() -> Value {
        serde_json::json!({ "name": "Jordan" })
    }

    #[sqlx::test]
    async fn enqueue_then_get_by_id_round_trips(pool: PgPool) {
        let store = EmailQueueStore::from_pool(pool, Duration::from_secs(600));

        let id = store
            .enqueue(
                EmailType::Transactional,
                "a@x.io",
                None,
                "Hi",
                "<p>hi</p>",
                None,
                None,
                None,
                Utc::now(),
                5,
            )
            .await
            .unwrap();

        let row = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(row.status, EmailStatus::Pending);
        assert_eq!(row.recipient_email, "a@x.io");
    }

    #[sqlx::test]
    async fn lease_transitions_status_and_is_idempotent_within_window(pool: PgPool) {
        let store = EmailQueueStore::from_pool(pool, Duration::from_secs(600));

        store
            .enqueue(
                EmailType::Transactional,
                "a@x.io",
                None,
                "Hi",
                "<p>hi</p>",
                None,
                None,
                Some(&sample_context()),
                Utc::now(),
                5,
            )
            .await
            .unwrap();

        let leased = store.lease(10).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].status, EmailStatus::Processing);

        // Already processing and fresh: not eligible again.
        let leased_again = store.lease(10).await.unwrap();
        assert!(leased_again.is_empty());
    }

    #[sqlx::test]
    async fn concurrent_leases_never_overlap(pool: PgPool) {
        let store = EmailQueueStore::from_pool(pool.clone(), Duration::from_secs(600));
        for i in 0..20 {
            store
                .enqueue(
                    EmailType::Transactional,
                    &format!("user{i}@x.io"),
                    None,
                    "Hi",
                    "<p>hi</p>",
                    None,
                    None,
                    None,
                    Utc::now(),
                    5,
                )
                .await
                .unwrap();
        }

        let store_a = store.clone();
        let store_b = store.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { store_a.lease(10).await.unwrap() }),
            tokio::spawn(async move { store_b.lease(10).await.unwrap() }),
        );
        let a = a.unwrap();
        let b = b.unwrap();

        let ids_a: std::collections::HashSet<_> = a.iter().map(|r| r.id).collect();
        let ids_b: std::collections::HashSet<_> = b.iter().map(|r| r.id).collect();
        assert!(ids_a.is_disjoint(&ids_b));
        assert_eq!(ids_a.len() + ids_b.len(), 20);
    }

    #[sqlx::test]
    async fn schedule_retry_increments_and_sets_next_retry_at(pool: PgPool) {
        let store = EmailQueueStore::from_pool(pool, Duration::from_secs(600));

        let id = store
            .enqueue(
                EmailType::Transactional,
                "a@x.io",
                None,
                "Hi",
                "<p>hi</p>",
                None,
                None,
                None,
                Utc::now(),
                5,
            )
            .await
            .unwrap();
        store.lease(10).await.unwrap();

        store.schedule_retry(id, "connection refused", 300).await.unwrap();

        let row = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(row.status, EmailStatus::Scheduled);
        assert_eq!(row.retry_count, 1);
        assert!(row.next_retry_at.is_some());
    }

    #[sqlx::test]
    async fn schedule_retry_forces_failed_once_max_retries_exhausted(pool: PgPool) {
        let store = EmailQueueStore::from_pool(pool, Duration::from_secs(600));

        let id = store
            .enqueue(
                EmailType::Transactional,
                "a@x.io",
                None,
                "Hi",
                "<p>hi</p>",
                None,
                None,
                None,
                Utc::now(),
                5,
            )
            .await
            .unwrap();

        for _ in 0..3 {
            store.lease(10).await.unwrap();
            store.schedule_retry(id, "timeout", 0).await.unwrap();
        }

        let row = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(row.retry_count, 3);
        assert_eq!(row.status, EmailStatus::Scheduled);

        store.lease(10).await.unwrap();
        store.schedule_retry(id, "timeout again", 0).await.unwrap();

        let row = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(row.status, EmailStatus::Failed);
        assert_eq!(row.retry_count, 3);
    }

    #[sqlx::test]
    async fn mark_sent_is_terminal(pool: PgPool) {
        let store = EmailQueueStore::from_pool(pool, Duration::from_secs(600));

        let id = store
            .enqueue(
                EmailType::Transactional,
                "a@x.io",
                None,
                "Hi",
                "<p>hi</p>",
                None,
                None,
                None,
                Utc::now(),
                5,
            )
            .await
            .unwrap();
        store.lease(10).await.unwrap();
        let now = Utc::now();
        store.mark_sent(id, now).await.unwrap();

        let row = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(row.status, EmailStatus::Sent);
        assert!(row.sent_at.is_some());
    }

    #[sqlx::test]
    async fn stats_counts_by_status(pool: PgPool) {
        let store = EmailQueueStore::from_pool(pool, Duration::from_secs(600));
        store
            .enqueue(
                EmailType::Transactional,
                "a@x.io",
                None,
                "Hi",
                "<p>hi</p>",
                None,
                None,
                None,
                Utc::now(),
                5,
            )
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.sent, 0);
    }

    #[sqlx::test]
    async fn health_check_succeeds_against_live_pool(pool: PgPool) {
        let store = EmailQueueStore::from_pool(pool, Duration::from_secs(600));
        assert!(store.health_check().await);
    }

    #[sqlx::test]
    async fn cleanup_deletes_only_terminal_rows_past_retention(pool: PgPool) {
        let store = EmailQueueStore::from_pool(pool, Duration::from_secs(600));

        let sent_id = store
            .enqueue(
                EmailType::Transactional,
                "old-sent@x.io",
                None,
                "Hi",
                "<p>hi</p>",
                None,
                None,
                None,
                Utc::now(),
                5,
            )
            .await
            .unwrap();
        store.lease(10).await.unwrap();
        store.mark_sent(sent_id, Utc::now()).await.unwrap();
        sqlx::query!(
            "UPDATE email_queue SET updated_at = now() - interval '100 days' WHERE id = $1",
            sent_id
        )
        .execute(store.pool())
        .await
        .unwrap();

        let pending_id = store
            .enqueue(
                EmailType::Transactional,
                "still-pending@x.io",
                None,
                "Hi",
                "<p>hi</p>",
                None,
                None,
                None,
                Utc::now(),
                5,
            )
            .await
            .unwrap();
        sqlx::query!(
            "UPDATE email_queue SET updated_at = now() - interval '100 days' WHERE id = $1",
            pending_id
        )
        .execute(store.pool())
        .await
        .unwrap();

        let deleted = store.cleanup(90).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_by_id(sent_id).await.unwrap().is_none());
        assert!(store.get_by_id(pending_id).await.unwrap().is_some());
    }
}
