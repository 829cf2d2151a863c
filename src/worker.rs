//! The delivery loop: poll -> render -> send -> finalize, with bounded
//! concurrency and cooperative shutdown. See spec.md §4.5.

use crate::config::Config;
use crate::error::ServiceError;
use crate::queue::{EmailQueueStore, EmailRecord};
use crate::template::TemplateRenderer;
use crate::transport::{SmtpSettings, SmtpTransport};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Default)]
pub struct WorkerStats {
    pub processed: AtomicU64,
    pub retried: AtomicU64,
    pub failed: AtomicU64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.processed.load(Ordering::Relaxed),
            self.retried.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }

    /// `processed / (processed + failed)`, per spec.md §4.5. `1.0` when
    /// nothing terminal has happened yet (avoids a spurious 0/0).
    pub fn success_rate(&self) -> f64 {
        let (processed, _retried, failed) = self.snapshot();
        let terminal = processed + failed;
        if terminal == 0 {
            1.0
        } else {
            processed as f64 / terminal as f64
        }
    }
}

pub struct Worker {
    queue: Arc<EmailQueueStore>,
    transport: Arc<SmtpTransport>,
    template: Arc<TemplateRenderer>,
    config: Arc<Config>,
    stats: Arc<WorkerStats>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        queue: Arc<EmailQueueStore>,
        transport: Arc<SmtpTransport>,
        template: Arc<TemplateRenderer>,
        config: Arc<Config>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            transport,
            template,
            config,
            stats: Arc::new(WorkerStats::default()),
            shutdown,
        }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    /// Validates SMTP config, verifies the transport, and logs a
    /// configuration summary — spec.md §4.5 step 1.
    pub async fn start(&self) -> Result<(), ServiceError> {
        self.config.validate_smtp()?;
        if !self.transport.validate().await {
            return Err(ServiceError::Config(
                "SMTP transport failed validation at startup".to_string(),
            ));
        }
        info!(
            poll_interval = ?self.config.worker_poll_interval,
            batch_size = self.config.worker_batch_size,
            concurrency = self.config.worker_concurrency,
            retry_max_attempts = self.config.retry_max_attempts,
            "worker starting"
        );
        Ok(())
    }

    /// The main poll loop: lease a batch, process every row under a
    /// bounded semaphore, wait for the batch, then an interruptible
    /// sleep. Runs until the cancellation token fires.
    pub async fn run(&self) {
        let semaphore = Arc::new(Semaphore::new(self.config.worker_concurrency));

        while !self.shutdown.is_cancelled() {
            match self.queue.lease(self.config.worker_batch_size).await {
                Ok(batch) if !batch.is_empty() => {
                    self.process_batch(batch, &semaphore).await;
                }
                Ok(_) => {}
                Err(err) => {
                    // Queue store connection failure: logged, loop continues
                    // into the next poll per spec.md §7. A single bad poll
                    // must not terminate the worker.
                    error!("lease failed, will retry next poll: {err}");
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.worker_poll_interval) => {}
            }
        }

        self.shutdown_sequence().await;
    }

    async fn process_batch(&self, batch: Vec<EmailRecord>, semaphore: &Arc<Semaphore>) {
        let mut handles = Vec::with_capacity(batch.len());
        for row in batch {
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
            let queue = self.queue.clone();
            let transport = self.transport.clone();
            let template = self.template.clone();
            let config = self.config.clone();
            let stats = self.stats.clone();

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                process_email(&queue, &transport, &template, &config, &stats, row).await;
            }));
        }

        // Exceptions are caught per-task (via JoinHandle's Result) and do
        // not abort the rest of the batch, per spec.md §4.5 step 2c.
        for handle in handles {
            if let Err(err) = handle.await {
                error!("a delivery task panicked: {err}");
            }
        }
    }

    /// Shutdown ordering matters: the transport is closed before the
    /// queue store, since the transport may hold a lock that indirectly
    /// references the store's connection pool (spec.md §4.5 step 3).
    async fn shutdown_sequence(&self) {
        let (processed, retried, failed) = self.stats.snapshot();
        info!(
            processed,
            retried,
            failed,
            success_rate = self.stats.success_rate(),
            "worker shutting down"
        );
        self.transport.close().await;
    }
}

/// Renders (if needed), sends, and finalises a single leased row —
/// spec.md §4.5 `_process_email`.
async fn process_email(
    queue: &EmailQueueStore,
    transport: &SmtpTransport,
    template: &TemplateRenderer,
    config: &Config,
    stats: &WorkerStats,
    row: EmailRecord,
) {
    let rendered = render_body(template, &row);
    let (body_html, body_text) = match rendered {
        Ok(bodies) => bodies,
        Err(err) => {
            // Template failures are always permanent: the row will not
            // self-heal by retrying the same broken context (spec.md §7).
            warn!(email_id = row.id, "template render failed: {err}");
            if let Err(finalize_err) = queue.mark_failed(row.id, &err.to_string()).await {
                error!(email_id = row.id, "could not mark failed after template error: {finalize_err}");
            }
            stats.failed.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    let send_result = transport
        .send(
            &row.recipient_email,
            row.recipient_name.as_deref(),
            &row.subject,
            &body_html,
            body_text.as_deref(),
        )
        .await;

    match send_result {
        Ok(()) => {
            if let Err(err) = queue.mark_sent(row.id, Utc::now()).await {
                error!(email_id = row.id, "could not mark sent: {err}");
                return;
            }
            stats.processed.fetch_add(1, Ordering::Relaxed);
        }
        Err(err) => finalize_failure(queue, config, stats, &row, err).await,
    }
}

async fn finalize_failure(
    queue: &EmailQueueStore,
    config: &Config,
    stats: &WorkerStats,
    row: &EmailRecord,
    err: ServiceError,
) {
    let should_retry = row.retry_count < row.max_retries || err.is_transient();
    let message = err.to_string();

    if should_retry {
        let backoff_seconds = config.retry_backoff.as_secs() as i64;
        if let Err(finalize_err) = queue.schedule_retry(row.id, &message, backoff_seconds).await {
            error!(email_id = row.id, "could not schedule retry: {finalize_err}");
            return;
        }
        stats.retried.fetch_add(1, Ordering::Relaxed);
    } else {
        if let Err(finalize_err) = queue.mark_failed(row.id, &message).await {
            error!(email_id = row.id, "could not mark failed: {finalize_err}");
            return;
        }
        stats.failed.fetch_add(1, Ordering::Relaxed);
    }
}

fn render_body(
    template: &TemplateRenderer,
    row: &EmailRecord,
) -> Result<(String, Option<String>), ServiceError> {
    match row.template_context_value() {
        Some(context) => {
            let html = template.render_html(row.email_type, context)?;
            let text = template.render_text(row.email_type, context)?;
            Ok((html, Some(text)))
        }
        None => Ok((row.body_html.clone(), row.body_text.clone())),
    }
}

pub fn build_smtp_settings(config: &Config) -> SmtpSettings {
    SmtpSettings {
        host: config.smtp_host.clone(),
        port: config.smtp_port,
        username: config.smtp_user.clone(),
        password: config.smtp_password.clone(),
        from_email: config.smtp_from_email.clone(),
        from_name: config.smtp_from_name.clone(),
        use_tls: config.smtp_use_tls,
        timeout: config.smtp_timeout,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn success_rate_is_one_before_any_terminal_outcome() {
        let stats = WorkerStats::default();
        assert_eq!(stats.success_rate(), 1.0);
    }

    #[test]
    fn success_rate_reflects_processed_vs_failed() {
        let stats = WorkerStats::default();
        stats.processed.store(3, Ordering::Relaxed);
        stats.failed.store(1, Ordering::Relaxed);
        assert_eq!(stats.success_rate(), 0.75);
    }
}
