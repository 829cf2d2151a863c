//! Periodic deletion of old terminal rows (spec.md §3 Lifecycle), driven
//! the same way the teacher's `periodically::run_periodically` drives its
//! own maintenance tasks.

use crate::queue::EmailQueueStore;
use std::sync::Arc;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub fn spawn(
    queue: Arc<EmailQueueStore>,
    retention_days: i64,
    interval: std::time::Duration,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            select! {
                _ = shutdown.cancelled() => {
                    info!("housekeeping task cancelled");
                    return;
                }
                _ = tokio::time::sleep(interval) => {
                    match queue.cleanup(retention_days).await {
                        Ok(deleted) => {
                            if deleted > 0 {
                                info!(deleted, retention_days, "cleaned up old terminal email rows");
                            }
                        }
                        Err(err) => error!("housekeeping cleanup failed: {err}"),
                    }
                }
            }
        }
    });
}

/// Exposed for callers that want a one-shot run outside the periodic
/// driver (e.g. an operational CLI or a test).
pub async fn run_once(queue: &EmailQueueStore, retention_days: i64) -> Result<u64, crate::error::ServiceError> {
    queue.cleanup(retention_days).await
}
