use anyhow::Context;
use remit::config::Config;
use remit::housekeeping;
use remit::queue::EmailQueueStore;
use remit::template::TemplateRenderer;
use remit::transport::SmtpTransport;
use remit::worker::{build_smtp_settings, Worker};
use remit::{init_tracing, shutdown_signal};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Arc::new(Config::from_env());
    init_tracing(&config);

    let queue = Arc::new(
        EmailQueueStore::connect(
            &config.database_url,
            config.db_min_connections,
            config.db_max_connections,
            config.db_lease_timeout,
        )
        .await
        .context("failed to connect to database")?,
    );
    queue.migrate().await.context("failed to run migrations")?;

    let transport = Arc::new(SmtpTransport::new(build_smtp_settings(&config)));
    let template = Arc::new(
        TemplateRenderer::new(&config.template_dir).context("failed to initialize templates")?,
    );

    let shutdown = CancellationToken::new();

    let worker = Arc::new(Worker::new(
        queue.clone(),
        transport,
        template,
        config.clone(),
        shutdown.clone(),
    ));
    worker.start().await?;
    let worker_handle = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await })
    };

    housekeeping::spawn(
        queue.clone(),
        config.retention_days,
        config.cleanup_interval,
        shutdown.clone(),
    );

    shutdown_signal(shutdown.clone()).await;
    info!("received shutdown signal, stopping worker");
    shutdown.cancel();

    let _ = worker_handle.await;

    Ok(())
}
