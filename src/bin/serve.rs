use anyhow::Context;
use remit::api::ApiServer;
use remit::config::Config;
use remit::housekeeping;
use remit::queue::EmailQueueStore;
use remit::template::TemplateRenderer;
use remit::transport::SmtpTransport;
use remit::worker::{build_smtp_settings, Worker};
use remit::{init_tracing, shutdown_signal};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Runs the ingress edge and the delivery worker in one process, the
/// small-deployment equivalent of the teacher's all-in-one `app` binary.
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

    let shutdown = CancellationToken::new();

    let socket: SocketAddr = format!("{}:{}", config.api_host, config.api_port)
        .parse()
        .context("invalid API_HOST/API_PORT")?;
    let api_server = ApiServer::new(socket, queue.clone(), config.clone(), shutdown.clone());
    api_server.spawn();

    if config.is_smtp_configured() {
        let transport = Arc::new(SmtpTransport::new(build_smtp_settings(&config)));
        let template = Arc::new(
            TemplateRenderer::new(&config.template_dir)
                .context("failed to initialize templates")?,
        );
        let worker = Arc::new(Worker::new(
            queue.clone(),
            transport,
            template,
            config.clone(),
            shutdown.clone(),
        ));
        worker.start().await?;
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await });
    } else {
        warn!("SMTP not configured, running ingress only; the delivery worker will not start");
    }

    housekeeping::spawn(
        queue.clone(),
        config.retention_days,
        config.cleanup_interval,
        shutdown.clone(),
    );

    shutdown_signal(shutdown.clone()).await;
    info!("received shutdown signal, stopping services");
    shutdown.cancel();

    tokio::time::sleep(Duration::from_secs(2)).await;

    Ok(())
}
