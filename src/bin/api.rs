use anyhow::Context;
use remit::api::ApiServer;
use remit::config::Config;
use remit::queue::EmailQueueStore;
use remit::{init_tracing, shutdown_signal};
use std::net::SocketAddr;
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

    let socket: SocketAddr = format!("{}:{}", config.api_host, config.api_port)
        .parse()
        .context("invalid API_HOST/API_PORT")?;

    let shutdown = CancellationToken::new();
    let api_server = ApiServer::new(socket, queue, config, shutdown.clone());
    api_server.spawn();

    shutdown_signal(shutdown.clone()).await;
    info!("received shutdown signal, stopping API server");
    shutdown.cancel();

    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    Ok(())
}
