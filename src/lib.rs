use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod api;
pub mod config;
pub mod error;
pub mod housekeeping;
pub mod queue;
pub mod template;
pub mod transport;
pub mod worker;

pub fn init_tracing(config: &config::Config) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "{}={},tower_http=info,axum=info",
            env!("CARGO_CRATE_NAME"),
            config.log_level
        )
        .into()
    });

    let registry = tracing_subscriber::registry().with(env_filter);

    if config.log_to_file {
        let file_appender = tracing_appender::rolling::daily(&config.log_dir, "remit.log");
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .with(tracing_subscriber::fmt::layer().json().with_writer(file_appender).with_ansi(false))
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    }
}

pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = token.cancelled() => {},
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
