use axum::extract::{ConnectInfo, FromRef, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::api::auth::ApiKeyAuth;
use crate::api::error::ApiError;
use crate::api::rate_limit::{RateLimitDecision, RateLimiter};
use crate::config::Config;
use crate::queue::EmailQueueStore;

pub mod auth;
mod emails;
pub mod error;
mod rate_limit;
mod validation;

#[derive(Debug, Error)]
pub enum ApiServerError {
    #[error("failed to bind to address: {0}")]
    Bind(std::io::Error),
    #[error("server error: {0}")]
    Serve(std::io::Error),
}

#[derive(Clone)]
pub struct ApiState {
    queue: Arc<EmailQueueStore>,
    config: Arc<Config>,
    rate_limiter: Arc<RateLimiter>,
}

impl FromRef<ApiState> for Arc<EmailQueueStore> {
    fn from_ref(state: &ApiState) -> Self {
        state.queue.clone()
    }
}

impl FromRef<ApiState> for Arc<Config> {
    fn from_ref(state: &ApiState) -> Self {
        state.config.clone()
    }
}

pub struct ApiServer {
    router: Router,
    socket: SocketAddr,
    shutdown: CancellationToken,
}

impl ApiServer {
    pub fn new(
        socket: SocketAddr,
        queue: Arc<EmailQueueStore>,
        config: Arc<Config>,
        shutdown: CancellationToken,
    ) -> ApiServer {
        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit_per_second,
            config.rate_limit_per_minute,
        ));
        let state = ApiState {
            queue,
            config,
            rate_limiter,
        };

        let protected = Router::new()
            .route("/emails", post(emails::create_email))
            .route("/queue/status", get(emails::queue_status))
            .route_layer(middleware::from_fn_with_state(
                state.clone(),
                auth_middleware,
            ));

        let router = Router::new()
            .route("/health", get(emails::health))
            .merge(protected)
            .layer((
                TraceLayer::new_for_http(),
                TimeoutLayer::new(Duration::from_secs(10)),
            ))
            .layer(middleware::from_fn_with_state(
                state.clone(),
                rate_limit_middleware,
            ))
            .with_state(state);

        ApiServer {
            socket,
            router,
            shutdown,
        }
    }

    pub async fn serve(self) -> Result<(), ApiServerError> {
        let listener = TcpListener::bind(self.socket)
            .await
            .map_err(ApiServerError::Bind)?;

        info!("API server listening on {}", self.socket);

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(wait_for_shutdown(self.shutdown))
        .await
        .map_err(ApiServerError::Serve)
    }

    pub fn spawn(self) {
        tokio::spawn(async {
            let token = self.shutdown.clone();
            if let Err(e) = self.serve().await {
                error!("server error: {:?}", e);
                token.cancel();
                error!("shutting down API server")
            }
        });
    }
}

async fn wait_for_shutdown(token: CancellationToken) {
    token.cancelled().await;
}

async fn auth_middleware(_auth: ApiKeyAuth, request: Request, next: Next) -> Response {
    next.run(request).await
}

/// Keyed on the first `X-Forwarded-For` entry, falling back to the
/// socket peer (spec.md §4.6). `/health` is exempt: it's composed into
/// the router before this layer is applied to the merged tree, so the
/// exemption is handled by checking the path directly rather than by
/// router topology.
async fn rate_limit_middleware(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if request.uri().path() == "/health" {
        return Ok(next.run(request).await);
    }

    let identifier = request
        .headers()
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| addr.ip().to_string());

    match state.rate_limiter.check(&identifier).await {
        RateLimitDecision::Allowed => Ok(next.run(request).await),
        RateLimitDecision::Limited => Err(ApiError::RateLimited),
    }
}
