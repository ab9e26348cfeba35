//! GitHub Copilot API relay
//!
//! Single-binary service that:
//! 1. Holds a pool of refresh credentials and exchanges them for short-lived
//!    bearer tokens
//! 2. Accepts OpenAI-style chat completion requests
//! 3. Forwards them upstream, rotating credentials on rate limits
//! 4. Reshapes responses for models that cannot stream

mod config;
mod forward;
mod metrics;
mod preprocess;
mod sse;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::forward::{ForwardState, error_response, forward_chat, forward_models};
use crate::preprocess::{ChatRequest, preprocess};

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    forward: ForwardState,
    prometheus: PrometheusHandle,
}

fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/chat/completions", post(chat_handler))
        .route("/models", get(models_handler))
        .route("/tokens/cycle", post(cycle_handler))
        .route("/tokens/status", get(status_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON tracing with LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting copilot-relay");

    // Install the Prometheus recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        api_base_url = %config.upstream.api_base_url,
        record_traffic = config.record.enabled,
        "configuration loaded"
    );

    let credentials = config
        .load_credentials()
        .context("failed to load refresh credentials")?;

    let client = config
        .build_http_client()
        .context("failed to build upstream HTTP client")?;

    let pool = copilot_pool::CredentialPool::new(
        credentials,
        config.upstream.token_url.clone(),
        client.clone(),
    )
    .context("failed to initialize credential pool")?;

    let app_state = AppState {
        forward: ForwardState {
            client,
            pool: Arc::new(pool),
            chat_url: config.chat_completions_url(),
            models_url: config.models_url(),
        },
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.server.max_connections);

    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.listen_addr))?;

    info!(addr = %config.server.listen_addr, "accepting requests");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutdown complete");
    Ok(())
}

async fn chat_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    let start = Instant::now();
    let response = handle_chat(&state.forward, &request_id, body).await;
    metrics::record_request(
        response.status().as_u16(),
        "POST",
        start.elapsed().as_secs_f64(),
    );
    response
}

async fn handle_chat(state: &ForwardState, request_id: &str, body: Bytes) -> Response {
    let mut request: ChatRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("invalid JSON body: {e}"),
            );
        }
    };

    info!(
        request_id,
        model = request.model(),
        stream = request.wants_stream(),
        messages = request.messages.len(),
        "chat completion request"
    );

    if let Err(e) = preprocess(&mut request) {
        return error_response(StatusCode::BAD_REQUEST, "invalid_request", &e.to_string());
    }

    match forward_chat(state, &request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn models_handler(State(state): State<AppState>) -> Response {
    let start = Instant::now();
    let response = match forward_models(&state.forward).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    };
    metrics::record_request(
        response.status().as_u16(),
        "GET",
        start.elapsed().as_secs_f64(),
    );
    response
}

/// Manually advance the pool to the next credential and discard the cached
/// token.
async fn cycle_handler(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.forward.pool.rotate().await;
    info!(
        previous = report.previous_index,
        current = report.current_index,
        "credential cycled manually"
    );
    Json(report)
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.forward.pool.status_snapshot().await)
}

/// Pool-level health: 200 while at least one credential is usable, 503 when
/// every credential sits in a penalty window.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.forward.pool.status_snapshot().await;
    let limited = snapshot
        .credentials
        .iter()
        .filter(|c| c.is_rate_limited)
        .count();

    let (status_code, status) = if limited == snapshot.total_credentials {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    } else if limited > 0 {
        (StatusCode::OK, "degraded")
    } else {
        (StatusCode::OK, "healthy")
    };

    let body = serde_json::json!({
        "status": status,
        "total_credentials": snapshot.total_credentials,
        "rate_limited": limited,
        "credentials": snapshot.credentials,
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
