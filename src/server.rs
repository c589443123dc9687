//! HTTP surface over the worker pool

use crate::{is_valid_url, RenderError, RenderRequest, WaitStrategy, WorkerPool};
use anyhow::Context;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const WAIT_UNTIL_HEADER: &str = "x-rendergun-wait-until";
pub const TIMEOUT_HEADER: &str = "x-rendergun-timeout";
pub const ABORT_REQUEST_HEADER: &str = "x-rendergun-abort-request";
pub const BLOCK_ADS_HEADER: &str = "x-rendergun-block-ads";

const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<WorkerPool>,
}

#[derive(Debug, Deserialize)]
struct RenderParams {
    url: Option<String>,
}

pub fn router(pool: Arc<WorkerPool>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/-/health", get(health))
        .route("/render", get(render).post(render))
        .with_state(AppState { pool })
}

/// Serves until SIGINT/SIGTERM, then closes the pool.
pub async fn run(pool: Arc<WorkerPool>, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Rendergun listening on {}", addr);

    let served = axum::serve(listener, router(pool.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("HTTP server stopped, shutting down the renderer");
    pool.close().await;
    served.context("HTTP server error")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

async fn index() -> impl IntoResponse {
    (StatusCode::OK, "")
}

async fn health(State(state): State<AppState>) -> Response {
    let health = state.pool.pool_health().await;
    let status = if health.healthy {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(health)).into_response()
}

async fn render(
    State(state): State<AppState>,
    method: Method,
    Query(params): Query<RenderParams>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let url = params.url.unwrap_or_default();
    if !is_valid_url(url.as_str()) {
        return (StatusCode::BAD_REQUEST, "Invalid URL").into_response();
    }

    let max_timeout = state.pool.config().max_request_timeout;
    let mut request = match request_from_headers(&headers, max_timeout) {
        Ok(request) => request,
        Err(message) => return (StatusCode::BAD_REQUEST, message).into_response(),
    };
    request.url = url;
    if method == Method::POST && !body.is_empty() {
        request.content = Some(body);
    }

    match state.pool.render(request).await {
        Ok(result) => {
            let status =
                StatusCode::from_u16(result.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, [(header::CONTENT_TYPE, HTML_CONTENT_TYPE)], result.body).into_response()
        }
        Err(e) => error_response(&e),
    }
}

fn error_response(err: &RenderError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, err.public_message()).into_response()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, String> {
    headers
        .get(name)
        .map(|value| {
            value
                .to_str()
                .map(str::trim)
                .map_err(|_| format!("Invalid {name} header"))
        })
        .transpose()
}

/// Render options carried in `x-rendergun-*` headers. Timeouts above
/// `max_timeout` are rejected.
fn request_from_headers(
    headers: &HeaderMap,
    max_timeout: Duration,
) -> Result<RenderRequest, String> {
    let mut request = RenderRequest::default();

    if let Some(value) = header_str(headers, WAIT_UNTIL_HEADER)? {
        request.wait_until = value
            .parse::<WaitStrategy>()
            .map_err(|_| format!("Invalid {WAIT_UNTIL_HEADER} header"))?;
    }

    if let Some(value) = header_str(headers, TIMEOUT_HEADER)? {
        let millis = value
            .parse::<u64>()
            .ok()
            .filter(|ms| *ms > 0)
            .ok_or_else(|| format!("Invalid {TIMEOUT_HEADER} header"))?;
        let timeout = Duration::from_millis(millis);
        if timeout > max_timeout {
            return Err(format!(
                "{TIMEOUT_HEADER} must not exceed {} ms",
                max_timeout.as_millis()
            ));
        }
        request.timeout = Some(timeout);
    }

    if let Some(value) = header_str(headers, ABORT_REQUEST_HEADER)? {
        if !value.is_empty() {
            request.abort_request_pattern = Some(value.to_string());
        }
    }

    if let Some(value) = header_str(headers, BLOCK_ADS_HEADER)? {
        request.block_ads = match value.to_ascii_lowercase().as_str() {
            "true" | "1" => true,
            "false" | "0" | "" => false,
            _ => return Err(format!("Invalid {BLOCK_ADS_HEADER} header")),
        };
    }

    Ok(request)
}
