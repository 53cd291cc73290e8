use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{ConnectInfo, MatchedPath, Request, State},
    http::{self, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use log::warn;
use reqwest::{Client, Url};
use serde::Serialize;
use tokio::time::Instant;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::{
    config::Environment,
    error::{AppError, UpstreamRequestError},
    metrics::{
        RegistryCell,
        exposition::{CONTENT_TYPE, encode},
        registry::{
            API_DATA_LATENCY_SECONDS, CATS_ACTIVE_USERS, CATS_ERRORS_TOTAL, CATS_LOGINS_TOTAL, CATS_LOGOUTS_TOTAL,
            HTTP_REQUESTS_TOTAL, HTTP_RESPONSE_TIME_SECONDS, LOGGED_IN_USERS,
        },
    },
};

/// 应用状态 (跨请求共享)
pub struct AppState {
    /// Where every handler finds the metric registry.
    pub metrics: Arc<RegistryCell>,
    /// Outbound client, redirects disabled.
    pub client: Client,
    pub upstream_url: Url,
    /// Value of the `environment` label on `logged_in_users`.
    pub environment: Environment,
}

impl AppState {
    pub fn new(metrics: Arc<RegistryCell>, client: Client, upstream_url: Url, environment: Environment) -> Self {
        Self {
            metrics,
            client,
            upstream_url,
            environment,
        }
    }
}

/// 构建 Axum 路由和中间件栈
///
/// - `GET /health`: liveness payload
/// - `GET /`: `Location` header of the upstream, as JSON
/// - `GET /metrics`: Prometheus text exposition
/// - `POST /login`, `POST /logout`: simulated session changes
///
/// Every request, including unmatched ones, is counted in
/// `http_requests_total` and timed in `http_response_time_seconds`.
pub fn build_router(app_state: AppState) -> Router {
    let state = Arc::new(app_state);
    Router::new()
        .route("/", get(proxy_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/login", post(login_handler))
        .route("/logout", post(logout_handler))
        .fallback(|| async { (StatusCode::NOT_FOUND, "not found") })
        .layer((
            TraceLayer::new_for_http()
                .make_span_with(make_span)
                // AppError logs its own failures
                .on_failure(()),
            middleware::from_fn_with_state(state.clone(), track_requests),
            CorsLayer::permissive(),
            TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, Duration::from_secs(30)),
            CompressionLayer::new(),
        ))
        .with_state(state)
}

fn make_span(req: &http::Request<axum::body::Body>) -> tracing::Span {
    let method = req.method();
    let path = req.uri().path();
    let matched_path = req.extensions().get::<MatchedPath>().map(|matched_path| matched_path.as_str());
    let peer = req.extensions().get::<ConnectInfo<SocketAddr>>().map(|ConnectInfo(addr)| addr.ip().to_canonical());

    tracing::debug_span!("recv request", %method, %path, matched_path, peer = ?peer)
}

/// Counts and times each request under its route template, so `/login?x=1`
/// and `/login` share a series and unknown paths cannot blow up cardinality.
async fn track_requests(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_string());
    let start = Instant::now();
    let response = next.run(req).await;
    let elapsed = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let registry = state.metrics.get_or_create();
    if let Err(err) = registry.increment(
        HTTP_REQUESTS_TOTAL,
        &[("method", method.as_str()), ("path", path.as_str()), ("status", status.as_str())],
    ) {
        warn!("failed to count request: {err}");
    }
    if let Err(err) = registry.observe(HTTP_RESPONSE_TIME_SECONDS, &[("method", method.as_str()), ("path", path.as_str())], elapsed) {
        warn!("failed to time request: {err}");
    }
    response
}

#[derive(Serialize, Debug)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: i64,
}

pub(crate) async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        timestamp: chrono::Utc::now().timestamp(),
    })
}

#[derive(Serialize, Debug)]
pub struct ProxyResponse {
    pub url: Option<String>,
}

/// Reports where the upstream redirects to. An unreachable upstream is not an
/// error for the caller: it is counted in `cats_errors_total` and answered
/// with `{"url": null}`.
pub(crate) async fn proxy_handler(State(state): State<Arc<AppState>>) -> Result<Json<ProxyResponse>, AppError> {
    let start = Instant::now();
    let result = fetch_location(&state.client, &state.upstream_url).await;
    let registry = state.metrics.get_or_create();
    registry.observe(API_DATA_LATENCY_SECONDS, &[], start.elapsed().as_secs_f64())?;
    let url = match result {
        Ok(location) => location,
        Err(err) => {
            warn!("GET {} failed: {err}", state.upstream_url);
            registry.increment(CATS_ERRORS_TOTAL, &[])?;
            None
        }
    };
    Ok(Json(ProxyResponse { url }))
}

async fn fetch_location(client: &Client, url: &Url) -> Result<Option<String>, UpstreamRequestError> {
    let response = client.get(url.clone()).send().await?;
    Ok(response
        .headers()
        .get(header::LOCATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned))
}

#[derive(Serialize, Debug)]
pub struct MessageResponse {
    pub message: &'static str,
}

pub(crate) async fn login_handler(State(state): State<Arc<AppState>>) -> Result<Json<MessageResponse>, AppError> {
    let registry = state.metrics.get_or_create();
    registry.increment(CATS_LOGINS_TOTAL, &[])?;
    registry.set_gauge(CATS_ACTIVE_USERS, &[], 1.0)?;
    registry.set_gauge(LOGGED_IN_USERS, &[("environment", state.environment.as_str())], 1.0)?;
    Ok(Json(MessageResponse {
        message: "Logged in successfully",
    }))
}

pub(crate) async fn logout_handler(State(state): State<Arc<AppState>>) -> Result<Json<MessageResponse>, AppError> {
    let registry = state.metrics.get_or_create();
    registry.increment(CATS_LOGOUTS_TOTAL, &[])?;
    registry.set_gauge(CATS_ACTIVE_USERS, &[], -1.0)?;
    registry.set_gauge(LOGGED_IN_USERS, &[("environment", state.environment.as_str())], -1.0)?;
    Ok(Json(MessageResponse {
        message: "Logged out successfully",
    }))
}

/// Prometheus 指标处理器
pub(crate) async fn metrics_handler(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let snapshot = state.metrics.get_or_create().snapshot();
    let mut buffer = String::new();
    if let Err(e) = encode(&mut buffer, &snapshot) {
        log::error!("Failed to encode metrics: {e:?}");
        return Err(AppError::new(io::Error::other(e)));
    }
    Ok(([(header::CONTENT_TYPE, CONTENT_TYPE)], buffer).into_response())
}
