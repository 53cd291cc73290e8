use anyhow::anyhow;
use std::fmt::Display;

use axum::response::{IntoResponse, Response};
use hyper::StatusCode;

/// Errors raised by the metric registry.
///
/// Every variant is a call-site bug (a handler naming a metric that does not
/// exist, or passing the wrong labels). They are logged and surfaced as a
/// generic 500, never retried.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MetricError {
    #[error("unknown metric `{0}`")]
    UnknownMetric(String),
    #[error("label mismatch for `{name}`: declared {expected:?}, got {got:?}")]
    LabelMismatch { name: String, expected: Vec<String>, got: Vec<String> },
    #[error("metric `{name}` is a {actual}, not a {expected}")]
    KindMismatch { name: String, expected: &'static str, actual: &'static str },
    #[error("metric `{0}` is already registered with a different shape")]
    Conflict(String),
    #[error("invalid buckets for `{0}`: boundaries must be finite and strictly increasing")]
    InvalidBuckets(String),
    #[error("invalid descriptor for `{name}`: {reason}")]
    InvalidDescriptor { name: String, reason: String },
}

/// The proxy's outbound call failed or timed out. Recovered by answering with a null url.
#[derive(Debug, thiserror::Error)]
#[error("upstream request failed: {0}")]
pub struct UpstreamRequestError(#[from] pub reqwest::Error);

// Wraps `anyhow::Error` so handlers can use `?` on anything.
#[derive(Debug)]
pub struct AppError(anyhow::Error);

impl Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let err = self.0;
        // The detail stays in the log; clients only learn that something failed.
        tracing::error!(%err, "request failed");
        (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl AppError {
    pub fn new<T: std::error::Error + Send + Sync + 'static>(err: T) -> Self {
        Self(anyhow!(err))
    }
}
