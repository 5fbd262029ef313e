//! HTTP API.
//!
//! - POST /vectoradd
//! - GET /metrics
//!
//! Each offload runs on a blocking worker so a slow device call never stalls
//! the runtime. A semaphore bounds how many run at once, and the permit
//! travels with the worker: a request that times out still holds its slot
//! until the device work behind it has finished and released its session.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{field, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::config::Config;
use crate::device::ComputeBackend;
use crate::error::OffloadError;
use crate::metrics::OffloadMetrics;
use crate::offload::{Gateway, OffloadRequest, OffloadResult};

/// Application state shared across handlers.
pub struct AppState<B: ComputeBackend> {
    pub gateway: Arc<Gateway<B>>,
    pub config: Arc<Config>,
    pub limiter: Arc<Semaphore>,
    pub start_time: Instant,
}

impl<B: ComputeBackend> AppState<B> {
    pub fn new(gateway: Arc<Gateway<B>>, config: Arc<Config>) -> Self {
        Self {
            limiter: Arc::new(Semaphore::new(config.server.max_concurrent_requests)),
            gateway,
            config,
            start_time: Instant::now(),
        }
    }

    fn metrics(&self) -> &OffloadMetrics {
        self.gateway.metrics()
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.server.request_timeout_secs)
    }
}

/// Build the axum router with all API routes.
pub fn build_router<B: ComputeBackend>(state: Arc<AppState<B>>) -> Router {
    Router::new()
        .route("/vectoradd", post(vector_add::<B>))
        .route("/metrics", get(metrics_text::<B>))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─── Error Responses ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub kind: String,
    pub message: String,
}

/// An [`OffloadError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub OffloadError);

impl From<OffloadError> for ApiError {
    fn from(e: OffloadError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                kind: self.0.kind().to_string(),
                message: self.0.to_string(),
            },
        };
        (self.0.status_code(), Json(body)).into_response()
    }
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn vector_add<B: ComputeBackend>(
    State(state): State<Arc<AppState<B>>>,
    payload: Result<Json<OffloadRequest>, JsonRejection>,
) -> Result<Json<OffloadResult>, ApiError> {
    let request_id = Uuid::new_v4().to_string();
    let span = info_span!("vectoradd", request_id = %request_id, n = field::Empty);

    let outcome = match payload {
        Ok(Json(req)) => {
            span.record("n", req.left.len());
            offload(&state, req).instrument(span.clone()).await
        }
        Err(rejection) => Err(OffloadError::InvalidRequest(rejection.body_text())),
    };

    let label = match &outcome {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    state.metrics().record_outcome(label);

    span.in_scope(|| match &outcome {
        Ok(res) => info!(n = res.sum.len(), "Request served"),
        Err(e) if e.is_client_error() => info!(error = %e, "Request rejected"),
        Err(e) => warn!(error = %e, "Request failed"),
    });

    Ok(Json(outcome?))
}

/// Run one request on a blocking worker under the concurrency limit and timeout.
async fn offload<B: ComputeBackend>(
    state: &AppState<B>,
    req: OffloadRequest,
) -> Result<OffloadResult, OffloadError> {
    // Shape errors never wait for a device slot.
    state.gateway.validate(&req)?;

    let timeout = state.request_timeout();
    let deadline = tokio::time::Instant::now() + timeout;

    let permit = tokio::time::timeout_at(deadline, state.limiter.clone().acquire_owned())
        .await
        .map_err(|_| OffloadError::Timeout(timeout.as_secs()))?
        .map_err(|e| OffloadError::WorkerFailed(e.to_string()))?;

    let gateway = state.gateway.clone();
    let span = Span::current();
    let worker = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        span.in_scope(|| gateway.handle(&req))
    });

    match tokio::time::timeout_at(deadline, worker).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(OffloadError::WorkerFailed(join.to_string())),
        Err(_) => Err(OffloadError::Timeout(timeout.as_secs())),
    }
}

async fn metrics_text<B: ComputeBackend>(State(state): State<Arc<AppState<B>>>) -> Response {
    match state.metrics().render() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
