//! Main axum router and HTTP request handlers.
//!
//! Routes:
//! - `/view/top/{n}/{metric}`  - Top-N repositories by forks, last_updated,
//!   open_issues or stars, served from the prebuilt views
//! - `GET /healthcheck`        - Liveness (always 200, empty body)
//! - `GET /readyz`             - Readiness (store and upstream checks)
//! - `GET /metrics`            - Prometheus metrics
//! - any cached resource path  - Stored upstream payload
//! - everything else           - Reverse-proxied to the upstream API, including
//!   non-GET requests to the health and metrics paths

use std::sync::Arc;

use axum::{
    extract::{Path, Request, State},
    http::{header, StatusCode},
    middleware::from_fn,
    response::{IntoResponse, Response},
    routing::{any, get},
    Router,
};
use tracing::{debug, error, instrument, warn};

use crate::cache::views::{parse_limit, render_entries};
use crate::cache::{CacheError, ViewKey};
use crate::metrics::RouteKind;
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Precomputed views
        .route("/view/top/{limit}/{metric}", any(handle_view))
        // Health, readiness, metrics; other methods on these paths pass through
        .route("/healthcheck", get(handle_healthcheck).fallback(handle_fallback))
        .route(
            "/readyz",
            get(crate::health::readiness_handler).fallback(handle_fallback),
        )
        .route("/metrics", get(handle_metrics).fallback(handle_fallback))
        // Cached resources, then pass-through
        .fallback(handle_fallback)
        .layer(from_fn(super::middleware::request_id_middleware))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `/view/top/{n}/{metric}`
///
/// The limit is validated before the store is touched. An unknown metric is
/// not one of ours and is passed through like any other path.
#[instrument(skip_all, fields(%limit, %metric))]
async fn handle_view(
    State(state): State<Arc<AppState>>,
    Path((limit, metric)): Path<(String, String)>,
    req: Request,
) -> Result<Response, AppError> {
    let Some(key) = ViewKey::from_route_segment(&metric) else {
        debug!("unknown view metric, passing through");
        return Ok(pass_through(&state, req).await);
    };

    state.metrics.metrics.record_route(RouteKind::View);
    let limit = parse_limit(&limit).map_err(AppError::from_view)?;
    let entries = state
        .views
        .get_view(key, limit)
        .await
        .map_err(AppError::from_view)?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        render_entries(&entries),
    )
        .into_response())
}

/// Serve a cached resource from the store, or forward the request upstream.
///
/// A cached path whose key has not been written yet is read through to the
/// upstream rather than answered with an empty body.
async fn handle_fallback(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let path = req.uri().path().to_string();
    if !state.cached_paths.contains(&path) {
        return pass_through(&state, req).await;
    }

    match state.cache_manager.cached(&path).await {
        Ok(Some(payload)) => {
            state.metrics.metrics.record_route(RouteKind::Cached);
            debug!(%path, bytes = payload.len(), "serving cached resource");
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                payload,
            )
                .into_response()
        }
        Ok(None) => {
            debug!(%path, "cached resource not stored yet, reading through");
            pass_through(&state, req).await
        }
        Err(e) => {
            warn!(%path, error = %e, "store read failed for cached resource");
            AppError::Unavailable(e.to_string()).into_response()
        }
    }
}

/// `GET /healthcheck`
async fn handle_healthcheck() -> StatusCode {
    StatusCode::OK
}

/// `GET /metrics`
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let body = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("failed to encode metrics: {e}")))?;
    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        body,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

async fn pass_through(state: &AppState, req: Request) -> Response {
    state.metrics.metrics.record_route(RouteKind::PassThrough);
    state.proxy.forward(req).await
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// The request cannot be answered as asked (bad limit, unreadable view).
    BadRequest(String),
    /// The store could not be read.
    Unavailable(String),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl AppError {
    /// Any failure on the view route is reported to the caller as a 400.
    fn from_view(err: CacheError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(msg) => {
                debug!(%msg, "bad request");
                (StatusCode::BAD_REQUEST, msg).into_response()
            }
            AppError::Unavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, format!("cache unavailable: {msg}"))
                    .into_response()
            }
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}"),
                )
                    .into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}
