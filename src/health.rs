use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::storage::KeyValueStore;
use crate::AppState;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: ReadinessStatus,
    pub checks: ReadinessChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessStatus {
    Ok,
    Degraded,
    Unavailable,
}

#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    pub store: CheckResult,
    pub upstream: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_store(store: &dyn KeyValueStore) -> CheckResult {
    match store.ping().await {
        Ok(()) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("PING failed: {e}")),
    }
}

async fn check_upstream(
    client: &reqwest::Client,
    base_url: &str,
    timeout: Duration,
) -> CheckResult {
    let url = format!("{}/", base_url.trim_end_matches('/'));
    match client.head(&url).timeout(timeout).send().await {
        Ok(resp) if resp.status().is_success() || resp.status().is_redirection() => {
            CheckResult::healthy()
        }
        Ok(resp) => CheckResult::unhealthy(format!("HEAD {} returned {}", url, resp.status())),
        Err(e) => CheckResult::unhealthy(format!("HEAD {} failed: {e}", url)),
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

/// The store is required to answer anything; a failing upstream only limits
/// pass-through and refreshes.
fn aggregate_status(checks: &ReadinessChecks) -> ReadinessStatus {
    if !checks.store.ok {
        ReadinessStatus::Unavailable
    } else if !checks.upstream.ok {
        ReadinessStatus::Degraded
    } else {
        ReadinessStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /readyz` handler.  Returns 200 on Ok/Degraded, 503 on Unavailable.
pub async fn readiness_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let base_url = state.config.upstream.base_url();
    let (store, upstream) = tokio::join!(
        check_store(state.cache_manager.store().as_ref()),
        check_upstream(
            &state.http_client,
            &base_url,
            state.config.upstream.connect_timeout(),
        ),
    );

    let checks = ReadinessChecks { store, upstream };
    let status = aggregate_status(&checks);
    let body = ReadinessResponse { status, checks };

    let http_status = match status {
        ReadinessStatus::Ok | ReadinessStatus::Degraded => StatusCode::OK,
        ReadinessStatus::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}
