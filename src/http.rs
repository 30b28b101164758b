//! Operational HTTP surface.
//!
//! - `GET /healthz` - store reachability and subscription state
//! - `GET /metrics` - Prometheus metrics

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::coordinator::Coordinator;

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub node_id: String,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub store: CheckResult,
    pub pubsub: CheckResult,
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

/// An unreachable store makes the node unhealthy.  A missing subscription
/// only degrades it: work, locks and KV still function.
pub async fn check_health(coordinator: &Coordinator) -> HealthResponse {
    let store = match coordinator.backend().ping().await {
        Ok(()) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("PING failed: {e}")),
    };
    let pubsub = if coordinator.pubsub().is_subscribed() {
        CheckResult::healthy()
    } else {
        CheckResult::unhealthy("not subscribed")
    };

    let status = if !store.ok {
        HealthStatus::Unhealthy
    } else if !pubsub.ok {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    };

    HealthResponse {
        status,
        node_id: coordinator.node_id().to_string(),
        checks: HealthChecks { store, pubsub },
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn create_router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(coordinator)
}

async fn handle_health(State(coordinator): State<Arc<Coordinator>>) -> Response {
    let health = check_health(&coordinator).await;
    let code = if health.status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(health)).into_response()
}

async fn handle_metrics(State(coordinator): State<Arc<Coordinator>>) -> Response {
    match coordinator.metrics().encode() {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
