// Health and observability endpoints

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::json;

use super::middleware::OptionalAuth;
use super::{ApiError, AppState};

/// GET /health - detailed report including pool stats. Works without a
/// token; authenticated callers get their tenant echoed for debugging.
pub async fn health(
    State(state): State<AppState>,
    OptionalAuth(caller): OptionalAuth,
) -> impl IntoResponse {
    let store_health = state.store().manager().health_check().await;
    let status = if store_health.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "status": if store_health.healthy { "healthy" } else { "unhealthy" },
        "store": store_health,
        "engine": {
            "activeExecutions": state.engine.active_executions(),
            "registeredAgents": state.engine.registry().list(),
        },
        "tenant": caller.map(|ctx| ctx.tenant_id),
    });
    (status, Json(body))
}

/// GET /ready - lightweight readiness probe
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    if state.store().manager().is_healthy() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// GET /alive - liveness probe
pub async fn alive() -> &'static str {
    "alive"
}

/// GET /metrics - Prometheus text exposition format
pub async fn metrics(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let text = state.metrics.render()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        text,
    ))
}
