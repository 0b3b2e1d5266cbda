// HTTP surface - router assembly, shared state and the error contract

//! # API Module
//!
//! Axum routes over the engine, repositories and auth service. Every error
//! crossing this boundary is rendered as
//! `{"error": {"code", "message", "details"?}}` with the matching HTTP
//! status; the correlation `x-request-id` header is echoed on every
//! response. Rate-limited responses carry `Retry-After`.

pub mod audit_handlers;
pub mod auth_handlers;
pub mod health;
pub mod middleware;
pub mod workflow_handlers;

#[cfg(test)]
mod handler_tests;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::auth::AuthService;
use crate::config::Settings;
use crate::engine::ExecutionEngine;
use crate::metrics::Metrics;
use crate::storage::ExecutionStore;
use crate::FlowForgeError;

pub use middleware::{AuthContext, OptionalAuth, PlatformAdmin, RateLimiter, TenantAdmin};

/// Shared state behind every route
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ExecutionEngine>,
    pub auth: Arc<AuthService>,
    pub limiter: Arc<RateLimiter>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn store(&self) -> &ExecutionStore {
        self.engine.store()
    }
}

/// Response-side error wrapper
#[derive(Debug)]
pub struct ApiError(pub FlowForgeError);

impl From<FlowForgeError> for ApiError {
    fn from(err: FlowForgeError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            FlowForgeError::Validation { .. } => (StatusCode::BAD_REQUEST, "VALIDATION_FAILED"),
            FlowForgeError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            FlowForgeError::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            FlowForgeError::NotFound { .. } => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            FlowForgeError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            FlowForgeError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED"),
            FlowForgeError::Storage(_)
            | FlowForgeError::Serialization(_)
            | FlowForgeError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        };

        // No stack traces or internals in responses; those go to the logs
        let message = match &self.0 {
            FlowForgeError::Storage(_) | FlowForgeError::Internal(_) => {
                tracing::error!(error = %self.0, "internal error");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        let mut body = json!({
            "error": {
                "code": code,
                "message": message,
            }
        });
        if let FlowForgeError::Validation { details, .. } = &self.0 {
            if !details.is_empty() {
                body["error"]["details"] = json!(details);
            }
        }
        if let FlowForgeError::RateLimited { retry_after_secs } = &self.0 {
            body["error"]["details"] = json!({ "retryAfter": retry_after_secs });
        }

        let mut response = (status, Json(body)).into_response();
        if let FlowForgeError::RateLimited { retry_after_secs } = &self.0 {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Assemble the full application router
pub fn build_router(state: AppState, settings: &Settings) -> Router {
    Router::new()
        // Identity
        .route("/auth/login", post(auth_handlers::login))
        .route("/auth/refresh", post(auth_handlers::refresh))
        .route("/auth/me", get(auth_handlers::me))
        .route("/auth/switch-tenant", post(auth_handlers::switch_tenant))
        // Workflow engine
        .route("/workflows", get(workflow_handlers::list_workflows))
        .route("/workflows", post(workflow_handlers::create_workflow))
        .route("/workflows/:id", get(workflow_handlers::get_workflow))
        .route("/workflows/:id", put(workflow_handlers::update_workflow))
        .route("/workflows/:id", delete(workflow_handlers::archive_workflow))
        .route("/workflows/:id/execute", post(workflow_handlers::execute_workflow))
        .route(
            "/workflows/:id/executions",
            get(workflow_handlers::list_workflow_executions),
        )
        .route("/executions/:execution_id", get(workflow_handlers::get_execution))
        .route(
            "/executions/:execution_id/signal",
            post(workflow_handlers::signal_execution),
        )
        // Audit
        .route("/audit-logs", get(audit_handlers::list_audit_logs))
        // Health & observability
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/alive", get(health::alive))
        .route("/metrics", get(health::metrics))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::track_metrics,
        ))
        .layer(axum::middleware::from_fn(middleware::attach_request_id))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(settings.server.request_timeout))
        .with_state(state)
}
