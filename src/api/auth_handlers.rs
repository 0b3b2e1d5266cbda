// Identity endpoints - login, refresh, me, switch-tenant

use axum::{extract::State, http::header, http::HeaderMap, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::FlowForgeError;

use super::middleware::AuthContext;
use super::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// POST /auth/login
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<crate::auth::LoginResponse>, ApiError> {
    let response = state.auth.login(&request.email, &request.password).await?;
    Ok(Json(response))
}

/// POST /auth/refresh - exchanges the presented bearer token, honoring the
/// grace period past expiry
pub async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| FlowForgeError::Unauthorized("missing bearer token".to_string()))?;
    let fresh = state.auth.refresh(token).await?;
    Ok(Json(json!({ "token": fresh })))
}

/// GET /auth/me
pub async fn me(auth: AuthContext) -> Json<Value> {
    Json(json!({
        "userId": auth.ctx.user_id,
        "email": auth.claims.email,
        "tenantId": auth.ctx.tenant_id,
        "roles": auth.ctx.roles,
        "permissions": auth.ctx.permissions,
        "isPlatformAdmin": auth.ctx.is_platform_admin,
        "isTenantAdmin": auth.claims.tenant_admin,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchTenantRequest {
    pub tenant_id: String,
}

/// POST /auth/switch-tenant - new token bound to another tenant the caller
/// belongs to
pub async fn switch_tenant(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(request): Json<SwitchTenantRequest>,
) -> Result<Json<Value>, ApiError> {
    let token = state
        .auth
        .switch_tenant(&auth.claims, &request.tenant_id)
        .await?;
    Ok(Json(json!({ "token": token, "tenantId": request.tenant_id })))
}
