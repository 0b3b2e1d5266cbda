// Audit log endpoint

use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::models::audit::AuditEventType;
use crate::storage::AuditQuery;
use crate::FlowForgeError;

use super::middleware::TenantAdmin;
use super::{ApiError, AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogsQuery {
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub event_type: Option<String>,
    pub user_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    /// Platform admin only
    #[serde(default)]
    pub all_tenants: bool,
}

/// GET /audit-logs - tenant-scoped unless the caller is a platform admin
/// asking for `allTenants=true`
pub async fn list_audit_logs(
    State(state): State<AppState>,
    TenantAdmin(ctx): TenantAdmin,
    Query(query): Query<AuditLogsQuery>,
) -> Result<Json<Value>, ApiError> {
    let event_type = match &query.event_type {
        Some(raw) => Some(
            serde_json::from_value::<AuditEventType>(json!(raw)).map_err(|_| {
                FlowForgeError::validation(format!("unknown event type '{}'", raw))
            })?,
        ),
        None => None,
    };
    let events = state
        .store()
        .audit()
        .query(
            &ctx,
            &AuditQuery {
                resource_type: query.resource_type,
                resource_id: query.resource_id,
                event_type,
                user_id: query.user_id,
                from: query.from,
                to: query.to,
                limit: query.limit,
                offset: query.offset.unwrap_or(0),
                all_tenants: query.all_tenants,
            },
        )
        .await?;
    Ok(Json(json!({ "events": events, "count": events.len() })))
}
