// Workflow and execution endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::engine::ExecutionSignal;
use crate::models::workflow::{
    AgentSpec, Connection, StateField, WorkflowDefinition, WorkflowStatus,
};
use crate::storage::FindOptions;
use crate::FlowForgeError;

use super::middleware::{require_permission, AuthContext};
use super::{ApiError, AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveWorkflowRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub entry_points: Vec<String>,
    #[serde(default)]
    pub state_schema: Vec<StateField>,
    #[serde(default)]
    pub max_duration_ms: Option<u64>,
    #[serde(default)]
    pub status: Option<WorkflowStatus>,
}

#[derive(Debug, Deserialize)]
pub struct ListWorkflowsQuery {
    pub status: Option<WorkflowStatus>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// GET /workflows
pub async fn list_workflows(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(query): Query<ListWorkflowsQuery>,
) -> Result<Json<Value>, ApiError> {
    let mut filter = Map::new();
    if let Some(status) = query.status {
        filter.insert("status".to_string(), serde_json::to_value(status).map_err(FlowForgeError::from)?);
    }
    let options = FindOptions::sorted_desc("updated_at")
        .with_limit(query.limit.unwrap_or(50))
        .with_offset(query.offset.unwrap_or(0));
    let workflows = state
        .store()
        .list_definitions(&auth.ctx, filter, &options)
        .await?;
    Ok(Json(json!({ "workflows": workflows, "count": workflows.len() })))
}

/// POST /workflows - creates version 1, or the next version when the id
/// already exists. The definition is compiled (validated) before it is saved.
pub async fn create_workflow(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(request): Json<SaveWorkflowRequest>,
) -> Result<(StatusCode, Json<WorkflowDefinition>), ApiError> {
    require_permission(&auth.ctx, "workflows:write")?;

    let workflow_id = request
        .id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let version = match state
        .store()
        .load_definition(&auth.ctx, &workflow_id, None)
        .await
    {
        Ok(existing) => existing.version + 1,
        Err(FlowForgeError::NotFound { .. }) => 1,
        Err(other) => return Err(other.into()),
    };

    let mut definition = WorkflowDefinition::new(
        workflow_id,
        request.name,
        auth.ctx.tenant_id.clone(),
        auth.ctx.user_id.clone(),
    );
    definition.version = version;
    definition.agents = request.agents;
    definition.connections = request.connections;
    definition.entry_points = request.entry_points;
    definition.state_schema = request.state_schema;
    definition.max_duration_ms = request.max_duration_ms;
    definition.status = request.status.unwrap_or(WorkflowStatus::Draft);

    // Design errors surface at save time with one error per defect
    state.engine.compile_definition(&definition)?;
    let saved = state.store().save_definition(&auth.ctx, definition).await?;
    Ok((StatusCode::CREATED, Json(saved)))
}

/// GET /workflows/:id - newest version
pub async fn get_workflow(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(workflow_id): Path<String>,
) -> Result<Json<WorkflowDefinition>, ApiError> {
    let workflow = state
        .store()
        .load_definition(&auth.ctx, &workflow_id, None)
        .await?;
    Ok(Json(workflow))
}

/// PUT /workflows/:id - edit the newest version in place while it is a
/// draft; Active definitions are immutable (a new version must be created)
pub async fn update_workflow(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(workflow_id): Path<String>,
    Json(request): Json<SaveWorkflowRequest>,
) -> Result<Json<WorkflowDefinition>, ApiError> {
    require_permission(&auth.ctx, "workflows:write")?;

    let mut existing = state
        .store()
        .load_definition(&auth.ctx, &workflow_id, None)
        .await?;
    if !existing.is_mutable() {
        return Err(FlowForgeError::Conflict(format!(
            "workflow '{}' is {:?}; create a new version instead",
            workflow_id, existing.status
        ))
        .into());
    }

    existing.name = request.name;
    existing.agents = request.agents;
    existing.connections = request.connections;
    existing.entry_points = request.entry_points;
    existing.state_schema = request.state_schema;
    existing.max_duration_ms = request.max_duration_ms;
    if let Some(status) = request.status {
        existing.status = status;
    }

    state.engine.compile_definition(&existing)?;
    let saved = state.store().update_definition(&auth.ctx, existing).await?;
    Ok(Json(saved))
}

/// DELETE /workflows/:id - archive the newest version (soft delete)
pub async fn archive_workflow(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(workflow_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    require_permission(&auth.ctx, "workflows:write")?;
    let existing = state
        .store()
        .load_definition(&auth.ctx, &workflow_id, None)
        .await?;
    let archived = state
        .store()
        .archive_definition(&auth.ctx, &workflow_id, existing.version)
        .await?;
    Ok(Json(json!({
        "id": archived.id,
        "version": archived.version,
        "status": archived.status,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    #[serde(default)]
    pub initial_state: Map<String, Value>,
}

/// POST /workflows/:id/execute - fire-and-forget, 202 Accepted
pub async fn execute_workflow(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(workflow_id): Path<String>,
    Json(request): Json<ExecuteRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    require_permission(&auth.ctx, "workflows:execute")?;
    let execution_id = state
        .engine
        .start(&auth.ctx, &workflow_id, request.initial_state)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "executionId": execution_id })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ListExecutionsQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// GET /workflows/:id/executions
pub async fn list_workflow_executions(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(workflow_id): Path<String>,
    Query(query): Query<ListExecutionsQuery>,
) -> Result<Json<Value>, ApiError> {
    let options = FindOptions::sorted_desc("started_at")
        .with_limit(query.limit.unwrap_or(50))
        .with_offset(query.offset.unwrap_or(0));
    let executions = state
        .store()
        .list_executions(&auth.ctx, Some(&workflow_id), &options)
        .await?;
    Ok(Json(json!({ "executions": executions, "count": executions.len() })))
}

/// GET /executions/:execution_id - status, state, recent checkpoints
pub async fn get_execution(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(execution_id): Path<String>,
) -> Result<Json<crate::engine::ExecutionView>, ApiError> {
    let view = state.engine.observe(&auth.ctx, &execution_id).await?;
    Ok(Json(view))
}

#[derive(Debug, Deserialize)]
pub struct SignalRequest {
    pub signal: ExecutionSignal,
}

/// POST /executions/:execution_id/signal
pub async fn signal_execution(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(execution_id): Path<String>,
    Json(request): Json<SignalRequest>,
) -> Result<Json<Value>, ApiError> {
    require_permission(&auth.ctx, "workflows:execute")?;
    state
        .engine
        .signal(&auth.ctx, &execution_id, request.signal)
        .await?;
    Ok(Json(json!({
        "executionId": execution_id,
        "signal": request.signal,
        "accepted": true,
    })))
}
