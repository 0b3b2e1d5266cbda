// Execution store - the persistence operations the engine consumes

//! Durable persistence for workflow definitions, executions, checkpoints and
//! their audit events. Everything flows through the tenant-scoped
//! [`Repository`] layer; the store only adds the engine-specific composition
//! rules, most importantly that one engine step (execution update +
//! checkpoint append + state-transition audit event) is a single commit
//! scope, durable before any downstream agent observes the new state.

use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::metrics::Metrics;
use crate::models::audit::{AuditEvent, AuditEventType};
use crate::models::execution::{Checkpoint, Execution, ExecutionStatus};
use crate::models::workflow::WorkflowDefinition;
use crate::models::{TenantContext, TenantDocument};
use crate::{FlowForgeError, Result};

use super::{AuditMode, AuditTrail, FindOptions, Repository, StoreManager, StoreOp};

/// Engine-facing persistence facade
#[derive(Clone)]
pub struct ExecutionStore {
    manager: Arc<StoreManager>,
    workflows: Repository<WorkflowDefinition>,
    executions: Repository<Execution>,
    checkpoints: Repository<Checkpoint>,
    audit: AuditTrail,
}

impl ExecutionStore {
    pub fn new(manager: Arc<StoreManager>, metrics: Arc<Metrics>) -> Self {
        Self {
            workflows: Repository::new(manager.clone(), metrics.clone()),
            executions: Repository::new(manager.clone(), metrics.clone()),
            checkpoints: Repository::new(manager.clone(), metrics.clone()),
            audit: AuditTrail::new(manager.clone(), metrics),
            manager,
        }
    }

    pub fn manager(&self) -> &Arc<StoreManager> {
        &self.manager
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    // -- workflow definitions -------------------------------------------------

    pub async fn save_definition(
        &self,
        ctx: &TenantContext,
        definition: WorkflowDefinition,
    ) -> Result<WorkflowDefinition> {
        self.workflows.create(ctx, definition).await
    }

    pub async fn update_definition(
        &self,
        ctx: &TenantContext,
        definition: WorkflowDefinition,
    ) -> Result<WorkflowDefinition> {
        self.workflows.update(ctx, definition).await
    }

    /// Load a specific version, or the newest version when `version` is None
    pub async fn load_definition(
        &self,
        ctx: &TenantContext,
        workflow_id: &str,
        version: Option<u32>,
    ) -> Result<WorkflowDefinition> {
        match version {
            Some(version) => {
                self.workflows
                    .get_by_id(ctx, &format!("{}@{}", workflow_id, version))
                    .await
            }
            None => {
                let mut filter = Map::new();
                filter.insert("id".to_string(), json!(workflow_id));
                let options = FindOptions::sorted_desc("version").with_limit(1);
                // A point lookup by id behaves like get_by_id: platform
                // admins resolve it across tenants
                let mut found = if ctx.is_platform_admin {
                    self.workflows.find_all_tenants(ctx, filter, &options).await?
                } else {
                    self.workflows.find(ctx, filter, &options).await?
                };
                found
                    .pop()
                    .ok_or_else(|| FlowForgeError::not_found("Workflow", workflow_id))
            }
        }
    }

    pub async fn list_definitions(
        &self,
        ctx: &TenantContext,
        filter: Map<String, Value>,
        options: &FindOptions,
    ) -> Result<Vec<WorkflowDefinition>> {
        self.workflows.find(ctx, filter, options).await
    }

    /// Archival is the workflow's soft delete: the document keeps its
    /// status so a start attempt can be rejected with a validation error
    /// instead of a not-found, and history stays queryable
    pub async fn archive_definition(
        &self,
        ctx: &TenantContext,
        workflow_id: &str,
        version: u32,
    ) -> Result<WorkflowDefinition> {
        let mut definition = self
            .workflows
            .get_by_id(ctx, &format!("{}@{}", workflow_id, version))
            .await?;
        if definition.status == crate::models::WorkflowStatus::Archived {
            return Err(FlowForgeError::Conflict(format!(
                "workflow '{}' is already archived",
                workflow_id
            )));
        }
        definition.status = crate::models::WorkflowStatus::Archived;
        self.workflows
            .update_with(
                ctx,
                definition,
                AuditMode::Custom(super::AuditOverride {
                    event_type: AuditEventType::Delete,
                    resource_type: WorkflowDefinition::RESOURCE_TYPE.to_string(),
                    resource_id: format!("{}@{}", workflow_id, version),
                    metadata: json!({"archived": true}),
                }),
            )
            .await
    }

    // -- executions -----------------------------------------------------------

    /// Create the execution record together with its initial checkpoint C0
    /// and the Create audit event, all in one commit scope
    pub async fn create_execution(
        &self,
        ctx: &TenantContext,
        mut execution: Execution,
    ) -> Result<Execution> {
        execution.checkpoint_count = 1;
        let (execution, exec_op) = self.executions.prepare_insert(ctx, execution)?;
        let initial = Checkpoint::new(&execution, 0, None, Some("execution created".to_string()));
        let (_, checkpoint_op) = self.checkpoints.prepare_insert(ctx, initial)?;
        let event = AuditEvent::new(
            AuditEventType::Create,
            Execution::RESOURCE_TYPE,
            execution.execution_id.clone(),
            ctx,
        )
        .for_tenant(execution.envelope.tenant_id.clone())
        .with_metadata(json!({
            "workflow_id": execution.workflow_id,
            "workflow_version": execution.workflow_version,
        }));
        let event_op = self.audit.event_op(&event)?;

        self.executions
            .commit(vec![exec_op, checkpoint_op, event_op])
            .await?;
        self.audit.count_recorded(1);
        Ok(execution)
    }

    pub async fn load_execution(&self, ctx: &TenantContext, execution_id: &str) -> Result<Execution> {
        self.executions.get_by_id(ctx, execution_id).await
    }

    pub async fn list_executions(
        &self,
        ctx: &TenantContext,
        workflow_id: Option<&str>,
        options: &FindOptions,
    ) -> Result<Vec<Execution>> {
        let mut filter = Map::new();
        if let Some(workflow_id) = workflow_id {
            filter.insert("workflow_id".to_string(), json!(workflow_id));
        }
        self.executions.find(ctx, filter, options).await
    }

    /// One atomic engine step: persist the post-merge execution, append its
    /// checkpoint and record the state-transition audit event
    pub async fn append_step(
        &self,
        ctx: &TenantContext,
        execution: &Execution,
        checkpoint: Checkpoint,
        step_metadata: Value,
    ) -> Result<Checkpoint> {
        let (_, exec_op) = self.executions.prepare_replace(ctx, execution.clone())?;
        let (checkpoint, checkpoint_op) = self.checkpoints.prepare_insert(ctx, checkpoint)?;
        let event = AuditEvent::new(
            AuditEventType::StateTransition,
            Execution::RESOURCE_TYPE,
            execution.execution_id.clone(),
            ctx,
        )
        .for_tenant(execution.envelope.tenant_id.clone())
        .with_metadata(step_metadata);
        let event_op = self.audit.event_op(&event)?;

        self.executions
            .commit(vec![exec_op, checkpoint_op, event_op])
            .await?;
        self.audit.count_recorded(1);
        Ok(checkpoint)
    }

    /// Persist an execution status change, optionally with audit events in
    /// the same commit scope (pause/resume pass none; cancel and failure
    /// record state-transition and error events)
    pub async fn update_execution(
        &self,
        ctx: &TenantContext,
        execution: &Execution,
        events: Vec<AuditEvent>,
    ) -> Result<()> {
        let (_, exec_op) = self.executions.prepare_replace(ctx, execution.clone())?;
        let mut ops: Vec<StoreOp> = vec![exec_op];
        let recorded = events.len();
        for event in &events {
            ops.push(self.audit.event_op(event)?);
        }
        self.executions.commit(ops).await?;
        self.audit.count_recorded(recorded);
        Ok(())
    }

    /// Fold a completed execution into the definition's aggregate stats.
    /// Audited as part of the completing step's state-transition event.
    pub async fn record_workflow_completion(
        &self,
        ctx: &TenantContext,
        workflow_id: &str,
        version: u32,
        duration_ms: u64,
    ) -> Result<()> {
        let mut definition = self
            .workflows
            .get_by_id(ctx, &format!("{}@{}", workflow_id, version))
            .await?;
        definition.record_execution(duration_ms);
        self.workflows
            .update_with(ctx, definition, AuditMode::Covered)
            .await?;
        Ok(())
    }

    /// Executions to rehydrate after a process restart
    pub async fn recovery_candidates(&self, ctx: &TenantContext) -> Result<Vec<Execution>> {
        let mut filter = Map::new();
        filter.insert(
            "status".to_string(),
            json!({"$in": [ExecutionStatus::Running, ExecutionStatus::Paused]}),
        );
        self.executions
            .find_all_tenants(ctx, filter, &FindOptions::default())
            .await
    }

    // -- checkpoints ----------------------------------------------------------

    /// Checkpoints are owned by their execution; reads behave like point
    /// lookups, so platform admins resolve them across tenants
    async fn find_checkpoints(
        &self,
        ctx: &TenantContext,
        filter: Map<String, Value>,
        options: &FindOptions,
    ) -> Result<Vec<Checkpoint>> {
        if ctx.is_platform_admin {
            self.checkpoints.find_all_tenants(ctx, filter, options).await
        } else {
            self.checkpoints.find(ctx, filter, options).await
        }
    }

    pub async fn load_latest_checkpoint(
        &self,
        ctx: &TenantContext,
        execution_id: &str,
    ) -> Result<Option<Checkpoint>> {
        let mut filter = Map::new();
        filter.insert("execution_id".to_string(), json!(execution_id));
        let mut found = self
            .find_checkpoints(
                ctx,
                filter,
                &FindOptions::sorted_desc("sequence_number").with_limit(1),
            )
            .await?;
        Ok(found.pop())
    }

    pub async fn list_checkpoints(
        &self,
        ctx: &TenantContext,
        execution_id: &str,
        from_sequence: u64,
    ) -> Result<Vec<Checkpoint>> {
        let mut filter = Map::new();
        filter.insert("execution_id".to_string(), json!(execution_id));
        filter.insert("sequence_number".to_string(), json!({"$gte": from_sequence}));
        self.find_checkpoints(ctx, filter, &FindOptions::sorted_asc("sequence_number"))
            .await
    }

    // -- audit ----------------------------------------------------------------

    pub async fn append_audit_event(&self, event: AuditEvent) -> Result<()> {
        self.audit.record(event).await
    }
}
