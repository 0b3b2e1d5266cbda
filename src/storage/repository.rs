// Tenant-scoped repository - the contract every persistent write flows through

//! # Repository Layer
//!
//! Generic CRUD over any [`TenantDocument`]. Every call takes a
//! [`TenantContext`] and
//!
//! - injects `tenant_id`, `created_at`, `created_by` on create
//! - verifies prior tenant ownership on update and diffs before/after
//! - soft-deletes (tombstone markers, never removal)
//! - composes every find with `{tenant_id, deleted != true}`
//! - returns not-found (never forbidden) for cross-tenant hits, so another
//!   tenant's resources cannot be existence-probed
//! - commits each write atomically with its audit event
//!
//! Platform-admin contexts relax the tenant filter but still stamp their
//! `user_id` on audit events.

use chrono::Utc;
use serde_json::{json, Map, Value};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::metrics::Metrics;
use crate::models::audit::{AuditEvent, AuditEventType};
use crate::models::{TenantContext, TenantDocument};
use crate::{FlowForgeError, Result};

use super::{FindOptions, StoreManager, StoreOp};

/// Replaces the default audit event of a write
#[derive(Debug, Clone)]
pub struct AuditOverride {
    pub event_type: AuditEventType,
    pub resource_type: String,
    pub resource_id: String,
    pub metadata: Value,
}

/// How a write is audited
#[derive(Debug, Clone)]
pub enum AuditMode {
    /// Default event for the operation (Create/Update/Delete)
    Record,
    /// Caller-supplied event in the same commit scope
    Custom(AuditOverride),
    /// The caller has already put an event for this commit scope into the
    /// batch (engine steps write one StateTransition event covering the
    /// checkpoint and the execution update)
    Covered,
}

/// Generic tenant-scoped CRUD for one document type
pub struct Repository<T: TenantDocument> {
    manager: Arc<StoreManager>,
    metrics: Arc<Metrics>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: TenantDocument> Clone for Repository<T> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            metrics: self.metrics.clone(),
            _marker: PhantomData,
        }
    }
}

fn to_doc<T: TenantDocument>(doc: &T) -> Result<Value> {
    Ok(serde_json::to_value(doc)?)
}

fn from_doc<T: TenantDocument>(value: Value) -> Result<T> {
    Ok(serde_json::from_value(value)?)
}

fn audit_op(event: &AuditEvent) -> Result<StoreOp> {
    Ok(StoreOp::Insert {
        collection: AuditEvent::COLLECTION,
        id: event.doc_id(),
        doc: serde_json::to_value(event)?,
    })
}

/// Shallow field diff for update audit events
fn changed_fields(before: &Value, after: &Value) -> Vec<String> {
    let (Some(before), Some(after)) = (before.as_object(), after.as_object()) else {
        return Vec::new();
    };
    let mut changed: Vec<String> = before
        .iter()
        .filter(|(key, value)| after.get(key.as_str()) != Some(*value))
        .map(|(key, _)| (*key).clone())
        .collect();
    for key in after.keys() {
        if !before.contains_key(key) && !changed.contains(key) {
            changed.push(key.clone());
        }
    }
    changed.sort();
    changed
}

fn map_commit_error(err: FlowForgeError, resource: &'static str, id: &str) -> FlowForgeError {
    match &err {
        FlowForgeError::Storage(inner) if inner.to_string().contains("duplicate id") => {
            FlowForgeError::Conflict(format!("{} '{}' already exists", resource, id))
        }
        _ => err,
    }
}

impl<T: TenantDocument> Repository<T> {
    pub fn new(manager: Arc<StoreManager>, metrics: Arc<Metrics>) -> Self {
        Self {
            manager,
            metrics,
            _marker: PhantomData,
        }
    }

    /// The filter every tenant-scoped read is composed with
    fn scope_filter(&self, ctx: &TenantContext, extra: Map<String, Value>) -> Value {
        let mut filter = extra;
        filter.insert("deleted".to_string(), json!({"$ne": true}));
        if !ctx.is_platform_admin {
            filter.insert("tenant_id".to_string(), json!(ctx.tenant_id));
        }
        Value::Object(filter)
    }

    /// Create with the default Create audit event
    pub async fn create(&self, ctx: &TenantContext, doc: T) -> Result<T> {
        self.create_with(ctx, doc, AuditMode::Record).await
    }

    pub async fn create_with(&self, ctx: &TenantContext, mut doc: T, mode: AuditMode) -> Result<T> {
        let now = Utc::now();
        {
            let envelope = doc.envelope_mut();
            // Non-admin writes are always bound to the caller's tenant;
            // platform admins may create on behalf of another tenant
            if !ctx.is_platform_admin || envelope.tenant_id.is_empty() {
                envelope.tenant_id = ctx.tenant_id.clone();
            }
            envelope.created_at = now;
            envelope.updated_at = now;
            envelope.created_by = ctx.user_id.clone();
            envelope.updated_by = ctx.user_id.clone();
            envelope.deleted = false;
            envelope.deleted_at = None;
            envelope.deleted_by = None;
        }
        let id = doc.doc_id();
        let raw = to_doc(&doc)?;

        let mut ops = vec![StoreOp::Insert {
            collection: T::COLLECTION,
            id: id.clone(),
            doc: raw.clone(),
        }];
        self.push_audit(
            &mut ops,
            ctx,
            mode,
            AuditEvent::new(AuditEventType::Create, T::RESOURCE_TYPE, id.clone(), ctx)
                .for_tenant(doc.envelope().tenant_id.clone())
                .with_diff(None, Some(raw)),
        )?;

        self.commit(ops)
            .await
            .map_err(|err| map_commit_error(err, T::RESOURCE_TYPE, &id))?;
        Ok(doc)
    }

    /// Tenant-scoped point read. Cross-tenant and soft-deleted documents are
    /// indistinguishable from absent ones.
    pub async fn get_by_id(&self, ctx: &TenantContext, id: &str) -> Result<T> {
        let lease = self.manager.acquire().await?;
        let raw = lease
            .store()
            .find_one(T::COLLECTION, id)
            .await
            .map_err(FlowForgeError::Storage)?;
        drop(lease);
        let raw = raw.ok_or_else(|| FlowForgeError::not_found(T::RESOURCE_TYPE, id))?;
        let doc: T = from_doc(raw)?;
        if doc.envelope().deleted || !ctx.can_access_tenant(&doc.envelope().tenant_id) {
            return Err(FlowForgeError::not_found(T::RESOURCE_TYPE, id));
        }
        Ok(doc)
    }

    /// Tenant-scoped list. Platform admins see across tenants only through
    /// [`Repository::find_all_tenants`].
    pub async fn find(
        &self,
        ctx: &TenantContext,
        mut extra: Map<String, Value>,
        options: &FindOptions,
    ) -> Result<Vec<T>> {
        if ctx.is_platform_admin {
            // Platform admins default to their own tenant unless they ask
            extra.insert("tenant_id".to_string(), json!(ctx.tenant_id));
        }
        let filter = self.scope_filter(ctx, extra);
        self.find_raw(&filter, options).await
    }

    /// Cross-tenant list, platform admin only
    pub async fn find_all_tenants(
        &self,
        ctx: &TenantContext,
        extra: Map<String, Value>,
        options: &FindOptions,
    ) -> Result<Vec<T>> {
        if !ctx.is_platform_admin {
            return Err(FlowForgeError::Forbidden(
                "cross-tenant queries require platform admin".to_string(),
            ));
        }
        let filter = self.scope_filter(ctx, extra);
        self.find_raw(&filter, options).await
    }

    async fn find_raw(&self, filter: &Value, options: &FindOptions) -> Result<Vec<T>> {
        let lease = self.manager.acquire().await?;
        let docs = lease
            .store()
            .find(T::COLLECTION, filter, options)
            .await
            .map_err(FlowForgeError::Storage)?;
        drop(lease);
        docs.into_iter().map(from_doc).collect()
    }

    pub async fn count(&self, ctx: &TenantContext, extra: Map<String, Value>) -> Result<u64> {
        let filter = self.scope_filter(ctx, extra);
        let lease = self.manager.acquire().await?;
        lease
            .store()
            .count(T::COLLECTION, &filter)
            .await
            .map_err(FlowForgeError::Storage)
    }

    /// Update with the default Update audit event carrying `{before, after}`
    pub async fn update(&self, ctx: &TenantContext, doc: T) -> Result<T> {
        self.update_with(ctx, doc, AuditMode::Record).await
    }

    pub async fn update_with(&self, ctx: &TenantContext, mut doc: T, mode: AuditMode) -> Result<T> {
        let id = doc.doc_id();
        // Ownership check against the prior document; also yields `before`
        let prior = self.get_by_id(ctx, &id).await?;
        let before = to_doc(&prior)?;
        {
            let prior_env = prior.envelope();
            let envelope = doc.envelope_mut();
            envelope.tenant_id = prior_env.tenant_id.clone();
            envelope.created_at = prior_env.created_at;
            envelope.created_by = prior_env.created_by.clone();
            envelope.deleted = prior_env.deleted;
            envelope.deleted_at = prior_env.deleted_at;
            envelope.deleted_by = prior_env.deleted_by.clone();
            envelope.updated_at = Utc::now();
            envelope.updated_by = ctx.user_id.clone();
        }
        let after = to_doc(&doc)?;

        let mut ops = vec![StoreOp::Replace {
            collection: T::COLLECTION,
            id: id.clone(),
            doc: after.clone(),
        }];
        let changed = changed_fields(&before, &after);
        self.push_audit(
            &mut ops,
            ctx,
            mode,
            AuditEvent::new(AuditEventType::Update, T::RESOURCE_TYPE, id, ctx)
                .for_tenant(doc.envelope().tenant_id.clone())
                .with_diff(Some(before), Some(after))
                .with_metadata(json!({ "changed_fields": changed })),
        )?;

        self.commit(ops).await?;
        Ok(doc)
    }

    /// Soft delete: tombstone markers plus a Delete audit event
    pub async fn delete(&self, ctx: &TenantContext, id: &str) -> Result<T> {
        let mut doc = self.get_by_id(ctx, id).await?;
        let before = to_doc(&doc)?;
        {
            let envelope = doc.envelope_mut();
            envelope.deleted = true;
            envelope.deleted_at = Some(Utc::now());
            envelope.deleted_by = Some(ctx.user_id.clone());
            envelope.updated_at = Utc::now();
            envelope.updated_by = ctx.user_id.clone();
        }
        let after = to_doc(&doc)?;

        let mut ops = vec![StoreOp::Replace {
            collection: T::COLLECTION,
            id: id.to_string(),
            doc: after,
        }];
        self.push_audit(
            &mut ops,
            ctx,
            AuditMode::Record,
            AuditEvent::new(AuditEventType::Delete, T::RESOURCE_TYPE, id, ctx)
                .for_tenant(doc.envelope().tenant_id.clone())
                .with_diff(Some(before), None),
        )?;

        self.commit(ops).await?;
        Ok(doc)
    }

    fn push_audit(
        &self,
        ops: &mut Vec<StoreOp>,
        ctx: &TenantContext,
        mode: AuditMode,
        default_event: AuditEvent,
    ) -> Result<()> {
        let event = match mode {
            AuditMode::Covered => return Ok(()),
            AuditMode::Record => default_event,
            AuditMode::Custom(custom) => AuditEvent::new(
                custom.event_type,
                custom.resource_type,
                custom.resource_id,
                ctx,
            )
            .for_tenant(default_event.envelope.tenant_id.clone())
            .with_metadata(custom.metadata),
        };
        ops.push(audit_op(&event)?);
        self.metrics.audit_events_total.inc();
        Ok(())
    }

    /// Stamp a fresh envelope and produce the insert op without committing.
    /// Lets [`super::ExecutionStore`] put several repository-prepared writes
    /// into one commit scope.
    pub(crate) fn prepare_insert(&self, ctx: &TenantContext, mut doc: T) -> Result<(T, StoreOp)> {
        let now = Utc::now();
        {
            let envelope = doc.envelope_mut();
            if !ctx.is_platform_admin || envelope.tenant_id.is_empty() {
                envelope.tenant_id = ctx.tenant_id.clone();
            }
            envelope.created_at = now;
            envelope.updated_at = now;
            envelope.created_by = ctx.user_id.clone();
            envelope.updated_by = ctx.user_id.clone();
            envelope.deleted = false;
        }
        let op = StoreOp::Insert {
            collection: T::COLLECTION,
            id: doc.doc_id(),
            doc: to_doc(&doc)?,
        };
        Ok((doc, op))
    }

    /// Stamp update markers and produce the replace op without committing.
    /// The caller must have loaded the document through this repository, so
    /// the tenant ownership on the envelope is already verified.
    pub(crate) fn prepare_replace(&self, ctx: &TenantContext, mut doc: T) -> Result<(T, StoreOp)> {
        {
            let envelope = doc.envelope_mut();
            envelope.updated_at = Utc::now();
            envelope.updated_by = ctx.user_id.clone();
        }
        let op = StoreOp::Replace {
            collection: T::COLLECTION,
            id: doc.doc_id(),
            doc: to_doc(&doc)?,
        };
        Ok((doc, op))
    }

    /// Commit a batch through the pool. Exposed to [`super::ExecutionStore`]
    /// so an engine step can combine execution update, checkpoint append and
    /// audit event in one commit scope.
    pub(crate) async fn commit(&self, ops: Vec<StoreOp>) -> Result<()> {
        let lease = self.manager.acquire().await?;
        lease
            .store()
            .commit(ops)
            .await
            .map_err(FlowForgeError::Storage)
    }
}
