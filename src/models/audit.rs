// Audit events - append-only trail keyed by actor, resource and tenant

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{DocumentEnvelope, TenantDocument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditEventType {
    Create,
    Update,
    Delete,
    StateTransition,
}

/// Append-only audit record. Never updated or deleted by application code;
/// retention is a tenant-level setting applied by explicit pruning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub event_type: AuditEventType,
    pub resource_type: String,
    pub resource_id: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
    #[serde(default)]
    pub metadata: Value,
    pub request_id: String,
    #[serde(flatten)]
    pub envelope: DocumentEnvelope,
}

impl AuditEvent {
    pub fn new(
        event_type: AuditEventType,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        ctx: &crate::models::TenantContext,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type,
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            user_id: ctx.user_id.clone(),
            timestamp: Utc::now(),
            before: None,
            after: None,
            metadata: Value::Null,
            request_id: ctx.request_id.clone(),
            envelope: DocumentEnvelope::new(ctx.tenant_id.clone(), ctx.user_id.clone()),
        }
    }

    /// Audit event owned by a specific tenant, regardless of the acting
    /// context's home tenant (platform admins act across tenants)
    pub fn for_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.envelope.tenant_id = tenant_id.into();
        self
    }

    pub fn with_diff(mut self, before: Option<Value>, after: Option<Value>) -> Self {
        self.before = before;
        self.after = after;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

impl TenantDocument for AuditEvent {
    const COLLECTION: &'static str = "audit_events";
    const RESOURCE_TYPE: &'static str = "AuditEvent";

    fn doc_id(&self) -> String {
        self.event_id.clone()
    }

    fn envelope(&self) -> &DocumentEnvelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut DocumentEnvelope {
        &mut self.envelope
    }
}
