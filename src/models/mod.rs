// Core domain models for FlowForge
// Persistent documents, the tenant context and the expression language

//! # Domain Models
//!
//! Every persistent document embeds a [`DocumentEnvelope`] (tenant ownership,
//! audit timestamps, soft-delete markers) and implements [`TenantDocument`] so
//! the repository layer can enforce isolation generically. The models carry no
//! storage or HTTP concerns; those live in `storage` and `api`.

pub mod audit;
pub mod context;
pub mod execution;
pub mod expression;
pub mod identity;
pub mod workflow;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use audit::{AuditEvent, AuditEventType};
pub use context::TenantContext;
pub use execution::{Checkpoint, Execution, ExecutionError, ExecutionStatus};
pub use expression::Expression;
pub use identity::{Membership, Tenant, User};
pub use workflow::{
    AgentSpec, Connection, OnError, StateField, StateFieldType, WorkflowDefinition, WorkflowStatus,
};

/// Common persistence envelope carried by every application document.
///
/// Flattened into the stored JSON so the document store can filter on
/// `tenant_id` and `deleted` without knowing the concrete type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentEnvelope {
    pub tenant_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_by: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_by: Option<String>,
}

impl DocumentEnvelope {
    /// Fresh envelope for a document about to be created.
    ///
    /// The repository layer overwrites these fields on `create`; models call
    /// this so half-constructed documents still satisfy the invariant that
    /// `tenant_id` is never empty.
    pub fn new(tenant_id: impl Into<String>, actor: impl Into<String>) -> Self {
        let now = Utc::now();
        let actor = actor.into();
        Self {
            tenant_id: tenant_id.into(),
            created_at: now,
            updated_at: now,
            created_by: actor.clone(),
            updated_by: actor,
            deleted: false,
            deleted_at: None,
            deleted_by: None,
        }
    }
}

/// Contract between a persistent document and the tenant-scoped repository
pub trait TenantDocument: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Collection the documents of this type live in
    const COLLECTION: &'static str;

    /// Human-facing resource type used in audit events and error messages
    const RESOURCE_TYPE: &'static str;

    /// Primary key, unique within the collection
    fn doc_id(&self) -> String;

    fn envelope(&self) -> &DocumentEnvelope;

    fn envelope_mut(&mut self) -> &mut DocumentEnvelope;
}
