// FlowForge - multi-tenant workflow orchestration engine
// A metadata-driven DAG runtime with durable checkpointing and tenant-scoped persistence

//! # FlowForge Library
//!
//! FlowForge compiles declarative workflow definitions into executable DAGs of
//! agents and runs them with durable, append-only checkpointing. Every
//! operation is tenant-scoped: the auth gate produces a [`TenantContext`], the
//! repository layer enforces isolation and audit on every write, and the
//! execution engine records per-execution state for recovery.
//!
//! ## Core Components
//!
//! - [`models`]: domain documents (workflow definitions, executions,
//!   checkpoints, audit events, identities) and the safe expression language
//!   used by edge conditions
//! - [`engine`]: the graph compiler, agent registry and the execution engine
//! - [`storage`]: document store abstraction, the tenant-scoped repository
//!   layer and the pooled store manager
//! - [`auth`]: bearer token issuance/verification and tenant context loading
//! - [`api`]: the axum HTTP surface
//! - [`metrics`]: Prometheus registry shared across the process
//!
//! ## Data Flow
//!
//! ```text
//! HTTP request
//!   -> auth gate (TenantContext)
//!   -> repository / engine operation under that context
//!   -> engine traverses the compiled DAG invoking agents
//!   -> each step appends a checkpoint + audit event
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod engine;
pub mod metrics;
pub mod models;
pub mod storage;

use thiserror::Error;

/// Crate-wide error type.
///
/// Agent-level failures have their own taxonomy ([`engine::AgentError`]) that
/// the scheduler consumes internally; everything that crosses a public API
/// boundary is one of these variants. The HTTP layer maps them onto the
/// `{error: {code, message, details?}}` response shape.
#[derive(Error, Debug)]
pub enum FlowForgeError {
    /// Malformed input or schema violation, carries per-defect details
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        details: Vec<String>,
    },

    /// Missing, invalid or expired credentials
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated but not allowed
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Resource absent in tenant scope. Cross-tenant hits deliberately
    /// surface as this variant, never as Forbidden
    #[error("{resource} not found: {id}")]
    NotFound { resource: String, id: String },

    /// Version or uniqueness violation, or an invalid lifecycle transition
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Per-tenant quota exceeded
    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Storage-backend failures (connection loss, pool exhaustion)
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unrecoverable internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FlowForgeError {
    /// Shorthand for a validation error without per-field details
    pub fn validation(message: impl Into<String>) -> Self {
        FlowForgeError::Validation {
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        FlowForgeError::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }
}

impl From<std::io::Error> for FlowForgeError {
    fn from(err: std::io::Error) -> Self {
        FlowForgeError::Internal(err.to_string())
    }
}

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, FlowForgeError>;

// Re-export the types nearly every consumer needs
pub use models::context::TenantContext;
pub use models::execution::{Checkpoint, Execution, ExecutionStatus};
pub use models::workflow::{AgentSpec, Connection, WorkflowDefinition, WorkflowStatus};
