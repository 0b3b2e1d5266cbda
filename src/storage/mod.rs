// Storage layer - document store abstraction, pooling, repositories, audit

//! # Storage Layer
//!
//! Three levels, each only talking to the one below:
//!
//! - [`DocumentStore`]: collection-level JSON document operations with a
//!   small filter language (`$ne`, `$gt(e)`, `$lt(e)`, `$in`). The in-memory
//!   backend in `memory` is the default for tests and single-node runs.
//! - [`StoreManager`] (`pool`): the process singleton owning the backend,
//!   the connection permits, the retry-connect loop and the health monitor.
//! - [`Repository`] (`repository`) and [`ExecutionStore`] (`store`): the
//!   tenant-scoped contract every engine and API write flows through, and
//!   the engine-facing persistence operations built on top of it.
//!
//! No application code constructs raw store queries that bypass the
//! repository's tenant/soft-delete injections.

pub mod audit;
pub mod memory;
pub mod pool;
pub mod repository;
pub mod store;

use async_trait::async_trait;
use serde_json::Value;

pub use audit::{AuditQuery, AuditTrail};
pub use memory::InMemoryDocumentStore;
pub use pool::{PoolStats, StoreHealth, StoreManager};
pub use repository::{AuditMode, AuditOverride, Repository};
pub use store::ExecutionStore;

/// One write of an atomic batch
#[derive(Debug, Clone)]
pub enum StoreOp {
    Insert {
        collection: &'static str,
        id: String,
        doc: Value,
    },
    Replace {
        collection: &'static str,
        id: String,
        doc: Value,
    },
}

/// Sort direction for [`FindOptions`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Pagination and ordering for `find`
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub limit: Option<usize>,
    pub offset: usize,
    pub sort: Option<(String, SortOrder)>,
}

impl FindOptions {
    pub fn sorted_desc(field: impl Into<String>) -> Self {
        Self {
            sort: Some((field.into(), SortOrder::Descending)),
            ..Default::default()
        }
    }

    pub fn sorted_asc(field: impl Into<String>) -> Self {
        Self {
            sort: Some((field.into(), SortOrder::Ascending)),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// Collection-level persistence contract.
///
/// Filters are flat JSON objects: a plain value means equality, an object
/// value may use `$ne`, `$gt`, `$gte`, `$lt`, `$lte` and `$in` operators.
/// All writes of one [`StoreOp`] batch share a commit scope.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn ping(&self) -> anyhow::Result<()>;

    /// Insert a new document; fails if the id already exists
    async fn insert(&self, collection: &'static str, id: &str, doc: Value) -> anyhow::Result<()>;

    /// Replace an existing document; returns false when the id is absent
    async fn replace(&self, collection: &'static str, id: &str, doc: Value)
        -> anyhow::Result<bool>;

    async fn find_one(&self, collection: &'static str, id: &str) -> anyhow::Result<Option<Value>>;

    async fn find(
        &self,
        collection: &'static str,
        filter: &Value,
        options: &FindOptions,
    ) -> anyhow::Result<Vec<Value>>;

    async fn count(&self, collection: &'static str, filter: &Value) -> anyhow::Result<u64>;

    /// Apply a batch atomically
    async fn commit(&self, ops: Vec<StoreOp>) -> anyhow::Result<()>;

    /// Hard-delete matching documents. Only the audit retention pruner uses
    /// this; application deletes are soft and go through the repository.
    async fn delete_many(&self, collection: &'static str, filter: &Value) -> anyhow::Result<u64>;

    async fn close(&self) -> anyhow::Result<()>;
}
