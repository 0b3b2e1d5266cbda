// Audit trail - append-only event log with tenant-scoped querying

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::info;

use crate::metrics::Metrics;
use crate::models::audit::{AuditEvent, AuditEventType};
use crate::models::identity::Tenant;
use crate::models::{TenantContext, TenantDocument};
use crate::{FlowForgeError, Result};

use super::{FindOptions, StoreManager, StoreOp};

/// Engine-level default when a tenant has no `audit_retention_days` setting
pub const DEFAULT_RETENTION_DAYS: u32 = 365;

/// Filterable query over the audit log
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub event_type: Option<AuditEventType>,
    pub user_id: Option<String>,
    pub from: Option<chrono::DateTime<Utc>>,
    pub to: Option<chrono::DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: usize,
    /// Platform admin only: list across tenants
    pub all_tenants: bool,
}

/// Append-only writer and tenant-scoped reader for audit events.
///
/// Events are never updated; the only destructive operation is retention
/// pruning, which hard-deletes events older than the tenant's configured
/// window.
#[derive(Clone)]
pub struct AuditTrail {
    manager: Arc<StoreManager>,
    metrics: Arc<Metrics>,
}

impl AuditTrail {
    pub fn new(manager: Arc<StoreManager>, metrics: Arc<Metrics>) -> Self {
        Self { manager, metrics }
    }

    /// Append one event outside any other commit scope
    pub async fn record(&self, event: AuditEvent) -> Result<()> {
        let lease = self.manager.acquire().await?;
        lease
            .store()
            .insert(
                AuditEvent::COLLECTION,
                &event.doc_id(),
                serde_json::to_value(&event)?,
            )
            .await
            .map_err(FlowForgeError::Storage)?;
        self.metrics.audit_events_total.inc();
        Ok(())
    }

    /// Build the [`StoreOp`] for an event so callers can put it into a
    /// larger commit scope; call [`AuditTrail::count_recorded`] once the
    /// batch commits
    pub fn event_op(&self, event: &AuditEvent) -> Result<StoreOp> {
        Ok(StoreOp::Insert {
            collection: AuditEvent::COLLECTION,
            id: event.doc_id(),
            doc: serde_json::to_value(event)?,
        })
    }

    pub fn count_recorded(&self, events: usize) {
        for _ in 0..events {
            self.metrics.audit_events_total.inc();
        }
    }

    /// Tenant-scoped audit listing, newest first
    pub async fn query(&self, ctx: &TenantContext, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        if query.all_tenants && !ctx.is_platform_admin {
            return Err(FlowForgeError::Forbidden(
                "cross-tenant audit queries require platform admin".to_string(),
            ));
        }
        let mut filter = Map::new();
        if !(query.all_tenants && ctx.is_platform_admin) {
            filter.insert("tenant_id".to_string(), json!(ctx.tenant_id));
        }
        if let Some(resource_type) = &query.resource_type {
            filter.insert("resource_type".to_string(), json!(resource_type));
        }
        if let Some(resource_id) = &query.resource_id {
            filter.insert("resource_id".to_string(), json!(resource_id));
        }
        if let Some(event_type) = &query.event_type {
            filter.insert("event_type".to_string(), serde_json::to_value(event_type)?);
        }
        if let Some(user_id) = &query.user_id {
            filter.insert("user_id".to_string(), json!(user_id));
        }
        // RFC 3339 timestamps in UTC order lexicographically
        let mut range = Map::new();
        if let Some(from) = &query.from {
            range.insert("$gte".to_string(), json!(from));
        }
        if let Some(to) = &query.to {
            range.insert("$lte".to_string(), json!(to));
        }
        if !range.is_empty() {
            filter.insert("timestamp".to_string(), Value::Object(range));
        }

        let options = FindOptions::sorted_desc("timestamp")
            .with_limit(query.limit.unwrap_or(100))
            .with_offset(query.offset);
        let lease = self.manager.acquire().await?;
        let docs = lease
            .store()
            .find(AuditEvent::COLLECTION, &Value::Object(filter), &options)
            .await
            .map_err(FlowForgeError::Storage)?;
        drop(lease);
        docs.into_iter()
            .map(|doc| Ok(serde_json::from_value(doc)?))
            .collect()
    }

    /// Hard-delete events older than the tenant's retention window
    pub async fn prune_expired(&self, tenant: &Tenant) -> Result<u64> {
        let retention_days = tenant.audit_retention_days.unwrap_or(DEFAULT_RETENTION_DAYS);
        let cutoff = Utc::now() - ChronoDuration::days(retention_days as i64);
        let filter = json!({
            "tenant_id": tenant.tenant_id,
            "timestamp": {"$lt": cutoff}
        });
        let lease = self.manager.acquire().await?;
        let removed = lease
            .store()
            .delete_many(AuditEvent::COLLECTION, &filter)
            .await
            .map_err(FlowForgeError::Storage)?;
        if removed > 0 {
            info!(tenant = %tenant.tenant_id, removed, "pruned expired audit events");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::models::audit::AuditEvent;
    use crate::models::DocumentEnvelope;

    async fn trail() -> AuditTrail {
        let metrics = Arc::new(Metrics::new().unwrap());
        let manager = StoreManager::connect(Settings::default().store, metrics.clone())
            .await
            .unwrap();
        AuditTrail::new(manager, metrics)
    }

    fn event(ctx: &TenantContext, resource_id: &str, event_type: AuditEventType) -> AuditEvent {
        AuditEvent::new(event_type, "Workflow", resource_id, ctx)
    }

    #[tokio::test]
    async fn query_filters_by_resource_and_type() {
        let trail = trail().await;
        let ctx = TenantContext::system("t1");
        trail
            .record(event(&ctx, "wf-1", AuditEventType::Create).for_tenant("t1"))
            .await
            .unwrap();
        trail
            .record(event(&ctx, "wf-1", AuditEventType::Update).for_tenant("t1"))
            .await
            .unwrap();
        trail
            .record(event(&ctx, "wf-2", AuditEventType::Create).for_tenant("t1"))
            .await
            .unwrap();

        let member = TenantContext {
            is_platform_admin: false,
            ..TenantContext::system("t1")
        };
        let for_wf1 = trail
            .query(
                &member,
                &AuditQuery {
                    resource_id: Some("wf-1".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(for_wf1.len(), 2);

        let creates = trail
            .query(
                &member,
                &AuditQuery {
                    event_type: Some(AuditEventType::Create),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(creates.len(), 2);

        // Cross-tenant listing is platform-admin only
        let err = trail
            .query(
                &member,
                &AuditQuery {
                    all_tenants: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, crate::FlowForgeError::Forbidden(_)));
    }

    #[tokio::test]
    async fn prune_removes_only_expired_events() {
        let trail = trail().await;
        let ctx = TenantContext::system("t1");
        let mut old = event(&ctx, "wf-old", AuditEventType::Create).for_tenant("t1");
        old.timestamp = Utc::now() - ChronoDuration::days(10);
        trail.record(old).await.unwrap();
        trail
            .record(event(&ctx, "wf-new", AuditEventType::Create).for_tenant("t1"))
            .await
            .unwrap();

        let tenant = Tenant {
            tenant_id: "t1".to_string(),
            name: "T1".to_string(),
            active: true,
            rate_limit_per_window: None,
            audit_retention_days: Some(7),
            envelope: DocumentEnvelope::new("t1", "system"),
        };
        let removed = trail.prune_expired(&tenant).await.unwrap();
        assert_eq!(removed, 1);

        let remaining = trail
            .query(&ctx, &AuditQuery::default())
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].resource_id, "wf-new");
    }
}
