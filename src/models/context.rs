// Tenant context - the per-request identity flowing through every engine call

use serde::{Deserialize, Serialize};

/// Immutable identity and authorization value constructed by the auth gate.
///
/// Every repository and engine operation takes one of these; there is no
/// ambient/task-local fallback. A platform-admin context is tenant-unrestricted
/// (repositories relax the tenant filter but still record `user_id` on audit
/// events); all other contexts are bound to exactly one tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantContext {
    pub user_id: String,
    pub tenant_id: String,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    pub is_platform_admin: bool,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl TenantContext {
    /// Context for engine-internal work (recovery, monitors) that must still
    /// produce attributable audit events
    pub fn system(tenant_id: impl Into<String>) -> Self {
        Self {
            user_id: "system".to_string(),
            tenant_id: tenant_id.into(),
            roles: vec!["system".to_string()],
            permissions: Vec::new(),
            is_platform_admin: true,
            request_id: uuid::Uuid::new_v4().to_string(),
            ip_address: None,
            user_agent: None,
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.is_platform_admin || self.permissions.iter().any(|p| p == permission)
    }

    /// Whether this context may touch documents owned by `tenant_id`
    pub fn can_access_tenant(&self, tenant_id: &str) -> bool {
        self.is_platform_admin || self.tenant_id == tenant_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_admin_crosses_tenants() {
        let ctx = TenantContext::system("t1");
        assert!(ctx.can_access_tenant("t2"));
        assert!(ctx.has_permission("anything"));
    }

    #[test]
    fn regular_context_is_bound() {
        let ctx = TenantContext {
            user_id: "u1".to_string(),
            tenant_id: "t1".to_string(),
            roles: vec!["member".to_string()],
            permissions: vec!["workflows:read".to_string()],
            is_platform_admin: false,
            request_id: "r1".to_string(),
            ip_address: None,
            user_agent: None,
        };
        assert!(ctx.can_access_tenant("t1"));
        assert!(!ctx.can_access_tenant("t2"));
        assert!(ctx.has_permission("workflows:read"));
        assert!(!ctx.has_permission("workflows:write"));
    }
}
