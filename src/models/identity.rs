// Identity documents - users, tenants and the memberships binding them

use serde::{Deserialize, Serialize};

use super::{DocumentEnvelope, TenantDocument};

/// Tenant id that owns platform-level documents (user accounts)
pub const PLATFORM_TENANT: &str = "platform";

/// A user account. Accounts are platform-owned; per-tenant authorization
/// comes from [`Membership`] documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub email: String,
    pub display_name: String,
    /// Base64 salted SHA-256 digest
    pub password_digest: String,
    pub password_salt: String,
    #[serde(default)]
    pub is_platform_admin: bool,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(flatten)]
    pub envelope: DocumentEnvelope,
}

fn default_active() -> bool {
    true
}

impl TenantDocument for User {
    const COLLECTION: &'static str = "users";
    const RESOURCE_TYPE: &'static str = "User";

    fn doc_id(&self) -> String {
        self.user_id.clone()
    }

    fn envelope(&self) -> &DocumentEnvelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut DocumentEnvelope {
        &mut self.envelope
    }
}

/// A tenant (customer organization)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub tenant_id: String,
    pub name: String,
    #[serde(default = "default_active")]
    pub active: bool,
    /// Per-tenant override of the request rate limit, requests per window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_window: Option<u64>,
    /// Audit retention; engine default applies when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_retention_days: Option<u32>,
    #[serde(flatten)]
    pub envelope: DocumentEnvelope,
}

impl TenantDocument for Tenant {
    const COLLECTION: &'static str = "tenants";
    const RESOURCE_TYPE: &'static str = "Tenant";

    fn doc_id(&self) -> String {
        self.tenant_id.clone()
    }

    fn envelope(&self) -> &DocumentEnvelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut DocumentEnvelope {
        &mut self.envelope
    }
}

/// Binds a user to a tenant with roles and permissions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    pub membership_id: String,
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub is_tenant_admin: bool,
    #[serde(flatten)]
    pub envelope: DocumentEnvelope,
}

impl Membership {
    pub fn new(
        user_id: impl Into<String>,
        tenant_id: impl Into<String>,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            membership_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            roles: vec!["member".to_string()],
            permissions: Vec::new(),
            is_tenant_admin: false,
            envelope: DocumentEnvelope::new(tenant_id, created_by),
        }
    }

    /// Tenant this membership belongs to (owned by that tenant's scope)
    pub fn tenant_id(&self) -> &str {
        &self.envelope.tenant_id
    }
}

impl TenantDocument for Membership {
    const COLLECTION: &'static str = "memberships";
    const RESOURCE_TYPE: &'static str = "Membership";

    fn doc_id(&self) -> String {
        self.membership_id.clone()
    }

    fn envelope(&self) -> &DocumentEnvelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut DocumentEnvelope {
        &mut self.envelope
    }
}
