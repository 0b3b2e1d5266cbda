// Authentication - bearer tokens, credential checks, tenant context loading

//! # Auth & Tenant Context
//!
//! Bearer tokens are HS256 JWTs signed with the shared
//! `AUTH_SIGNING_SECRET`. Verification is one code path for every gate
//! variant; the variants differ only in the post-verification assertion
//! (see `api::middleware`). A verified token is turned into a fresh
//! [`TenantContext`] by loading the user and tenant records, so a disabled
//! account or tenant locks out existing tokens immediately.
//!
//! The platform-admin distinction is a flag in the token payload, not a
//! database lookup at request time.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::AuthSettings;
use crate::metrics::Metrics;
use crate::models::identity::{Membership, Tenant, User, PLATFORM_TENANT};
use crate::models::{DocumentEnvelope, TenantContext};
use crate::storage::{FindOptions, Repository, StoreManager};
use crate::{FlowForgeError, Result};

/// Tokens are refreshable up to this long past their expiry
pub const REFRESH_GRACE: Duration = Duration::from_secs(60 * 60);

/// JWT payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    pub email: String,
    pub tenant_id: String,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    #[serde(default)]
    pub platform_admin: bool,
    #[serde(default)]
    pub tenant_admin: bool,
    pub iat: u64,
    pub exp: u64,
}

/// Issues and verifies bearer tokens
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl TokenService {
    pub fn new(settings: &AuthSettings) -> Self {
        Self {
            encoding: EncodingKey::from_secret(settings.signing_secret.as_bytes()),
            decoding: DecodingKey::from_secret(settings.signing_secret.as_bytes()),
            ttl: settings.token_ttl,
        }
    }

    pub fn issue(&self, user: &User, membership: Option<&Membership>) -> Result<String> {
        let now = Utc::now().timestamp().max(0) as u64;
        let claims = Claims {
            sub: user.user_id.clone(),
            email: user.email.clone(),
            tenant_id: membership
                .map(|m| m.tenant_id().to_string())
                .unwrap_or_else(|| PLATFORM_TENANT.to_string()),
            roles: membership.map(|m| m.roles.clone()).unwrap_or_default(),
            permissions: membership.map(|m| m.permissions.clone()).unwrap_or_default(),
            platform_admin: user.is_platform_admin,
            tenant_admin: membership.map(|m| m.is_tenant_admin).unwrap_or(false),
            iat: now,
            exp: now + self.ttl.as_secs(),
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|err| FlowForgeError::Internal(format!("token encoding: {}", err)))
    }

    /// Strict verification: signature and expiry
    pub fn verify(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(token, &self.decoding, &Validation::new(Algorithm::HS256))
            .map(|data| data.claims)
            .map_err(|err| FlowForgeError::Unauthorized(format!("invalid token: {}", err)))
    }

    /// Refresh verification: signature must hold, expiry may lie within the
    /// grace window
    pub fn verify_for_refresh(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        let claims = decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|err| FlowForgeError::Unauthorized(format!("invalid token: {}", err)))?;
        let now = Utc::now().timestamp().max(0) as u64;
        if now > claims.exp + REFRESH_GRACE.as_secs() {
            return Err(FlowForgeError::Unauthorized(
                "token expired past the refresh grace period".to_string(),
            ));
        }
        Ok(claims)
    }
}

/// Salted SHA-256 digest, base64 encoded
pub fn hash_password(password: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    BASE64.encode(hasher.finalize())
}

pub fn generate_salt() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

/// User projection safe to return to clients
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicUser {
    pub user_id: String,
    pub email: String,
    pub display_name: String,
    pub is_platform_admin: bool,
}

impl From<&User> for PublicUser {
    fn from(user: &User) -> Self {
        Self {
            user_id: user.user_id.clone(),
            email: user.email.clone(),
            display_name: user.display_name.clone(),
            is_platform_admin: user.is_platform_admin,
        }
    }
}

/// Membership projection returned by login
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipSummary {
    pub tenant_id: String,
    pub roles: Vec<String>,
    pub is_tenant_admin: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    pub user: PublicUser,
    pub memberships: Vec<MembershipSummary>,
}

/// The auth gate: credentials, token lifecycle and context loading
pub struct AuthService {
    tokens: TokenService,
    users: Repository<User>,
    tenants: Repository<Tenant>,
    memberships: Repository<Membership>,
}

impl AuthService {
    pub fn new(manager: Arc<StoreManager>, metrics: Arc<Metrics>, settings: &AuthSettings) -> Self {
        Self {
            tokens: TokenService::new(settings),
            users: Repository::new(manager.clone(), metrics.clone()),
            tenants: Repository::new(manager.clone(), metrics.clone()),
            memberships: Repository::new(manager, metrics),
        }
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    /// Identity reads run under a synthetic platform context: login has no
    /// caller context yet, and memberships span tenants
    fn system_ctx() -> TenantContext {
        TenantContext::system(PLATFORM_TENANT)
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<User>> {
        let mut filter = Map::new();
        filter.insert("email".to_string(), json!(email));
        let mut users = self
            .users
            .find_all_tenants(&Self::system_ctx(), filter, &FindOptions::default().with_limit(1))
            .await?;
        Ok(users.pop())
    }

    async fn memberships_of(&self, user_id: &str) -> Result<Vec<Membership>> {
        let mut filter = Map::new();
        filter.insert("user_id".to_string(), json!(user_id));
        self.memberships
            .find_all_tenants(&Self::system_ctx(), filter, &FindOptions::default())
            .await
    }

    /// Verify credentials and issue a token bound to the user's first
    /// membership (platform admins without memberships get a platform token)
    pub async fn login(&self, email: &str, password: &str) -> Result<LoginResponse> {
        let user = self
            .user_by_email(email)
            .await?
            .filter(|user| user.active)
            .ok_or_else(|| FlowForgeError::Unauthorized("invalid credentials".to_string()))?;
        if hash_password(password, &user.password_salt) != user.password_digest {
            warn!(email, "login rejected: bad credentials");
            return Err(FlowForgeError::Unauthorized("invalid credentials".to_string()));
        }

        let memberships = self.memberships_of(&user.user_id).await?;
        let primary = memberships.first();
        if primary.is_none() && !user.is_platform_admin {
            return Err(FlowForgeError::Unauthorized(
                "user has no tenant membership".to_string(),
            ));
        }
        let token = self.tokens.issue(&user, primary)?;
        info!(user_id = %user.user_id, "login succeeded");
        Ok(LoginResponse {
            token,
            user: PublicUser::from(&user),
            memberships: memberships
                .iter()
                .map(|m| MembershipSummary {
                    tenant_id: m.tenant_id().to_string(),
                    roles: m.roles.clone(),
                    is_tenant_admin: m.is_tenant_admin,
                })
                .collect(),
        })
    }

    /// Exchange a (possibly just-expired) token for a fresh one
    pub async fn refresh(&self, token: &str) -> Result<String> {
        let claims = self.tokens.verify_for_refresh(token)?;
        let user = self
            .users
            .get_by_id(&Self::system_ctx(), &claims.sub)
            .await
            .map_err(|_| FlowForgeError::Unauthorized("user no longer exists".to_string()))?;
        if !user.active {
            return Err(FlowForgeError::Unauthorized("user is disabled".to_string()));
        }
        let memberships = self.memberships_of(&user.user_id).await?;
        let membership = memberships
            .iter()
            .find(|m| m.tenant_id() == claims.tenant_id);
        self.tokens.issue(&user, membership)
    }

    /// Issue a token bound to another tenant the user belongs to
    pub async fn switch_tenant(&self, claims: &Claims, tenant_id: &str) -> Result<String> {
        let user = self
            .users
            .get_by_id(&Self::system_ctx(), &claims.sub)
            .await
            .map_err(|_| FlowForgeError::Unauthorized("user no longer exists".to_string()))?;
        let memberships = self.memberships_of(&user.user_id).await?;
        let membership = memberships.iter().find(|m| m.tenant_id() == tenant_id);
        if membership.is_none() && !user.is_platform_admin {
            return Err(FlowForgeError::not_found("Tenant", tenant_id));
        }
        self.tokens.issue(&user, membership)
    }

    /// Turn verified claims into a fresh request context, re-checking that
    /// the user and tenant still exist and are active
    pub async fn context_for(
        &self,
        claims: &Claims,
        request_id: String,
        ip_address: Option<String>,
        user_agent: Option<String>,
    ) -> Result<TenantContext> {
        let system = Self::system_ctx();
        let user = self
            .users
            .get_by_id(&system, &claims.sub)
            .await
            .map_err(|_| FlowForgeError::Unauthorized("user no longer exists".to_string()))?;
        if !user.active {
            return Err(FlowForgeError::Unauthorized("user is disabled".to_string()));
        }
        if claims.tenant_id != PLATFORM_TENANT {
            let tenant = self
                .tenants
                .get_by_id(&system, &claims.tenant_id)
                .await
                .map_err(|_| FlowForgeError::Unauthorized("tenant no longer exists".to_string()))?;
            if !tenant.active {
                return Err(FlowForgeError::Unauthorized("tenant is disabled".to_string()));
            }
        }
        Ok(TenantContext {
            user_id: claims.sub.clone(),
            tenant_id: claims.tenant_id.clone(),
            roles: claims.roles.clone(),
            permissions: claims.permissions.clone(),
            is_platform_admin: claims.platform_admin,
            request_id,
            ip_address,
            user_agent,
        })
    }

    /// Per-tenant rate limit override, if the tenant configured one
    pub async fn rate_limit_override(&self, tenant_id: &str) -> Option<u64> {
        if tenant_id == PLATFORM_TENANT {
            return None;
        }
        self.tenants
            .get_by_id(&Self::system_ctx(), tenant_id)
            .await
            .ok()
            .and_then(|tenant| tenant.rate_limit_per_window)
    }

    /// Development convenience: an empty users collection gets a platform
    /// admin, a demo tenant and a demo member
    pub async fn seed_default_identities(&self) -> Result<()> {
        let system = Self::system_ctx();
        if self.users.count(&system, Map::new()).await? > 0 {
            return Ok(());
        }

        let tenant = Tenant {
            tenant_id: "demo".to_string(),
            name: "Demo Tenant".to_string(),
            active: true,
            rate_limit_per_window: None,
            audit_retention_days: None,
            envelope: DocumentEnvelope::new("demo", "system"),
        };
        self.tenants.create(&system, tenant).await?;

        let admin_salt = generate_salt();
        let admin = User {
            user_id: "admin".to_string(),
            email: "admin@flowforge.local".to_string(),
            display_name: "Platform Admin".to_string(),
            password_digest: hash_password("admin", &admin_salt),
            password_salt: admin_salt,
            is_platform_admin: true,
            active: true,
            envelope: DocumentEnvelope::new(PLATFORM_TENANT, "system"),
        };
        self.users.create(&system, admin).await?;

        let member_salt = generate_salt();
        let member = User {
            user_id: "inspector".to_string(),
            email: "inspector@flowforge.local".to_string(),
            display_name: "Demo Inspector".to_string(),
            password_digest: hash_password("inspector", &member_salt),
            password_salt: member_salt,
            is_platform_admin: false,
            active: true,
            envelope: DocumentEnvelope::new(PLATFORM_TENANT, "system"),
        };
        self.users.create(&system, member).await?;

        let mut membership = Membership::new("inspector", "demo", "system");
        membership.is_tenant_admin = true;
        membership.roles = vec!["member".to_string(), "admin".to_string()];
        membership.permissions = vec![
            "workflows:read".to_string(),
            "workflows:write".to_string(),
            "workflows:execute".to_string(),
        ];
        self.memberships.create(&system, membership).await?;

        info!("seeded default identities (admin, inspector / demo tenant)");
        Ok(())
    }
}
