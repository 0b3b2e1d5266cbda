// API middleware - request ids, metrics, rate limiting and the auth gates

use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, MatchedPath, Request, State},
    http::{header, request::Parts, HeaderValue},
    middleware::Next,
    response::Response,
};
use dashmap::DashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::auth::Claims;
use crate::models::TenantContext;
use crate::{FlowForgeError, Result};

use super::{ApiError, AppState};

/// Correlation id attached to every request and echoed in the
/// `x-request-id` response header
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

pub async fn attach_request_id(mut request: Request, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    request.extensions_mut().insert(RequestId(request_id.clone()));
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// HTTP request duration histogram, labeled by method, matched route and
/// status
pub async fn track_metrics(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let response = next.run(request).await;
    state
        .metrics
        .http_request_duration
        .with_label_values(&[method.as_str(), &route, response.status().as_str()])
        .observe(started.elapsed().as_secs_f64());
    response
}

// ---------------------------------------------------------------------------
// Rate limiting

struct Window {
    index: u64,
    previous: u64,
    current: u64,
}

/// Sliding-window counter keyed by `(tenant, user, endpoint group)`.
///
/// The previous window's count is weighted by the unelapsed fraction of the
/// current window, which smooths bursts at window boundaries without
/// per-request timestamps.
pub struct RateLimiter {
    windows: DashMap<String, Window>,
    window: Duration,
    default_max: u64,
}

impl RateLimiter {
    pub fn new(window: Duration, default_max: u64) -> Self {
        Self {
            windows: DashMap::new(),
            window: window.max(Duration::from_millis(1)),
            default_max,
        }
    }

    /// Returns `Err(retry_after_secs)` when the quota is exhausted
    pub fn check(
        &self,
        tenant_id: &str,
        user_id: Option<&str>,
        endpoint_group: &str,
        max_override: Option<u64>,
    ) -> std::result::Result<(), u64> {
        let max = max_override.unwrap_or(self.default_max);
        let key = format!("{}:{}:{}", tenant_id, user_id.unwrap_or("-"), endpoint_group);
        let window_ms = self.window.as_millis() as u64;
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let index = now_ms / window_ms;
        let elapsed_fraction = (now_ms % window_ms) as f64 / window_ms as f64;

        let mut entry = self.windows.entry(key).or_insert(Window {
            index,
            previous: 0,
            current: 0,
        });
        if entry.index != index {
            let carried = if index == entry.index + 1 { entry.current } else { 0 };
            entry.previous = carried;
            entry.current = 0;
            entry.index = index;
        }
        let weighted = entry.current as f64 + entry.previous as f64 * (1.0 - elapsed_fraction);
        if weighted + 1.0 > max as f64 {
            let remaining_ms = window_ms - (now_ms % window_ms);
            return Err(remaining_ms.div_ceil(1000).max(1));
        }
        entry.current += 1;
        Ok(())
    }
}

/// First path segment, e.g. `workflows` for `/workflows/:id/execute`
pub fn endpoint_group(path: &str) -> &str {
    path.trim_start_matches('/')
        .split('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .unwrap_or("root")
}

// ---------------------------------------------------------------------------
// Auth gates
//
// One verification code path; each extractor differs only in its
// post-verification assertion.

fn bearer_token(parts: &Parts) -> Result<String> {
    let header = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| FlowForgeError::Unauthorized("missing bearer token".to_string()))?;
    header
        .strip_prefix("Bearer ")
        .map(str::to_string)
        .ok_or_else(|| FlowForgeError::Unauthorized("malformed authorization header".to_string()))
}

fn request_id_of(parts: &Parts) -> String {
    parts
        .extensions
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

async fn authenticate(parts: &mut Parts, state: &AppState) -> Result<(TenantContext, Claims)> {
    let token = bearer_token(parts)?;
    let claims = state.auth.tokens().verify(&token)?;
    let ip_address = parts
        .headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .map(|raw| raw.split(',').next().unwrap_or(raw).trim().to_string());
    let user_agent = parts
        .headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let ctx = state
        .auth
        .context_for(&claims, request_id_of(parts), ip_address, user_agent)
        .await?;

    // Quota check sits on the shared path so every gate variant inherits it
    let group = endpoint_group(parts.uri.path());
    let max_override = state.auth.rate_limit_override(&ctx.tenant_id).await;
    if let Err(retry_after_secs) =
        state
            .limiter
            .check(&ctx.tenant_id, Some(&ctx.user_id), group, max_override)
    {
        state
            .metrics
            .rate_limited_total
            .with_label_values(&[group])
            .inc();
        debug!(tenant = %ctx.tenant_id, group, "request rate limited");
        return Err(FlowForgeError::RateLimited { retry_after_secs });
    }
    Ok((ctx, claims))
}

/// `requireAuth`: any authenticated caller
pub struct AuthContext {
    pub ctx: TenantContext,
    pub claims: Claims,
}

#[async_trait]
impl FromRequestParts<AppState> for AuthContext {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> std::result::Result<Self, ApiError> {
        let (ctx, claims) = authenticate(parts, state).await?;
        Ok(AuthContext { ctx, claims })
    }
}

/// `requirePlatformAdmin`: rejects non-platform callers
pub struct PlatformAdmin(pub TenantContext);

#[async_trait]
impl FromRequestParts<AppState> for PlatformAdmin {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> std::result::Result<Self, ApiError> {
        let (ctx, _) = authenticate(parts, state).await?;
        if !ctx.is_platform_admin {
            return Err(ApiError::from(FlowForgeError::Forbidden(
                "platform admin required".to_string(),
            )));
        }
        Ok(PlatformAdmin(ctx))
    }
}

/// `requireTenantAdmin`: rejects non-admins of the current tenant
pub struct TenantAdmin(pub TenantContext);

#[async_trait]
impl FromRequestParts<AppState> for TenantAdmin {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> std::result::Result<Self, ApiError> {
        let (ctx, claims) = authenticate(parts, state).await?;
        if !ctx.is_platform_admin && !claims.tenant_admin {
            return Err(ApiError::from(FlowForgeError::Forbidden(
                "tenant admin required".to_string(),
            )));
        }
        Ok(TenantAdmin(ctx))
    }
}

/// `optionalAuth`: context when a token is present, empty otherwise.
/// A present-but-invalid token is still an error.
pub struct OptionalAuth(pub Option<TenantContext>);

#[async_trait]
impl FromRequestParts<AppState> for OptionalAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> std::result::Result<Self, ApiError> {
        if parts.headers.get(header::AUTHORIZATION).is_none() {
            return Ok(OptionalAuth(None));
        }
        let (ctx, _) = authenticate(parts, state).await?;
        Ok(OptionalAuth(Some(ctx)))
    }
}

/// `requirePermission(perm)`: tenant admins and platform admins implicitly
/// hold every tenant permission
pub fn require_permission(ctx: &TenantContext, permission: &str) -> Result<()> {
    if ctx.has_permission(permission) || ctx.has_role("admin") {
        return Ok(());
    }
    Err(FlowForgeError::Forbidden(format!(
        "missing permission '{}'",
        permission
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_groups() {
        assert_eq!(endpoint_group("/workflows/abc/execute"), "workflows");
        assert_eq!(endpoint_group("/auth/login"), "auth");
        assert_eq!(endpoint_group("/"), "root");
    }

    #[test]
    fn rate_limiter_enforces_quota_and_reports_retry() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 3);
        for _ in 0..3 {
            limiter.check("t1", Some("u1"), "workflows", None).unwrap();
        }
        let retry = limiter
            .check("t1", Some("u1"), "workflows", None)
            .unwrap_err();
        assert!(retry >= 1 && retry <= 60);
        // Other tenants and groups have their own windows
        limiter.check("t2", Some("u1"), "workflows", None).unwrap();
        limiter.check("t1", Some("u1"), "executions", None).unwrap();
    }

    #[test]
    fn rate_limiter_override_applies() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 100);
        limiter.check("t1", Some("u1"), "workflows", Some(1)).unwrap();
        assert!(limiter
            .check("t1", Some("u1"), "workflows", Some(1))
            .is_err());
    }

    #[test]
    fn permission_gate() {
        let mut ctx = TenantContext::system("t1");
        ctx.is_platform_admin = false;
        ctx.roles = vec!["member".to_string()];
        ctx.permissions = vec!["workflows:read".to_string()];
        assert!(require_permission(&ctx, "workflows:read").is_ok());
        assert!(require_permission(&ctx, "workflows:write").is_err());
        ctx.roles.push("admin".to_string());
        assert!(require_permission(&ctx, "workflows:write").is_ok());
    }
}
