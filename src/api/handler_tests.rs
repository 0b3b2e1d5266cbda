// Router-level tests for the HTTP surface

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use crate::auth::AuthService;
use crate::config::Settings;
use crate::engine::{register_builtins, AgentRegistry, EngineConfig, ExecutionEngine};
use crate::metrics::Metrics;
use crate::models::identity::{Membership, Tenant, User};
use crate::models::DocumentEnvelope;
use crate::models::TenantContext;
use crate::storage::{ExecutionStore, Repository, StoreManager};

use super::middleware::RateLimiter;
use super::{build_router, AppState};

struct TestApp {
    router: Router,
    state: AppState,
}

async fn test_app_with_limit(max_per_window: u64) -> TestApp {
    let mut settings = Settings::default();
    settings.rate_limit.max_per_window = max_per_window;

    let metrics = Arc::new(Metrics::new().unwrap());
    let manager = StoreManager::connect(settings.store.clone(), metrics.clone())
        .await
        .unwrap();
    let store = ExecutionStore::new(manager.clone(), metrics.clone());

    let registry = Arc::new(AgentRegistry::new());
    register_builtins(&registry).unwrap();
    let engine = ExecutionEngine::new(
        store,
        registry,
        EngineConfig::from(&settings.engine),
        metrics.clone(),
    );

    let auth = Arc::new(AuthService::new(manager.clone(), metrics.clone(), &settings.auth));
    auth.seed_default_identities().await.unwrap();

    // A second tenant with its own user, for isolation tests
    let system = TenantContext::system("platform");
    let tenants: Repository<Tenant> = Repository::new(manager.clone(), metrics.clone());
    tenants
        .create(
            &system,
            Tenant {
                tenant_id: "acme".to_string(),
                name: "Acme Industrial".to_string(),
                active: true,
                rate_limit_per_window: None,
                audit_retention_days: None,
                envelope: DocumentEnvelope::new("acme", "system"),
            },
        )
        .await
        .unwrap();
    let users: Repository<User> = Repository::new(manager.clone(), metrics.clone());
    let salt = crate::auth::generate_salt();
    users
        .create(
            &system,
            User {
                user_id: "rival".to_string(),
                email: "rival@acme.local".to_string(),
                display_name: "Acme Rival".to_string(),
                password_digest: crate::auth::hash_password("rival", &salt),
                password_salt: salt,
                is_platform_admin: false,
                active: true,
                envelope: DocumentEnvelope::new("platform", "system"),
            },
        )
        .await
        .unwrap();
    let memberships: Repository<Membership> = Repository::new(manager.clone(), metrics.clone());
    let mut membership = Membership::new("rival", "acme", "system");
    membership.is_tenant_admin = true;
    membership.roles = vec!["member".to_string(), "admin".to_string()];
    memberships.create(&system, membership).await.unwrap();

    let state = AppState {
        engine,
        auth,
        limiter: Arc::new(RateLimiter::new(
            settings.rate_limit.window,
            settings.rate_limit.max_per_window,
        )),
        metrics,
    };
    TestApp {
        router: build_router(state.clone(), &settings),
        state,
    }
}

async fn test_app() -> TestApp {
    test_app_with_limit(10_000).await
}

fn json_request(method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

async fn login(app: &TestApp, email: &str, password: &str) -> String {
    let response = app
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            "/auth/login",
            None,
            Some(json!({"email": email, "password": password})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await["token"].as_str().unwrap().to_string()
}

fn sample_workflow(id: &str, status: &str) -> Value {
    json!({
        "id": id,
        "name": "Intake pipeline",
        "status": status,
        "agents": [
            {"id": "intake", "kind": "checkpoint", "config": {"message": "intake"}},
            {"id": "publish", "kind": "checkpoint", "config": {}}
        ],
        "connections": [{"from": "intake", "to": "publish"}],
        "entryPoints": ["intake"]
    })
}

async fn await_execution_status(app: &TestApp, token: &str, execution_id: &str, expected: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let response = app
            .router
            .clone()
            .oneshot(json_request(
                "GET",
                &format!("/executions/{}", execution_id),
                Some(token),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        if body["status"] == json!(expected) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "execution never reached {}, last: {}",
            expected,
            body["status"]
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn login_me_and_refresh() {
    let app = test_app().await;
    let token = login(&app, "inspector@flowforge.local", "inspector").await;

    let me = app
        .router
        .clone()
        .oneshot(json_request("GET", "/auth/me", Some(&token), None))
        .await
        .unwrap();
    assert_eq!(me.status(), StatusCode::OK);
    let body = body_json(me).await;
    assert_eq!(body["tenantId"], json!("demo"));
    assert_eq!(body["isTenantAdmin"], json!(true));

    let refreshed = app
        .router
        .clone()
        .oneshot(json_request("POST", "/auth/refresh", Some(&token), None))
        .await
        .unwrap();
    assert_eq!(refreshed.status(), StatusCode::OK);
    assert!(body_json(refreshed).await["token"].is_string());
}

#[tokio::test]
async fn invalid_credentials_are_unauthorized_with_error_shape() {
    let app = test_app().await;
    let response = app
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            "/auth/login",
            None,
            Some(json!({"email": "inspector@flowforge.local", "password": "nope"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key("x-request-id"));
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], json!("UNAUTHORIZED"));
    assert!(body["error"]["message"].is_string());
}

#[tokio::test]
async fn missing_token_is_unauthorized() {
    let app = test_app().await;
    let response = app
        .router
        .clone()
        .oneshot(json_request("GET", "/workflows", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn workflow_crud_and_execution_round_trip() {
    let app = test_app().await;
    let token = login(&app, "inspector@flowforge.local", "inspector").await;

    // Create (validated on save)
    let created = app
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            "/workflows",
            Some(&token),
            Some(sample_workflow("intake", "active")),
        ))
        .await
        .unwrap();
    assert_eq!(created.status(), StatusCode::CREATED);
    let created = body_json(created).await;
    assert_eq!(created["version"], json!(1));
    assert_eq!(created["tenant_id"], json!("demo"));

    // List
    let listed = app
        .router
        .clone()
        .oneshot(json_request("GET", "/workflows", Some(&token), None))
        .await
        .unwrap();
    assert_eq!(listed.status(), StatusCode::OK);
    assert_eq!(body_json(listed).await["count"], json!(1));

    // Execute, fire-and-forget
    let accepted = app
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            "/workflows/intake/execute",
            Some(&token),
            Some(json!({"initialState": {"site": "plant-7"}})),
        ))
        .await
        .unwrap();
    assert_eq!(accepted.status(), StatusCode::ACCEPTED);
    let execution_id = body_json(accepted).await["executionId"]
        .as_str()
        .unwrap()
        .to_string();
    await_execution_status(&app, &token, &execution_id, "completed").await;

    // Executions listing for the workflow
    let executions = app
        .router
        .clone()
        .oneshot(json_request(
            "GET",
            "/workflows/intake/executions",
            Some(&token),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(body_json(executions).await["count"], json!(1));

    // Cancelling a completed execution conflicts
    let conflict = app
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/executions/{}/signal", execution_id),
            Some(&token),
            Some(json!({"signal": "cancel"})),
        ))
        .await
        .unwrap();
    assert_eq!(conflict.status(), StatusCode::CONFLICT);

    // Archive, then executing is a validation error
    let archived = app
        .router
        .clone()
        .oneshot(json_request("DELETE", "/workflows/intake", Some(&token), None))
        .await
        .unwrap();
    assert_eq!(archived.status(), StatusCode::OK);
    let rejected = app
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            "/workflows/intake/execute",
            Some(&token),
            Some(json!({"initialState": {}})),
        ))
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn invalid_definition_reports_each_defect() {
    let app = test_app().await;
    let token = login(&app, "inspector@flowforge.local", "inspector").await;
    let response = app
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            "/workflows",
            Some(&token),
            Some(json!({
                "name": "broken",
                "agents": [
                    {"id": "a", "kind": "no-such-kind", "config": {}},
                    {"id": "b", "kind": "aggregator", "config": {}}
                ],
                "connections": [{"from": "a", "to": "ghost"}],
                "entryPoints": ["a"]
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], json!("VALIDATION_FAILED"));
    let details = body["error"]["details"].as_array().unwrap();
    assert!(details.len() >= 3);
}

#[tokio::test]
async fn active_workflows_are_immutable() {
    let app = test_app().await;
    let token = login(&app, "inspector@flowforge.local", "inspector").await;
    app.router
        .clone()
        .oneshot(json_request(
            "POST",
            "/workflows",
            Some(&token),
            Some(sample_workflow("frozen", "active")),
        ))
        .await
        .unwrap();
    let response = app
        .router
        .clone()
        .oneshot(json_request(
            "PUT",
            "/workflows/frozen",
            Some(&token),
            Some(sample_workflow("frozen", "active")),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // A new POST with the same id produces version 2
    let next = app
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            "/workflows",
            Some(&token),
            Some(sample_workflow("frozen", "draft")),
        ))
        .await
        .unwrap();
    assert_eq!(next.status(), StatusCode::CREATED);
    assert_eq!(body_json(next).await["version"], json!(2));
}

#[tokio::test]
async fn cross_tenant_workflow_access_is_not_found() {
    let app = test_app().await;
    let demo_token = login(&app, "inspector@flowforge.local", "inspector").await;
    let acme_token = login(&app, "rival@acme.local", "rival").await;

    app.router
        .clone()
        .oneshot(json_request(
            "POST",
            "/workflows",
            Some(&demo_token),
            Some(sample_workflow("secret", "active")),
        ))
        .await
        .unwrap();

    // Another tenant sees 404, never 403
    let hidden = app
        .router
        .clone()
        .oneshot(json_request("GET", "/workflows/secret", Some(&acme_token), None))
        .await
        .unwrap();
    assert_eq!(hidden.status(), StatusCode::NOT_FOUND);

    // A platform admin sees the workflow
    let admin_token = login(&app, "admin@flowforge.local", "admin").await;
    let visible = app
        .router
        .clone()
        .oneshot(json_request("GET", "/workflows/secret", Some(&admin_token), None))
        .await
        .unwrap();
    assert_eq!(visible.status(), StatusCode::OK);
}

#[tokio::test]
async fn switch_tenant_requires_membership() {
    let app = test_app().await;
    let token = login(&app, "inspector@flowforge.local", "inspector").await;
    let denied = app
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            "/auth/switch-tenant",
            Some(&token),
            Some(json!({"tenantId": "acme"})),
        ))
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::NOT_FOUND);

    let allowed = app
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            "/auth/switch-tenant",
            Some(&token),
            Some(json!({"tenantId": "demo"})),
        ))
        .await
        .unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);
}

#[tokio::test]
async fn audit_logs_are_tenant_scoped() {
    let app = test_app().await;
    let token = login(&app, "inspector@flowforge.local", "inspector").await;
    app.router
        .clone()
        .oneshot(json_request(
            "POST",
            "/workflows",
            Some(&token),
            Some(sample_workflow("audited", "active")),
        ))
        .await
        .unwrap();

    let logs = app
        .router
        .clone()
        .oneshot(json_request("GET", "/audit-logs", Some(&token), None))
        .await
        .unwrap();
    assert_eq!(logs.status(), StatusCode::OK);
    let body = body_json(logs).await;
    assert!(body["count"].as_u64().unwrap() >= 1);
    for event in body["events"].as_array().unwrap() {
        assert_eq!(event["tenant_id"], json!("demo"));
    }

    // Cross-tenant listing needs platform admin
    let forbidden = app
        .router
        .clone()
        .oneshot(json_request(
            "GET",
            "/audit-logs?allTenants=true",
            Some(&token),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn rate_limit_yields_429_with_retry_after() {
    let app = test_app_with_limit(3).await;
    let token = login(&app, "inspector@flowforge.local", "inspector").await;
    let mut last_status = StatusCode::OK;
    for _ in 0..5 {
        let response = app
            .router
            .clone()
            .oneshot(json_request("GET", "/workflows", Some(&token), None))
            .await
            .unwrap();
        last_status = response.status();
        if last_status == StatusCode::TOO_MANY_REQUESTS {
            assert!(response.headers().contains_key("retry-after"));
            let body = body_json(response).await;
            assert_eq!(body["error"]["code"], json!("RATE_LIMITED"));
            return;
        }
    }
    panic!("rate limit never triggered, last status {}", last_status);
}

#[tokio::test]
async fn health_probes_and_metrics() {
    let app = test_app().await;
    let health = app
        .router
        .clone()
        .oneshot(json_request("GET", "/health", None, None))
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    let body = body_json(health).await;
    assert_eq!(body["status"], json!("healthy"));
    assert!(body["store"]["pool"]["max_connections"].as_u64().unwrap() > 0);

    let ready = app
        .router
        .clone()
        .oneshot(json_request("GET", "/ready", None, None))
        .await
        .unwrap();
    assert_eq!(ready.status(), StatusCode::OK);

    let alive = app
        .router
        .clone()
        .oneshot(json_request("GET", "/alive", None, None))
        .await
        .unwrap();
    assert_eq!(alive.status(), StatusCode::OK);

    let token = login(&app, "inspector@flowforge.local", "inspector").await;
    // Optional auth on /health echoes the caller's tenant
    let authed_health = app
        .router
        .clone()
        .oneshot(json_request("GET", "/health", Some(&token), None))
        .await
        .unwrap();
    assert_eq!(body_json(authed_health).await["tenant"], json!("demo"));
    let _ = app
        .router
        .clone()
        .oneshot(json_request("GET", "/workflows", Some(&token), None))
        .await
        .unwrap();
    let metrics = app
        .router
        .clone()
        .oneshot(json_request("GET", "/metrics", None, None))
        .await
        .unwrap();
    assert_eq!(metrics.status(), StatusCode::OK);
    let text = metrics.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(text.to_vec()).unwrap();
    assert!(text.contains("flowforge_http_request_duration_seconds"));

    // Engine stats are visible through state as well
    assert_eq!(app.state.engine.active_executions(), 0);
}
