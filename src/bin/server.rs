// FlowForge server binary
// Run with: cargo run --bin server

use std::sync::Arc;
use std::time::Duration;

use dotenv::dotenv;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use flowforge::api::{build_router, AppState, RateLimiter};
use flowforge::auth::AuthService;
use flowforge::config::Settings;
use flowforge::engine::{register_builtins, AgentRegistry, EngineConfig, ExecutionEngine};
use flowforge::metrics::Metrics;
use flowforge::storage::{ExecutionStore, StoreManager};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // .env is optional; real deployments configure the environment directly
    if let Err(err) = dotenv() {
        eprintln!("note: no .env file loaded ({})", err);
    }

    let settings = Settings::from_env();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.server.log_level.clone())),
        )
        .init();

    info!("🚀 Starting FlowForge server");
    info!(store = %settings.store.uri, port = settings.server.port, "configuration loaded");

    let metrics = Arc::new(Metrics::new()?);
    let manager = StoreManager::connect(settings.store.clone(), metrics.clone()).await?;
    let store = ExecutionStore::new(manager.clone(), metrics.clone());

    let registry = Arc::new(AgentRegistry::new());
    register_builtins(&registry)?;
    info!(agents = ?registry.list(), "agent registry populated");

    let engine = ExecutionEngine::new(
        store,
        registry,
        EngineConfig::from(&settings.engine),
        metrics.clone(),
    );
    match engine.recover().await {
        Ok(0) => {}
        Ok(count) => info!(count, "rehydrated interrupted executions"),
        Err(err) => error!(%err, "recovery scan failed"),
    }

    let auth = Arc::new(AuthService::new(manager.clone(), metrics.clone(), &settings.auth));
    if let Err(err) = auth.seed_default_identities().await {
        warn!(%err, "could not seed default identities");
    }

    let state = AppState {
        engine,
        auth,
        limiter: Arc::new(RateLimiter::new(
            settings.rate_limit.window,
            settings.rate_limit.max_per_window,
        )),
        metrics,
    };
    let router = build_router(state, &settings);

    let addr = format!("0.0.0.0:{}", settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "✅ FlowForge listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain the pool before exit; running executions stay persisted and are
    // rehydrated on the next start
    info!("shutting down");
    manager.shutdown(Duration::from_secs(30)).await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "failed to install shutdown handler");
    }
    info!("shutdown signal received");
}
