// Store manager - pooled access to the document store, health and shutdown

//! # Store Manager
//!
//! Singleton per process. Owns the backend, a permit-based connection pool,
//! the connect-with-retry loop, and a periodic monitor that records
//! utilization and flags leaked leases. Lock ordering is pool -> per-execution
//! lock -> audit batch; a lease is never held across an agent invocation.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StoreSettings;
use crate::metrics::Metrics;
use crate::{FlowForgeError, Result};

use super::{DocumentStore, InMemoryDocumentStore};

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const CONNECT_BACKOFF_CAP: Duration = Duration::from_secs(30);
/// A lease held longer than this is reported as a leak suspect
const LEASE_LEAK_THRESHOLD: Duration = Duration::from_secs(60);

/// Point-in-time pool statistics
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub max_connections: usize,
    pub active: usize,
    pub available: usize,
    pub acquired_total: u64,
    pub leak_suspects: usize,
}

/// Result of an async health check
#[derive(Debug, Clone, Serialize)]
pub struct StoreHealth {
    pub healthy: bool,
    pub backend: String,
    pub pool: PoolStats,
}

/// Pooled handle on the document store. Dropping it returns the permit.
pub struct StoreLease {
    backend: Arc<dyn DocumentStore>,
    lease_id: u64,
    manager: Arc<LeaseTable>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for StoreLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreLease")
            .field("lease_id", &self.lease_id)
            .finish()
    }
}

impl StoreLease {
    pub fn store(&self) -> &dyn DocumentStore {
        self.backend.as_ref()
    }
}

impl Drop for StoreLease {
    fn drop(&mut self) {
        self.manager.release(self.lease_id);
    }
}

/// Active lease bookkeeping shared between manager and leases
struct LeaseTable {
    active: AtomicUsize,
    acquired_total: AtomicU64,
    leases: dashmap::DashMap<u64, Instant>,
}

impl LeaseTable {
    fn release(&self, lease_id: u64) {
        self.leases.remove(&lease_id);
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Process singleton owning the store backend and its connection pool
pub struct StoreManager {
    backend: Arc<dyn DocumentStore>,
    backend_name: String,
    settings: StoreSettings,
    permits: Arc<Semaphore>,
    leases: Arc<LeaseTable>,
    lease_seq: AtomicU64,
    healthy: AtomicBool,
    shutdown: CancellationToken,
    metrics: Arc<Metrics>,
}

impl StoreManager {
    /// Connect with retry and start the monitor task
    pub async fn connect(settings: StoreSettings, metrics: Arc<Metrics>) -> Result<Arc<Self>> {
        let backend = backend_for_uri(&settings.uri)?;
        Self::connect_with_backend(backend, settings, metrics).await
    }

    /// Used directly by tests to inject a backend
    pub async fn connect_with_backend(
        backend: Arc<dyn DocumentStore>,
        settings: StoreSettings,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Self>> {
        let mut backoff = CONNECT_BACKOFF_INITIAL;
        let mut attempt = 1;
        loop {
            match tokio::time::timeout(settings.connect_timeout, backend.ping()).await {
                Ok(Ok(())) => break,
                outcome => {
                    let reason = match outcome {
                        Ok(Err(err)) => err.to_string(),
                        _ => "connect timeout".to_string(),
                    };
                    if attempt >= CONNECT_ATTEMPTS {
                        return Err(FlowForgeError::Storage(anyhow::anyhow!(
                            "store unreachable after {} attempts: {}",
                            attempt,
                            reason
                        )));
                    }
                    warn!(attempt, %reason, "store connect failed, retrying in {:?}", backoff);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(CONNECT_BACKOFF_CAP);
                    attempt += 1;
                }
            }
        }

        let manager = Arc::new(Self {
            backend,
            backend_name: settings.uri.clone(),
            permits: Arc::new(Semaphore::new(settings.pool_max)),
            leases: Arc::new(LeaseTable {
                active: AtomicUsize::new(0),
                acquired_total: AtomicU64::new(0),
                leases: dashmap::DashMap::new(),
            }),
            lease_seq: AtomicU64::new(0),
            healthy: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
            settings,
            metrics,
        });
        manager.clone().spawn_monitor();
        info!(backend = %manager.backend_name, pool_max = manager.settings.pool_max, "store connected");
        Ok(manager)
    }

    /// Acquire a pooled lease; times out with a storage error when the pool
    /// is exhausted past the connect timeout
    pub async fn acquire(&self) -> Result<StoreLease> {
        if self.shutdown.is_cancelled() {
            return Err(FlowForgeError::Storage(anyhow::anyhow!(
                "store manager is shut down"
            )));
        }
        let permit = tokio::time::timeout(
            self.settings.connect_timeout,
            self.permits.clone().acquire_owned(),
        )
        .await
        .map_err(|_| FlowForgeError::Storage(anyhow::anyhow!("connection pool exhausted")))?
        .map_err(|_| FlowForgeError::Storage(anyhow::anyhow!("connection pool closed")))?;

        let lease_id = self.lease_seq.fetch_add(1, Ordering::SeqCst);
        self.leases.active.fetch_add(1, Ordering::SeqCst);
        self.leases.acquired_total.fetch_add(1, Ordering::SeqCst);
        self.leases.leases.insert(lease_id, Instant::now());
        Ok(StoreLease {
            backend: self.backend.clone(),
            lease_id,
            manager: self.leases.clone(),
            _permit: permit,
        })
    }

    pub fn stats(&self) -> PoolStats {
        let active = self.leases.active.load(Ordering::SeqCst);
        let leak_suspects = self
            .leases
            .leases
            .iter()
            .filter(|entry| entry.value().elapsed() > LEASE_LEAK_THRESHOLD)
            .count();
        PoolStats {
            max_connections: self.settings.pool_max,
            active,
            available: self.settings.pool_max.saturating_sub(active),
            acquired_total: self.leases.acquired_total.load(Ordering::SeqCst),
            leak_suspects,
        }
    }

    /// Cheap synchronous probe for liveness endpoints
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst) && !self.shutdown.is_cancelled()
    }

    /// Ping the backend and report pool stats
    pub async fn health_check(&self) -> StoreHealth {
        let healthy = self.backend.ping().await.is_ok() && !self.shutdown.is_cancelled();
        self.healthy.store(healthy, Ordering::SeqCst);
        StoreHealth {
            healthy,
            backend: self.backend_name.clone(),
            pool: self.stats(),
        }
    }

    fn spawn_monitor(self: Arc<Self>) {
        let interval = self.settings.monitor_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let stats = self.stats();
                let utilization = if stats.max_connections > 0 {
                    stats.active as f64 / stats.max_connections as f64
                } else {
                    0.0
                };
                self.metrics.pool_utilization.set(utilization);
                if stats.available == 0 {
                    warn!(active = stats.active, "store pool has no available connections");
                } else if utilization > 0.8 {
                    warn!(
                        active = stats.active,
                        max = stats.max_connections,
                        "store pool utilization above 80%"
                    );
                }
                if stats.leak_suspects > 0 {
                    warn!(count = stats.leak_suspects, "store leases held past leak threshold");
                }
                debug!(
                    active = stats.active,
                    available = stats.available,
                    total = stats.acquired_total,
                    "store pool monitor"
                );
            }
        });
    }

    /// Stop new work, drain in-flight leases within `grace`, close the backend
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        self.shutdown.cancel();
        let deadline = Instant::now() + grace;
        while self.leases.active.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let remaining = self.leases.active.load(Ordering::SeqCst);
        if remaining > 0 {
            warn!(remaining, "store shutdown abandoning in-flight leases");
        }
        self.backend.close().await.map_err(FlowForgeError::Storage)?;
        info!("store manager shut down");
        Ok(())
    }
}

fn backend_for_uri(uri: &str) -> Result<Arc<dyn DocumentStore>> {
    if uri.starts_with("memory://") {
        Ok(Arc::new(InMemoryDocumentStore::new()))
    } else {
        Err(FlowForgeError::Internal(format!(
            "unsupported STORE_URI scheme: {}",
            uri
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    fn store_settings(pool_max: usize) -> StoreSettings {
        let mut settings = Settings::default().store;
        settings.pool_max = pool_max;
        settings.connect_timeout = Duration::from_millis(200);
        settings
    }

    #[tokio::test]
    async fn acquire_and_release_tracks_stats() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let manager = StoreManager::connect(store_settings(2), metrics).await.unwrap();
        let lease = manager.acquire().await.unwrap();
        assert_eq!(manager.stats().active, 1);
        assert_eq!(manager.stats().available, 1);
        drop(lease);
        assert_eq!(manager.stats().active, 0);
        assert_eq!(manager.stats().acquired_total, 1);
    }

    #[tokio::test]
    async fn exhausted_pool_times_out() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let manager = StoreManager::connect(store_settings(1), metrics).await.unwrap();
        let _held = manager.acquire().await.unwrap();
        let err = manager.acquire().await.unwrap_err();
        assert!(matches!(err, FlowForgeError::Storage(_)));
    }

    #[tokio::test]
    async fn health_check_reports_pool() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let manager = StoreManager::connect(store_settings(4), metrics).await.unwrap();
        let health = manager.health_check().await;
        assert!(health.healthy);
        assert_eq!(health.pool.max_connections, 4);
        assert!(manager.is_healthy());
    }

    #[tokio::test]
    async fn shutdown_refuses_new_leases() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let manager = StoreManager::connect(store_settings(2), metrics).await.unwrap();
        manager.shutdown(Duration::from_millis(100)).await.unwrap();
        assert!(!manager.is_healthy());
        assert!(manager.acquire().await.is_err());
    }

    #[tokio::test]
    async fn unsupported_uri_rejected() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let mut settings = store_settings(1);
        settings.uri = "postgres://nope".to_string();
        assert!(StoreManager::connect(settings, metrics).await.is_err());
    }
}
