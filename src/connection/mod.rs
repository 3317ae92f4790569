//! Connection Manager
//!
//! Owns one live pool connection per profile. Connections are opened lazily,
//! reused while they answer a liveness probe, and rebuilt when they stop
//! answering. Each profile has its own slot lock, so a slow probe only holds
//! up callers of the same profile. `shutdown_all` closes everything and can be
//! called any number of times.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, PoolEndpoint, ProfilesConfig};
use crate::pool::{HttpPool, LocalClusters, PoolError, WorkerId, WorkerPool};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    #[error("Unknown profile '{0}'")]
    UnknownProfile(String),

    #[error("No running pool for profile '{0}'")]
    NotRunning(String),

    #[error("Couldn't connect to profile '{profile}': {reason}")]
    Unreachable { profile: String, reason: String },

    #[error("No workers available in profile '{0}'")]
    PoolUnavailable(String),
}

/// Opens pool connections for profiles
#[async_trait]
pub trait PoolConnector: Send + Sync {
    /// Open a connection to `profile`'s pool. With `connect_only` set, only
    /// an already running pool may be reached.
    async fn connect(
        &self,
        profile: &str,
        connect_only: bool,
    ) -> Result<Arc<dyn WorkerPool>, ConnectionError>;
}

/// Connector driven by the profiles file
pub struct ProfileConnector {
    profiles: ProfilesConfig,
    clusters: LocalClusters,
}

impl ProfileConnector {
    pub fn new(profiles: ProfilesConfig, clusters: LocalClusters) -> Self {
        Self { profiles, clusters }
    }

    pub fn clusters(&self) -> &LocalClusters {
        &self.clusters
    }
}

#[async_trait]
impl PoolConnector for ProfileConnector {
    async fn connect(
        &self,
        profile: &str,
        connect_only: bool,
    ) -> Result<Arc<dyn WorkerPool>, ConnectionError> {
        let endpoint = self.profiles.endpoint(profile).map_err(|e| match e {
            ConfigError::ProfileNotFound(name) => ConnectionError::UnknownProfile(name),
            other => ConnectionError::Unreachable {
                profile: profile.to_string(),
                reason: other.to_string(),
            },
        })?;

        match endpoint {
            PoolEndpoint::Local { workers } => {
                if let Some(pool) = self.clusters.running(profile) {
                    return Ok(pool);
                }
                if connect_only {
                    return Err(ConnectionError::NotRunning(profile.to_string()));
                }
                Ok(self.clusters.start(profile, *workers))
            }
            PoolEndpoint::Http { urls, api_key } => {
                let pool = HttpPool::connect(profile, urls.clone(), api_key.clone())
                    .await
                    .map_err(|e| ConnectionError::Unreachable {
                        profile: profile.to_string(),
                        reason: e.to_string(),
                    })?;
                Ok(Arc::new(pool))
            }
        }
    }
}

/// Live, shared connection to one profile's pool
#[derive(Clone)]
pub struct PoolHandle {
    profile: String,
    pool: Arc<dyn WorkerPool>,
}

impl std::fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle")
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}

impl PoolHandle {
    pub fn new(profile: impl Into<String>, pool: Arc<dyn WorkerPool>) -> Self {
        Self {
            profile: profile.into(),
            pool,
        }
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn pool(&self) -> &Arc<dyn WorkerPool> {
        &self.pool
    }

    /// True when both handles share the same underlying connection
    pub fn same_connection(&self, other: &PoolHandle) -> bool {
        Arc::ptr_eq(&self.pool, &other.pool)
    }
}

type Slot = Arc<Mutex<Option<PoolHandle>>>;

/// Caches one pool connection per profile
pub struct ConnectionManager {
    connector: Arc<dyn PoolConnector>,
    slots: DashMap<String, Slot>,
    established: AtomicU64,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn PoolConnector>) -> Self {
        Self {
            connector,
            slots: DashMap::new(),
            established: AtomicU64::new(0),
        }
    }

    fn slot(&self, profile: &str) -> Slot {
        self.slots.entry(profile.to_string()).or_default().clone()
    }

    fn all_slots(&self) -> Vec<Slot> {
        self.slots.iter().map(|s| s.value().clone()).collect()
    }

    /// Return the cached live connection for `profile`, or open one
    pub async fn ensure_connection(
        &self,
        profile: &str,
        connect_only: bool,
    ) -> Result<PoolHandle, ConnectionError> {
        let slot = self.slot(profile);
        let mut cached = slot.lock().await;

        if let Some(handle) = cached.as_ref() {
            if handle.pool.is_live().await {
                debug!("Reusing connection for profile '{}'", profile);
                return Ok(handle.clone());
            }
            warn!("Connection for profile '{}' is no longer live, reconnecting", profile);
            if let Some(stale) = cached.take() {
                stale.pool.close().await;
            }
        }

        let pool = self.connector.connect(profile, connect_only).await?;
        let handle = PoolHandle::new(profile, pool);
        *cached = Some(handle.clone());
        self.established.fetch_add(1, Ordering::SeqCst);
        info!("Connected to profile '{}'", profile);
        Ok(handle)
    }

    /// Workers currently available behind `handle`; never empty on success
    pub async fn available_workers(
        &self,
        handle: &PoolHandle,
    ) -> Result<Vec<WorkerId>, ConnectionError> {
        let workers = handle
            .pool
            .worker_ids()
            .await
            .map_err(|e| match e {
                PoolError::NoWorkers(profile) => ConnectionError::PoolUnavailable(profile),
                other => ConnectionError::Unreachable {
                    profile: handle.profile.clone(),
                    reason: other.to_string(),
                },
            })?;
        if workers.is_empty() {
            return Err(ConnectionError::PoolUnavailable(handle.profile.clone()));
        }
        Ok(workers)
    }

    /// Close every cached connection
    pub async fn shutdown_all(&self) {
        let mut drained = Vec::new();
        for slot in self.all_slots() {
            if let Some(handle) = slot.lock().await.take() {
                drained.push(handle);
            }
        }
        join_all(drained.iter().map(|h| h.pool.close())).await;
        if !drained.is_empty() {
            info!("Closed {} pool connection(s)", drained.len());
        }
    }

    /// Number of connections opened over the manager's lifetime
    pub fn connections_established(&self) -> u64 {
        self.established.load(Ordering::SeqCst)
    }

    /// Number of connections currently cached
    pub async fn open_connections(&self) -> usize {
        let mut open = 0;
        for slot in self.all_slots() {
            if slot.lock().await.is_some() {
                open += 1;
            }
        }
        open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::ComputeRegistry;

    fn connector(profiles: ProfilesConfig) -> (Arc<ProfileConnector>, LocalClusters) {
        let clusters = LocalClusters::new(Arc::new(ComputeRegistry::with_builtins()));
        (
            Arc::new(ProfileConnector::new(profiles, clusters.clone())),
            clusters,
        )
    }

    fn local_profiles() -> ProfilesConfig {
        let mut profiles = ProfilesConfig::default();
        profiles.add_profile("lab", PoolEndpoint::Local { workers: 2 });
        profiles
    }

    #[tokio::test]
    async fn test_connect_only_requires_running_pool() {
        let (connector, _) = connector(local_profiles());
        let manager = ConnectionManager::new(connector);

        let result = manager.ensure_connection("lab", true).await;
        assert_eq!(result.unwrap_err(), ConnectionError::NotRunning("lab".to_string()));
        assert_eq!(manager.connections_established(), 0);
    }

    #[tokio::test]
    async fn test_connect_starts_pool_when_allowed() {
        let (connector, clusters) = connector(local_profiles());
        let manager = ConnectionManager::new(connector);

        let handle = manager.ensure_connection("lab", false).await.unwrap();
        assert_eq!(handle.profile(), "lab");
        assert!(clusters.running("lab").is_some());
        assert_eq!(manager.available_workers(&handle).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_handles_are_reused() {
        let (connector, clusters) = connector(local_profiles());
        clusters.start("lab", 2);
        let manager = ConnectionManager::new(connector);

        let first = manager.ensure_connection("lab", true).await.unwrap();
        for _ in 0..5 {
            let again = manager.ensure_connection("lab", true).await.unwrap();
            assert!(first.same_connection(&again));
        }
        assert_eq!(manager.connections_established(), 1);
    }

    #[tokio::test]
    async fn test_dead_connection_is_rebuilt() {
        let (connector, clusters) = connector(local_profiles());
        clusters.start("lab", 2);
        let manager = ConnectionManager::new(connector);

        let first = manager.ensure_connection("lab", true).await.unwrap();
        clusters.stop("lab").await;

        assert!(matches!(
            manager.ensure_connection("lab", true).await,
            Err(ConnectionError::NotRunning(_))
        ));
        assert_eq!(manager.open_connections().await, 0);

        clusters.start("lab", 1);
        let second = manager.ensure_connection("lab", true).await.unwrap();
        assert!(!first.same_connection(&second));
        assert_eq!(manager.connections_established(), 2);
    }

    #[tokio::test]
    async fn test_unknown_profile() {
        let (connector, _) = connector(local_profiles());
        let manager = ConnectionManager::new(connector);
        assert_eq!(
            manager.ensure_connection("ghost", false).await.unwrap_err(),
            ConnectionError::UnknownProfile("ghost".to_string())
        );
    }

    #[tokio::test]
    async fn test_zero_workers_is_unavailable() {
        let (connector, clusters) = connector(local_profiles());
        clusters.start("lab", 0);
        let manager = ConnectionManager::new(connector);

        let handle = manager.ensure_connection("lab", true).await.unwrap();
        assert_eq!(
            manager.available_workers(&handle).await.unwrap_err(),
            ConnectionError::PoolUnavailable("lab".to_string())
        );
    }

    #[tokio::test]
    async fn test_shutdown_all_is_idempotent() {
        let (connector, clusters) = connector(local_profiles());
        let manager = ConnectionManager::new(connector);

        manager.shutdown_all().await;

        let handle = manager.ensure_connection("lab", false).await.unwrap();
        manager.shutdown_all().await;
        manager.shutdown_all().await;

        assert_eq!(manager.open_connections().await, 0);
        assert!(!handle.pool().is_live().await);
        assert!(clusters.running("lab").is_none());
    }

    /// Connector whose "slow" profile blocks until the gate opens
    struct GatedConnector {
        clusters: LocalClusters,
        gate: Arc<tokio::sync::Semaphore>,
    }

    #[async_trait]
    impl PoolConnector for GatedConnector {
        async fn connect(
            &self,
            profile: &str,
            _connect_only: bool,
        ) -> Result<Arc<dyn WorkerPool>, ConnectionError> {
            if profile == "slow" {
                let _open = self.gate.acquire().await.map_err(|e| {
                    ConnectionError::Unreachable {
                        profile: profile.to_string(),
                        reason: e.to_string(),
                    }
                })?;
            }
            Ok(self.clusters.start(profile, 1))
        }
    }

    #[tokio::test]
    async fn test_slow_profile_does_not_block_others() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let connector = Arc::new(GatedConnector {
            clusters: LocalClusters::new(Arc::new(ComputeRegistry::with_builtins())),
            gate: gate.clone(),
        });
        let manager = Arc::new(ConnectionManager::new(connector));

        let slow = tokio::spawn({
            let manager = manager.clone();
            async move { manager.ensure_connection("slow", false).await }
        });
        tokio::task::yield_now().await;

        let fast = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            manager.ensure_connection("fast", false),
        )
        .await
        .expect("fast profile was blocked by the slow one");
        assert_eq!(fast.unwrap().profile(), "fast");
        assert!(!slow.is_finished());

        gate.add_permits(1);
        assert_eq!(slow.await.unwrap().unwrap().profile(), "slow");
        assert_eq!(manager.connections_established(), 2);
        assert_eq!(manager.open_connections().await, 2);
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_connection() {
        let (connector, _) = connector(local_profiles());
        let manager = ConnectionManager::new(connector);

        let handles =
            join_all((0..8).map(|_| manager.ensure_connection("lab", false))).await;
        let first = handles[0].as_ref().unwrap().clone();
        for handle in &handles {
            assert!(first.same_connection(handle.as_ref().unwrap()));
        }
        assert_eq!(manager.connections_established(), 1);
    }
}
