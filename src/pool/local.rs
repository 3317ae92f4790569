//! In-process worker pool
//!
//! Each worker is a tokio task that runs compute code on the blocking thread
//! pool. Pools are started per profile and kept in `LocalClusters`, which plays
//! the part of an externally managed cluster: a connect-only connection can
//! only reach a pool that was started beforehand.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

use super::{PendingResult, PoolError, RoundRobin, WorkerId, WorkerPool};
use crate::compute::{execute_request, ComputeRegistry, ComputeRequest, ComputeResult};

struct Job {
    request: ComputeRequest,
    reply: oneshot::Sender<Result<ComputeResult, PoolError>>,
}

/// A pool of in-process workers
pub struct LocalPool {
    profile: String,
    workers: Vec<(WorkerId, mpsc::UnboundedSender<Job>)>,
    view: RoundRobin,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl LocalPool {
    /// Start `size` workers sharing `registry`
    pub fn start(profile: impl Into<String>, size: usize, registry: Arc<ComputeRegistry>) -> Self {
        let profile = profile.into();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let workers = (0..size)
            .map(|index| {
                let id = index.to_string();
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(run_worker(
                    format!("{}/{}", profile, id),
                    rx,
                    registry.clone(),
                    shutdown_rx.clone(),
                ));
                (id, tx)
            })
            .collect();

        info!("Started local pool '{}' with {} workers", profile, size);

        Self {
            profile,
            workers,
            view: RoundRobin::new(),
            closed: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

async fn run_worker(
    name: String,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    registry: Arc<ComputeRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let job = tokio::select! {
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        let Job { request, reply } = job;
        debug!("Worker {} picked up request {}", name, request.request_id);
        let registry = registry.clone();
        let run = tokio::task::spawn_blocking(move || execute_request(&registry, request));

        tokio::select! {
            joined = run => {
                let result = joined.map_err(|e| PoolError::Transport(e.to_string()));
                // Receiver may already be gone; nothing left to notify then.
                let _ = reply.send(result);
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("Worker {} stopped", name);
}

#[async_trait]
impl WorkerPool for LocalPool {
    fn profile(&self) -> &str {
        &self.profile
    }

    async fn is_live(&self) -> bool {
        !self.is_closed()
    }

    async fn worker_ids(&self) -> Result<Vec<WorkerId>, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed(self.profile.clone()));
        }
        Ok(self.workers.iter().map(|(id, _)| id.clone()).collect())
    }

    fn submit(&self, request: ComputeRequest) -> Result<PendingResult, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed(self.profile.clone()));
        }
        let index = self
            .view
            .pick(self.workers.len())
            .ok_or_else(|| PoolError::NoWorkers(self.profile.clone()))?;

        let (reply, pending) = oneshot::channel();
        self.workers[index]
            .1
            .send(Job { request, reply })
            .map_err(|_| PoolError::Closed(self.profile.clone()))?;
        Ok(pending)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.shutdown_tx.send(true);
            info!("Closed local pool '{}'", self.profile);
        }
    }
}

/// Local pools that have been started, by profile
#[derive(Clone)]
pub struct LocalClusters {
    pools: Arc<DashMap<String, Arc<LocalPool>>>,
    registry: Arc<ComputeRegistry>,
}

impl LocalClusters {
    pub fn new(registry: Arc<ComputeRegistry>) -> Self {
        Self {
            pools: Arc::new(DashMap::new()),
            registry,
        }
    }

    /// Start a pool for `profile`, or return the one already running
    pub fn start(&self, profile: &str, size: usize) -> Arc<LocalPool> {
        if let Some(pool) = self.running(profile) {
            return pool;
        }
        let pool = Arc::new(LocalPool::start(profile, size, self.registry.clone()));
        self.pools.insert(profile.to_string(), pool.clone());
        pool
    }

    /// The running pool for `profile`, if any
    pub fn running(&self, profile: &str) -> Option<Arc<LocalPool>> {
        self.pools
            .get(profile)
            .map(|p| p.clone())
            .filter(|p| !p.is_closed())
    }

    /// Stop and forget the pool for `profile`
    pub async fn stop(&self, profile: &str) {
        if let Some((_, pool)) = self.pools.remove(profile) {
            pool.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{ComputeOutcome, InputSnapshot};
    use serde_json::json;
    use std::time::Duration;

    fn registry() -> Arc<ComputeRegistry> {
        let mut registry = ComputeRegistry::with_builtins();
        registry.register("slow", "tests", |_| {
            std::thread::sleep(Duration::from_millis(500));
            Ok(())
        });
        Arc::new(registry)
    }

    fn request(registry: &ComputeRegistry, name: &str, inputs: InputSnapshot) -> ComputeRequest {
        let code = registry.get(name).unwrap();
        ComputeRequest::new(code.code_ref(), inputs)
    }

    #[tokio::test]
    async fn test_local_pool_executes() {
        let registry = registry();
        let pool = LocalPool::start("test", 2, registry.clone());

        let pending = pool
            .submit(request(
                &registry,
                "double",
                InputSnapshot::new().with_value("x", json!(3.0)),
            ))
            .unwrap();
        let result = pending.await.unwrap().unwrap();

        match result.outcome {
            ComputeOutcome::Success { outputs } => assert_eq!(outputs["y"], json!(6.0)),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_worker_ids() {
        let pool = LocalPool::start("test", 3, registry());
        assert_eq!(pool.worker_ids().await.unwrap(), vec!["0", "1", "2"]);
    }

    #[tokio::test]
    async fn test_empty_pool_rejects_submit() {
        let registry = registry();
        let pool = LocalPool::start("empty", 0, registry.clone());
        assert!(pool.worker_ids().await.unwrap().is_empty());

        let result = pool.submit(request(&registry, "double", InputSnapshot::new()));
        assert!(matches!(result, Err(PoolError::NoWorkers(_))));
    }

    #[tokio::test]
    async fn test_close_fails_outstanding_requests() {
        let registry = registry();
        let pool = LocalPool::start("test", 1, registry.clone());

        let in_flight = pool.submit(request(&registry, "slow", InputSnapshot::new())).unwrap();
        let queued = pool.submit(request(&registry, "slow", InputSnapshot::new())).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        pool.close().await;

        assert!(in_flight.await.is_err());
        assert!(queued.await.is_err());
        assert!(!pool.is_live().await);
        assert!(matches!(
            pool.submit(request(&registry, "slow", InputSnapshot::new())),
            Err(PoolError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_clusters_reuse_running_pool() {
        let clusters = LocalClusters::new(registry());
        assert!(clusters.running("lab").is_none());

        let first = clusters.start("lab", 2);
        let second = clusters.start("lab", 5);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.worker_ids().await.unwrap().len(), 2);

        clusters.stop("lab").await;
        assert!(clusters.running("lab").is_none());
        assert!(first.is_closed());
    }
}
