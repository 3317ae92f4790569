//! Worker pool backends
//!
//! A worker pool accepts self-contained `ComputeRequest`s and answers each one
//! exactly once through a pending receiver. Submission never blocks on the
//! computation itself. Closing a pool drops every pending reply, which callers
//! observe as a lost connection.

pub mod http;
pub mod local;

pub use http::HttpPool;
pub use local::{LocalClusters, LocalPool};

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::compute::{ComputeRequest, ComputeResult};

/// Identifier of a single worker inside a pool
pub type WorkerId = String;

/// Reply channel for one submitted request
pub type PendingResult = oneshot::Receiver<Result<ComputeResult, PoolError>>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
    #[error("Pool '{0}' is closed")]
    Closed(String),

    #[error("Pool '{0}' has no workers")]
    NoWorkers(String),

    #[error("Worker unreachable at {0}: {1}")]
    Unreachable(String, String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Worker returned {status}: {message}")]
    Api { status: u16, message: String },
}

/// A live connection to a pool of workers
#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Profile this pool was opened for
    fn profile(&self) -> &str;

    /// Cheap liveness probe used before reusing a cached connection
    async fn is_live(&self) -> bool;

    /// Workers currently able to take requests
    async fn worker_ids(&self) -> Result<Vec<WorkerId>, PoolError>;

    /// Queue a request on the next worker of the load-balanced view.
    /// Returns as soon as the request is queued.
    fn submit(&self, request: ComputeRequest) -> Result<PendingResult, PoolError>;

    /// Tear down the connection, failing every outstanding request
    async fn close(&self);
}

/// Round-robin cursor over `n` targets
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the next target, `None` when there are no targets
    pub fn pick(&self, n: usize) -> Option<usize> {
        if n == 0 {
            return None;
        }
        Some(self.next.fetch_add(1, Ordering::Relaxed) % n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_cycles() {
        let rr = RoundRobin::new();
        let picks: Vec<usize> = (0..5).filter_map(|_| rr.pick(3)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn test_round_robin_empty() {
        assert_eq!(RoundRobin::new().pick(0), None);
    }
}
