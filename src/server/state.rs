use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::compute::ComputeRegistry;
use crate::pool::WorkerId;

/// Shared worker server state
#[derive(Clone)]
pub struct WorkerState {
    pub registry: Arc<ComputeRegistry>,
    pub permits: Arc<Semaphore>,
    pub worker_ids: Arc<Vec<WorkerId>>,
    pub api_key: Option<String>,
}

impl WorkerState {
    /// State for a server running at most `workers` computations at once
    pub fn new(registry: Arc<ComputeRegistry>, workers: usize) -> Self {
        Self {
            registry,
            permits: Arc::new(Semaphore::new(workers)),
            worker_ids: Arc::new((0..workers).map(|i| i.to_string()).collect()),
            api_key: None,
        }
    }

    /// Require `Authorization: Bearer <key>` on compute and worker routes
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Check a raw `Authorization` header value against the configured key
    pub fn authorize(&self, header: Option<&str>) -> bool {
        match &self.api_key {
            None => true,
            Some(key) => header
                .and_then(|h| h.strip_prefix("Bearer "))
                .map(|token| token == key)
                .unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_ids() {
        let state = WorkerState::new(Arc::new(ComputeRegistry::new()), 3);
        assert_eq!(*state.worker_ids, vec!["0", "1", "2"]);
        assert_eq!(state.permits.available_permits(), 3);
    }

    #[test]
    fn test_authorize() {
        let open = WorkerState::new(Arc::new(ComputeRegistry::new()), 1);
        assert!(open.authorize(None));

        let locked = open.with_api_key("secret");
        assert!(locked.authorize(Some("Bearer secret")));
        assert!(!locked.authorize(Some("Bearer nope")));
        assert!(!locked.authorize(Some("secret")));
        assert!(!locked.authorize(None));
    }
}
