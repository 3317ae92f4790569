//! Worker pool reached over HTTP
//!
//! Each URL is a worker server (see `crate::server`). Requests are spread over
//! the URLs round-robin and each one runs as its own task, so `submit` returns
//! as soon as the task is spawned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use super::{PendingResult, PoolError, RoundRobin, WorkerId, WorkerPool};
use crate::compute::{ComputeRequest, ComputeResult};

/// Body of `GET /v1/workers`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersResponse {
    pub workers: Vec<WorkerId>,
}

/// Connection to a set of worker servers
pub struct HttpPool {
    profile: String,
    urls: Vec<String>,
    api_key: Option<String>,
    client: Client,
    view: RoundRobin,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl HttpPool {
    /// Connect to `urls`, failing if none of them answers a health probe
    pub async fn connect(
        profile: impl Into<String>,
        urls: Vec<String>,
        api_key: Option<String>,
    ) -> Result<Self, PoolError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| PoolError::Transport(e.to_string()))?;
        let (shutdown_tx, _) = watch::channel(false);

        let pool = Self {
            profile: profile.into(),
            urls: urls
                .into_iter()
                .map(|u| u.trim_end_matches('/').to_string())
                .collect(),
            api_key,
            client,
            view: RoundRobin::new(),
            closed: AtomicBool::new(false),
            shutdown_tx,
        };

        if !pool.probe_any().await {
            return Err(PoolError::Unreachable(
                pool.urls.join(", "),
                "no worker answered the health probe".to_string(),
            ));
        }
        info!(
            "Connected to http pool '{}' ({} urls)",
            pool.profile,
            pool.urls.len()
        );
        Ok(pool)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("Authorization", format!("Bearer {}", key)),
            None => req,
        }
    }

    async fn probe(&self, url: &str) -> bool {
        let req = self
            .authorize(self.client.get(format!("{}/health", url)))
            .timeout(Duration::from_secs(5));
        matches!(req.send().await, Ok(r) if r.status().is_success())
    }

    async fn probe_any(&self) -> bool {
        for url in &self.urls {
            if self.probe(url).await {
                return true;
            }
        }
        false
    }

    async fn fetch_workers(&self, url: &str) -> Result<Vec<WorkerId>, PoolError> {
        let response = self
            .authorize(self.client.get(format!("{}/v1/workers", url)))
            .send()
            .await
            .map_err(|e| PoolError::Unreachable(url.to_string(), e.to_string()))?;
        let body: WorkersResponse = decode(response).await?;
        Ok(body
            .workers
            .into_iter()
            .map(|id| format!("{}#{}", url, id))
            .collect())
    }
}

async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T, PoolError> {
    let status = response.status();
    if !status.is_success() {
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(PoolError::Api {
            status: status.as_u16(),
            message,
        });
    }
    response
        .json::<T>()
        .await
        .map_err(|e| PoolError::Transport(e.to_string()))
}

#[async_trait]
impl WorkerPool for HttpPool {
    fn profile(&self) -> &str {
        &self.profile
    }

    async fn is_live(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.probe_any().await
    }

    async fn worker_ids(&self) -> Result<Vec<WorkerId>, PoolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed(self.profile.clone()));
        }
        let mut ids = Vec::new();
        for url in &self.urls {
            match self.fetch_workers(url).await {
                Ok(mut found) => ids.append(&mut found),
                Err(e) => warn!("Skipping workers at {}: {}", url, e),
            }
        }
        Ok(ids)
    }

    fn submit(&self, request: ComputeRequest) -> Result<PendingResult, PoolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed(self.profile.clone()));
        }
        let index = self
            .view
            .pick(self.urls.len())
            .ok_or_else(|| PoolError::NoWorkers(self.profile.clone()))?;
        let url = format!("{}/v1/compute", self.urls[index]);

        let (reply, pending) = oneshot::channel();
        let call = self.authorize(self.client.post(&url).json(&request));
        let mut shutdown = self.shutdown_tx.subscribe();
        let request_id = request.request_id;

        tokio::spawn(async move {
            debug!("Posting request {} to {}", request_id, url);
            tokio::select! {
                sent = call.send() => {
                    let result = match sent {
                        Ok(response) => decode::<ComputeResult>(response).await,
                        Err(e) => Err(PoolError::Transport(e.to_string())),
                    };
                    let _ = reply.send(result);
                }
                _ = shutdown.changed() => {
                    debug!("Dropping request {}: pool closed", request_id);
                }
            }
        });

        Ok(pending)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.shutdown_tx.send(true);
            info!("Closed http pool '{}'", self.profile);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_unreachable() {
        // Port 9 (discard) is not expected to run a worker server.
        let result = HttpPool::connect("lab", vec!["http://127.0.0.1:9".to_string()], None).await;
        assert!(matches!(result, Err(PoolError::Unreachable(_, _))));
    }

    #[test]
    fn test_workers_response_format() {
        let body: WorkersResponse = serde_json::from_str(r#"{"workers": ["0", "1"]}"#).unwrap();
        assert_eq!(body.workers, vec!["0", "1"]);
    }
}
