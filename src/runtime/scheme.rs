//! Remote offload execution scheme
//!
//! Entry point the pipeline engine calls to run one module on a remote worker
//! pool. `do_compute` performs every synchronous check (scheme, profile,
//! connection, worker availability) before anything is submitted, then hands
//! the in-flight request to the completion bridge and returns the module's
//! suspended task.

use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info};

use super::bridge::{BridgeIntegrityError, CompletionBridge, CompletionContext};
use super::invoker::RemoteInvoker;
use super::module::{make_async_task, ModuleError, PipelineModule, SuspendedTask};
use crate::connection::{ConnectionError, ConnectionManager};
use crate::pool::PoolError;
use crate::provenance::SharedRecorder;

pub const SCHEME_NAME: &str = "remote-standalone";
pub const SCHEME_PRIORITY: u32 = 40;

/// Annotation naming the connection profile
pub const PROFILE_ANNOTATION: &str = "remote-profile";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchemeType {
    /// Runs on a pool without a dedicated host process
    RemoteNoHost,
}

/// Static description of the scheme
#[derive(Debug, Clone, Serialize)]
pub struct SchemeDescriptor {
    pub name: &'static str,
    pub priority: u32,
    pub scheme_type: SchemeType,
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(ConnectionError),

    #[error("Pool unavailable: no workers in profile '{0}'")]
    PoolUnavailable(String),

    #[error("Submit failed: {0}")]
    Submit(PoolError),

    #[error("Completion bridge error: {0}")]
    Bridge(#[from] BridgeIntegrityError),
}

impl From<ConnectionError> for DispatchError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::PoolUnavailable(profile) => Self::PoolUnavailable(profile),
            other => Self::Connection(other),
        }
    }
}

impl From<PoolError> for DispatchError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::NoWorkers(profile) => Self::PoolUnavailable(profile),
            other => Self::Submit(other),
        }
    }
}

/// Where the engine wants a module executed
#[derive(Debug, Clone, Default)]
pub struct ExecutionTarget {
    pub scheme: String,
    pub annotations: IndexMap<String, String>,
}

impl ExecutionTarget {
    /// Target this scheme with no annotations
    pub fn remote() -> Self {
        Self {
            scheme: SCHEME_NAME.to_string(),
            annotations: IndexMap::new(),
        }
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Target this scheme on `profile`
    pub fn on_profile(profile: impl Into<String>) -> Self {
        Self::remote().with_annotation(PROFILE_ANNOTATION, profile)
    }

    pub fn profile(&self) -> Option<&str> {
        self.annotations
            .get(PROFILE_ANNOTATION)
            .map(String::as_str)
            .filter(|p| !p.trim().is_empty())
    }
}

/// Offloads module computations to worker pools
pub struct OffloadScheme {
    connections: Arc<ConnectionManager>,
    bridge: Arc<CompletionBridge>,
    recorder: SharedRecorder,
    invoker: RemoteInvoker,
    connect_only: bool,
}

impl OffloadScheme {
    pub fn new(connections: Arc<ConnectionManager>, recorder: SharedRecorder) -> Self {
        Self {
            connections,
            bridge: Arc::new(CompletionBridge::new()),
            recorder,
            invoker: RemoteInvoker::new(),
            connect_only: true,
        }
    }

    /// Allow `do_compute` to start a pool that is not running yet
    pub fn with_connect_only(mut self, connect_only: bool) -> Self {
        self.connect_only = connect_only;
        self
    }

    pub fn descriptor() -> SchemeDescriptor {
        SchemeDescriptor {
            name: SCHEME_NAME,
            priority: SCHEME_PRIORITY,
            scheme_type: SchemeType::RemoteNoHost,
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn bridge(&self) -> &Arc<CompletionBridge> {
        &self.bridge
    }

    /// Dispatch `module` and return its suspended task.
    ///
    /// Every error returned here happens before the request reaches a worker.
    pub async fn do_compute(
        &self,
        target: &ExecutionTarget,
        module: Arc<dyn PipelineModule>,
    ) -> Result<SuspendedTask, DispatchError> {
        if target.scheme != SCHEME_NAME {
            return Err(DispatchError::Configuration(format!(
                "Module '{}' targets scheme '{}', not '{}'",
                module.name(),
                target.scheme,
                SCHEME_NAME
            )));
        }
        let profile = target.profile().ok_or_else(|| {
            DispatchError::Configuration(format!(
                "No '{}' annotation configured for module '{}'",
                PROFILE_ANNOTATION,
                module.name()
            ))
        })?;

        let handle = self
            .connections
            .ensure_connection(profile, self.connect_only)
            .await?;
        let workers = self.connections.available_workers(&handle).await?;
        debug!(
            "Dispatching module '{}' to profile '{}' ({} workers)",
            module.name(),
            profile,
            workers.len()
        );

        let code = module.compute_code();
        let inputs = module.input_snapshot();
        let async_handle = self.invoker.submit(&handle, &code, inputs)?;

        let (task, suspended) = make_async_task(module.id());
        let context = CompletionContext {
            module: module.clone(),
            task,
            recorder: self.recorder.clone(),
            scheme: SCHEME_NAME.to_string(),
            annotations: target
                .annotations
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        self.bridge.on_complete(async_handle, context)?;

        info!("Module '{}' offloaded to profile '{}'", module.name(), profile);
        Ok(suspended)
    }

    /// Dispatch `module` and wait for it, reporting every failure through the
    /// module's own error contract
    pub async fn execute(
        &self,
        target: &ExecutionTarget,
        module: Arc<dyn PipelineModule>,
    ) -> Result<(), ModuleError> {
        match self.do_compute(target, module.clone()).await {
            Ok(suspended) => suspended.wait().await,
            Err(e) => {
                error!("Dispatch of module '{}' failed: {}", module.name(), e);
                Err(module.error(&e.to_string()))
            }
        }
    }

    /// Close every pool connection opened by this scheme
    pub async fn finalize(&self) {
        self.connections.shutdown_all().await;
    }
}
