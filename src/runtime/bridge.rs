//! Completion Bridge
//!
//! Folds a finished remote request back into the pipeline. Each handle is
//! registered once with a `CompletionContext`; when the pool delivers the
//! result the bridge allocates log ids, updates the module, records
//! provenance and resumes the module's task.
//!
//! Handle states: `Submitted -> Resolved`. A handle is forgotten as soon as
//! it resolves, so a second delivery for it is rejected the same way as a
//! delivery for a handle that was never registered.
//!
//! Deliveries arrive on pool notification tasks, so every mutation of module
//! outputs, the id scope and the scheduler is serialized by `apply_lock`.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::invoker::AsyncHandle;
use super::module::{AsyncTask, ModuleError, PipelineModule};
use crate::compute::{ComputeOutcome, ComputeResult};
use crate::pool::PoolError;
use crate::provenance::{
    kinds, Machine, ModuleExecutionRecord, RemoteExecution, SharedRecorder, COMPLETED_FAILURE,
    COMPLETED_SUCCESS,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeIntegrityError {
    #[error("Handle {0} already has a continuation")]
    AlreadyRegistered(Uuid),

    #[error("Handle {0} is not registered or was already resolved")]
    Unregistered(Uuid),
}

/// What the pool delivered for a handle
#[derive(Debug, Clone)]
pub enum Delivery {
    Completed(ComputeResult),
    Lost(PoolError),
}

/// Everything the continuation needs, passed explicitly
pub struct CompletionContext {
    pub module: Arc<dyn PipelineModule>,
    pub task: AsyncTask,
    pub recorder: SharedRecorder,
    pub scheme: String,
    pub annotations: Vec<(String, String)>,
}

/// A submitted handle waiting for its delivery
struct Registration {
    context: CompletionContext,
    submitted_at: chrono::DateTime<Utc>,
    profile: String,
}

/// Registers and fires one-shot continuations for async handles
#[derive(Default)]
pub struct CompletionBridge {
    handles: DashMap<Uuid, Registration>,
    apply_lock: Mutex<()>,
}

impl CompletionBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the continuation for `handle` and start waiting on it
    pub fn on_complete(
        self: &Arc<Self>,
        handle: AsyncHandle,
        context: CompletionContext,
    ) -> Result<Uuid, BridgeIntegrityError> {
        let id = handle.id();
        match self.handles.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(BridgeIntegrityError::AlreadyRegistered(id));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Registration {
                    context,
                    submitted_at: handle.submitted_at(),
                    profile: handle.profile().to_string(),
                });
            }
        }

        debug!(
            "Waiting on request {} for handle {} (profile '{}')",
            handle.request_id(),
            id,
            handle.profile()
        );
        let bridge = Arc::clone(self);
        let pending = handle.into_pending();
        tokio::spawn(async move {
            let delivery = match pending.await {
                Ok(Ok(result)) => Delivery::Completed(result),
                Ok(Err(e)) => Delivery::Lost(e),
                Err(_) => Delivery::Lost(PoolError::Transport(
                    "pool closed before the request completed".to_string(),
                )),
            };
            if let Err(e) = bridge.resolve(id, delivery).await {
                error!("Completion bridge integrity violation: {}", e);
            }
        });

        Ok(id)
    }

    /// Fire the continuation for `id`. Valid exactly once per registered handle.
    pub async fn resolve(
        &self,
        id: Uuid,
        delivery: Delivery,
    ) -> Result<Option<ModuleExecutionRecord>, BridgeIntegrityError> {
        let (_, registration) = self
            .handles
            .remove(&id)
            .ok_or(BridgeIntegrityError::Unregistered(id))?;
        let Registration {
            context,
            submitted_at,
            profile,
        } = registration;

        let _serialized = self.apply_lock.lock().await;
        let record = match delivery {
            Delivery::Completed(result) => Some(apply_result(context, result, submitted_at).await),
            Delivery::Lost(reason) => {
                error!(
                    "Lost connection to profile '{}' while module '{}' was running: {}",
                    profile,
                    context.module.name(),
                    reason
                );
                let err = ModuleError::ConnectionLost {
                    module: context.module.name().to_string(),
                    profile,
                    reason: reason.to_string(),
                };
                context.task.resume(Err(err));
                None
            }
        };
        Ok(record)
    }

    /// Handles registered but not yet resolved
    pub fn outstanding(&self) -> usize {
        self.handles.len()
    }
}

async fn apply_result(
    context: CompletionContext,
    result: ComputeResult,
    submitted_at: chrono::DateTime<Utc>,
) -> ModuleExecutionRecord {
    let CompletionContext {
        module,
        task,
        recorder,
        scheme,
        annotations,
    } = context;
    let ComputeResult { outcome, machine } = result;

    let scope = module.id_scope();
    let machine = Machine {
        id: scope.new_id(kinds::MACHINE),
        info: machine,
    };
    let error_message = outcome.error_message();
    let record = ModuleExecutionRecord {
        id: scope.new_id(kinds::MODULE_EXEC),
        module_id: module.id(),
        module_name: module.name().to_string(),
        machine_id: machine.id,
        completed: if outcome.is_success() {
            COMPLETED_SUCCESS
        } else {
            COMPLETED_FAILURE
        },
        error: error_message,
        ts_start: submitted_at,
        ts_end: Utc::now(),
    };

    let failure = match outcome {
        ComputeOutcome::Success { outputs } => {
            debug!(
                "Module '{}' produced {} output(s) on {}",
                module.name(),
                outputs.len(),
                machine.info.name
            );
            module.merge_outputs(outputs);
            None
        }
        ComputeOutcome::Failure {
            error_kind,
            error_args,
            stack_trace,
        } => {
            let message = error_args.first().cloned().unwrap_or_default();
            error!(
                "Module '{}' failed on {}: {}: {}",
                module.name(),
                machine.info.name,
                error_kind,
                message
            );
            debug!("Remote stack trace:\n{}", stack_trace);
            Some(module.remote_error(&error_kind, &message, &stack_trace))
        }
    };

    let entry = RemoteExecution {
        scheme,
        annotations,
        machine,
        execution: record.clone(),
    };
    if let Err(e) = recorder.record(entry).await {
        warn!(
            "Failed to record execution {} of module '{}': {}",
            record.id,
            module.name(),
            e
        );
    }

    info!(
        "Module '{}' completed remotely (code {})",
        module.name(),
        record.completed
    );
    task.resume(match failure {
        Some(err) => Err(err),
        None => Ok(()),
    });
    record
}
