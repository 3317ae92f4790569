//! Pipeline-side collaborator contract
//!
//! The execution engine owns modules; this crate only needs to read a
//! module's inputs, write its outputs, raise errors on its behalf, draw ids
//! from the run's scope, and suspend/resume its task.

use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

use crate::compute::{ComputeCode, InputSnapshot, Outputs, PortValue};
use crate::provenance::IdScope;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModuleError {
    #[error("Module '{module}': {message}")]
    Failed { module: String, message: String },

    #[error("Module '{module}' failed remotely with {kind}: {message}")]
    Remote {
        module: String,
        kind: String,
        message: String,
        stack_trace: String,
    },

    #[error("Module '{module}': connection to profile '{profile}' lost ({reason})")]
    ConnectionLost {
        module: String,
        profile: String,
        reason: String,
    },

    #[error("Task for module {0} was dropped without being resumed")]
    Abandoned(u64),
}

/// A module as seen by the offload machinery
pub trait PipelineModule: Send + Sync {
    fn id(&self) -> u64;

    fn name(&self) -> &str;

    /// The code the module runs when computing
    fn compute_code(&self) -> Arc<ComputeCode>;

    /// Current input port values, captured by value
    fn input_snapshot(&self) -> InputSnapshot;

    /// Merge values into the module's output ports
    fn merge_outputs(&self, outputs: Outputs);

    /// The run's identifier scope
    fn id_scope(&self) -> Arc<IdScope>;

    /// Build the error the pipeline reports for this module
    fn error(&self, message: &str) -> ModuleError {
        ModuleError::Failed {
            module: self.name().to_string(),
            message: message.to_string(),
        }
    }

    /// Build the error the pipeline reports when the computation failed on a
    /// worker. Called once per failed remote execution, after it is logged.
    fn remote_error(&self, kind: &str, message: &str, stack_trace: &str) -> ModuleError {
        ModuleError::Remote {
            module: self.name().to_string(),
            kind: kind.to_string(),
            message: message.to_string(),
            stack_trace: stack_trace.to_string(),
        }
    }
}

/// Resume side of a suspended module task
#[derive(Debug)]
pub struct AsyncTask {
    module_id: u64,
    resume_tx: oneshot::Sender<Result<(), ModuleError>>,
}

/// Waiting side of a suspended module task
#[derive(Debug)]
pub struct SuspendedTask {
    module_id: u64,
    resume_rx: oneshot::Receiver<Result<(), ModuleError>>,
}

/// Suspend a module's task; the returned `AsyncTask` resumes it exactly once
pub fn make_async_task(module_id: u64) -> (AsyncTask, SuspendedTask) {
    let (resume_tx, resume_rx) = oneshot::channel();
    (
        AsyncTask {
            module_id,
            resume_tx,
        },
        SuspendedTask {
            module_id,
            resume_rx,
        },
    )
}

impl AsyncTask {
    /// Hand the outcome back to the scheduler. Returns false if nobody waits.
    pub fn resume(self, outcome: Result<(), ModuleError>) -> bool {
        debug!(
            "Resuming task for module {} ({})",
            self.module_id,
            if outcome.is_ok() { "ok" } else { "error" }
        );
        self.resume_tx.send(outcome).is_ok()
    }
}

impl SuspendedTask {
    /// Wait until the task is resumed
    pub async fn wait(self) -> Result<(), ModuleError> {
        self.resume_rx
            .await
            .unwrap_or(Err(ModuleError::Abandoned(self.module_id)))
    }
}

/// Self-contained module used by the CLI and tests
pub struct LocalModule {
    id: u64,
    name: String,
    code: Arc<ComputeCode>,
    inputs: Mutex<InputSnapshot>,
    outputs: Mutex<Outputs>,
    id_scope: Arc<IdScope>,
}

impl LocalModule {
    pub fn new(id: u64, code: Arc<ComputeCode>, id_scope: Arc<IdScope>) -> Self {
        Self {
            id,
            name: code.name().to_string(),
            code,
            inputs: Mutex::new(InputSnapshot::new()),
            outputs: Mutex::new(Outputs::new()),
            id_scope,
        }
    }

    pub fn with_inputs(self, inputs: InputSnapshot) -> Self {
        *lock(&self.inputs) = inputs;
        self
    }

    /// Connect a value to an input port
    pub fn set_input(&self, port: impl Into<String>, value: Value) {
        lock(&self.inputs).insert(port, PortValue::new(value, false));
    }

    pub fn outputs(&self) -> Outputs {
        lock(&self.outputs).clone()
    }
}

impl PipelineModule for LocalModule {
    fn id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn compute_code(&self) -> Arc<ComputeCode> {
        self.code.clone()
    }

    fn input_snapshot(&self) -> InputSnapshot {
        lock(&self.inputs).clone()
    }

    fn merge_outputs(&self, outputs: Outputs) {
        lock(&self.outputs).extend(outputs);
    }

    fn id_scope(&self) -> Arc<IdScope> {
        self.id_scope.clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
