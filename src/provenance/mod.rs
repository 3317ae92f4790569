//! Provenance recording for remote executions
//!
//! A recorder receives a machine record and the module execution record that
//! references it, in a single call, so the machine is always persisted no
//! later than the execution pointing at it.

pub mod machine;

pub use machine::MachineInfo;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

/// Completion code for a successful execution
pub const COMPLETED_SUCCESS: i32 = 1;

/// Completion code for a failed execution
pub const COMPLETED_FAILURE: i32 = -1;

/// Identifier kinds allocated from an `IdScope`
pub mod kinds {
    pub const MACHINE: &str = "machine";
    pub const MODULE_EXEC: &str = "module_exec";
}

#[derive(Error, Debug)]
pub enum ProvenanceError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Execution {0} references unknown machine {1}")]
    DanglingMachine(u64, u64),
}

/// Per-run identifier allocator; ids are monotonic per kind, starting at 1
#[derive(Debug, Default)]
pub struct IdScope {
    counters: DashMap<String, AtomicU64>,
}

impl IdScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_id(&self, kind: &str) -> u64 {
        self.counters
            .entry(kind.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::SeqCst)
            + 1
    }

    /// Last id handed out for `kind`, 0 if none
    pub fn last_id(&self, kind: &str) -> u64 {
        self.counters
            .get(kind)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

/// Machine description with its log identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub id: u64,
    #[serde(flatten)]
    pub info: MachineInfo,
}

/// One module invocation as seen by the execution log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleExecutionRecord {
    pub id: u64,
    pub module_id: u64,
    pub module_name: String,
    pub machine_id: u64,
    /// 1 on success, -1 on failure
    pub completed: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub ts_start: DateTime<Utc>,
    pub ts_end: DateTime<Utc>,
}

impl ModuleExecutionRecord {
    pub fn succeeded(&self) -> bool {
        self.completed == COMPLETED_SUCCESS
    }
}

/// Everything persisted for one remote execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteExecution {
    pub scheme: String,
    pub annotations: Vec<(String, String)>,
    pub machine: Machine,
    pub execution: ModuleExecutionRecord,
}

/// Persists remote execution provenance
#[async_trait]
pub trait ProvenanceRecorder: Send + Sync {
    async fn record(&self, entry: RemoteExecution) -> Result<(), ProvenanceError>;
}

pub type SharedRecorder = Arc<dyn ProvenanceRecorder>;

/// In-memory execution log
#[derive(Debug, Default)]
pub struct ExecutionLog {
    entries: RwLock<LogEntries>,
}

#[derive(Debug, Default)]
struct LogEntries {
    machines: Vec<Machine>,
    executions: Vec<RemoteExecution>,
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn machines(&self) -> Vec<Machine> {
        self.entries.read().await.machines.clone()
    }

    pub async fn executions(&self) -> Vec<RemoteExecution> {
        self.entries.read().await.executions.clone()
    }

    pub async fn machine(&self, id: u64) -> Option<Machine> {
        self.entries
            .read()
            .await
            .machines
            .iter()
            .find(|m| m.id == id)
            .cloned()
    }
}

#[async_trait]
impl ProvenanceRecorder for ExecutionLog {
    async fn record(&self, entry: RemoteExecution) -> Result<(), ProvenanceError> {
        if entry.execution.machine_id != entry.machine.id {
            return Err(ProvenanceError::DanglingMachine(
                entry.execution.id,
                entry.execution.machine_id,
            ));
        }
        let mut entries = self.entries.write().await;
        entries.machines.push(entry.machine.clone());
        entries.executions.push(entry);
        Ok(())
    }
}

/// Appends one JSON line per remote execution to a file
#[derive(Debug)]
pub struct JsonlRecorder {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl JsonlRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ProvenanceRecorder for JsonlRecorder {
    async fn record(&self, entry: RemoteExecution) -> Result<(), ProvenanceError> {
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
