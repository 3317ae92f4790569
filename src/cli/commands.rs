//! Command implementations for the CLI
//!
//! SBIO pattern: Commands return Results, I/O is handled by caller

use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::compute::{ComputeRegistry, InputSnapshot, Outputs, PortValue};
use crate::config::{validate_profiles, ConfigError, PoolEndpoint, ProfilesConfig};
use crate::connection::{ConnectionManager, ProfileConnector};
use crate::pool::LocalClusters;
use crate::provenance::{
    ExecutionLog, IdScope, JsonlRecorder, ProvenanceError, ProvenanceRecorder, RemoteExecution,
};
use crate::runtime::{ExecutionTarget, LocalModule, OffloadScheme};

/// Errors that can occur during command execution
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Provenance error: {0}")]
    Provenance(#[from] ProvenanceError),

    #[error("Unknown compute function '{0}'")]
    UnknownCompute(String),

    #[error("Invalid input '{0}': expected PORT=JSON")]
    InvalidInput(String),
}

/// Result type for commands
pub type CommandResult<T> = Result<T, CommandError>;

// ============================================================================
// Input parsing (Pure)
// ============================================================================

/// Parse `port=value`. The value is read as JSON, falling back to a plain
/// string when it isn't valid JSON.
pub fn parse_input(raw: &str) -> CommandResult<(String, Value)> {
    let (port, value) = raw
        .split_once('=')
        .ok_or_else(|| CommandError::InvalidInput(raw.to_string()))?;
    let port = port.trim();
    if port.is_empty() {
        return Err(CommandError::InvalidInput(raw.to_string()));
    }
    let value =
        serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((port.to_string(), value))
}

/// Build a snapshot from `port=value` pairs; a repeated port accumulates a list
pub fn build_inputs(raw: &[String]) -> CommandResult<InputSnapshot> {
    let mut ports: IndexMap<String, Vec<Value>> = IndexMap::new();
    for entry in raw {
        let (port, value) = parse_input(entry)?;
        ports.entry(port).or_default().push(value);
    }
    Ok(ports
        .into_iter()
        .map(|(port, values)| (port, PortValue::list(values)))
        .collect())
}

// ============================================================================
// Profile Commands (Pure business logic)
// ============================================================================

/// Info about a profile for display
#[derive(Debug, Clone)]
pub struct ProfileInfo {
    pub name: String,
    pub kind: String,
    pub target: String,
    pub is_default: bool,
}

/// List all profiles
pub fn profiles_list(config: &ProfilesConfig) -> Vec<ProfileInfo> {
    config
        .names()
        .into_iter()
        .filter_map(|name| {
            let endpoint = config.endpoint(name).ok()?;
            let (kind, target) = match endpoint {
                PoolEndpoint::Local { workers } => ("local", format!("{} workers", workers)),
                PoolEndpoint::Http { urls, .. } => ("http", urls.join(", ")),
            };
            Some(ProfileInfo {
                name: name.to_string(),
                kind: kind.to_string(),
                target,
                is_default: config.default_profile.as_deref() == Some(name),
            })
        })
        .collect()
}

/// Make `name` the default profile
pub fn profiles_use(config: &mut ProfilesConfig, name: &str) -> CommandResult<()> {
    config.endpoint(name)?;
    config.default_profile = Some(name.to_string());
    Ok(())
}

/// Add a profile; the first profile added becomes the default
pub fn profiles_add(
    config: &mut ProfilesConfig,
    name: &str,
    endpoint: PoolEndpoint,
) -> CommandResult<()> {
    let mut updated = config.clone();
    updated.add_profile(name, endpoint);
    if updated.default_profile.is_none() {
        updated.default_profile = Some(name.to_string());
    }
    validate_profiles(&updated)?;
    *config = updated;
    Ok(())
}

/// Delete a profile
pub fn profiles_delete(config: &mut ProfilesConfig, name: &str) -> bool {
    config.remove_profile(name).is_some()
}

// ============================================================================
// Run Command
// ============================================================================

/// Everything `offload run` reports
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub profile: String,
    pub outputs: Outputs,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<RemoteExecution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Offload one computation and wait for it.
///
/// Local profiles have their pool started here, since this process is the
/// only cluster manager they have.
pub async fn run_compute(
    profiles: ProfilesConfig,
    registry: Arc<ComputeRegistry>,
    compute: &str,
    profile: Option<&str>,
    inputs: InputSnapshot,
    log: Option<&Path>,
) -> CommandResult<RunReport> {
    let profile = profiles.resolve(profile)?.to_string();
    let code = registry
        .get(compute)
        .ok_or_else(|| CommandError::UnknownCompute(compute.to_string()))?;

    let clusters = LocalClusters::new(registry.clone());
    if let PoolEndpoint::Local { workers } = profiles.endpoint(&profile)? {
        clusters.start(&profile, *workers);
    }

    let recorder = Arc::new(ExecutionLog::new());
    let connector = Arc::new(ProfileConnector::new(profiles, clusters));
    let scheme = OffloadScheme::new(
        Arc::new(ConnectionManager::new(connector)),
        recorder.clone(),
    );

    let module = Arc::new(LocalModule::new(1, code, Arc::new(IdScope::new())).with_inputs(inputs));
    let outcome = scheme
        .execute(&ExecutionTarget::on_profile(profile.clone()), module.clone())
        .await;
    scheme.finalize().await;

    let execution = recorder.executions().await.into_iter().next();
    if let (Some(path), Some(entry)) = (log, execution.clone()) {
        JsonlRecorder::new(path).record(entry).await?;
    }

    Ok(RunReport {
        profile,
        outputs: module.outputs(),
        execution,
        error: outcome.err().map(|e| e.to_string()),
    })
}
