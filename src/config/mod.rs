//! Connection profile configuration
//!
//! Profiles name a worker pool and describe how to reach it. They live in a
//! YAML file (default `~/.offload/profiles`), in the same spirit as a
//! kubeconfig: a map of named entries plus an optional default.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default port a worker server listens on
pub const DEFAULT_WORKER_PORT: u16 = 8090;

/// Default number of workers for a local pool
pub const DEFAULT_LOCAL_WORKERS: usize = 2;

/// Default profiles file location: ~/.offload/profiles
pub fn default_profiles_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".offload")
        .join("profiles")
}

/// Errors that can occur while loading or editing profiles
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Profile '{0}' not found")]
    ProfileNotFound(String),

    #[error("No profile configured")]
    NoProfile,

    #[error("Failed to parse profiles: {0}")]
    ParseError(String),

    #[error("Failed to write profiles: {0}")]
    WriteError(String),

    #[error("Invalid profile '{0}': {1}")]
    Invalid(String, String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// How a profile's worker pool is reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PoolEndpoint {
    /// In-process pool of worker tasks
    Local {
        #[serde(default = "default_local_workers")]
        workers: usize,
    },
    /// Remote worker servers reached over HTTP
    Http {
        urls: Vec<String>,
        #[serde(rename = "api-key")]
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
    },
}

fn default_local_workers() -> usize {
    DEFAULT_LOCAL_WORKERS
}

/// The complete profiles file
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProfilesConfig {
    /// Profile used when a caller does not name one
    #[serde(rename = "default-profile")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_profile: Option<String>,

    /// Map of profile name to pool endpoint
    #[serde(default)]
    pub profiles: HashMap<String, PoolEndpoint>,
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Parse profiles from a YAML string
pub fn parse_profiles(content: &str) -> Result<ProfilesConfig, ConfigError> {
    let config: ProfilesConfig =
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    validate_profiles(&config)?;
    Ok(config)
}

/// Serialize profiles to a YAML string
pub fn serialize_profiles(config: &ProfilesConfig) -> Result<String, ConfigError> {
    serde_yaml::to_string(config).map_err(|e| ConfigError::WriteError(e.to_string()))
}

/// Reject profiles that could never yield a usable pool
pub fn validate_profiles(config: &ProfilesConfig) -> Result<(), ConfigError> {
    for (name, endpoint) in &config.profiles {
        match endpoint {
            PoolEndpoint::Local { workers } if *workers == 0 => {
                return Err(ConfigError::Invalid(
                    name.clone(),
                    "local pool needs at least one worker".to_string(),
                ));
            }
            PoolEndpoint::Http { urls, .. } if urls.is_empty() => {
                return Err(ConfigError::Invalid(
                    name.clone(),
                    "http pool needs at least one url".to_string(),
                ));
            }
            _ => {}
        }
    }
    if let Some(default) = &config.default_profile {
        if !config.profiles.contains_key(default) {
            return Err(ConfigError::ProfileNotFound(default.clone()));
        }
    }
    Ok(())
}

impl ProfilesConfig {
    /// Add or replace a profile
    pub fn add_profile(&mut self, name: impl Into<String>, endpoint: PoolEndpoint) {
        self.profiles.insert(name.into(), endpoint);
    }

    /// Remove a profile, clearing the default if it pointed there
    pub fn remove_profile(&mut self, name: &str) -> Option<PoolEndpoint> {
        let removed = self.profiles.remove(name);
        if self.default_profile.as_deref() == Some(name) {
            self.default_profile = None;
        }
        removed
    }

    /// Look up a profile's endpoint
    pub fn endpoint(&self, name: &str) -> Result<&PoolEndpoint, ConfigError> {
        self.profiles
            .get(name)
            .ok_or_else(|| ConfigError::ProfileNotFound(name.to_string()))
    }

    /// Resolve an explicit profile name, falling back to the default
    pub fn resolve<'a>(&'a self, explicit: Option<&'a str>) -> Result<&'a str, ConfigError> {
        explicit
            .or(self.default_profile.as_deref())
            .ok_or(ConfigError::NoProfile)
    }

    /// Sorted profile names
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.profiles.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

// ============================================================================
// I/O boundary functions
// ============================================================================

/// Expand `~` and environment variables in a user-supplied path
pub fn expand_path(raw: &str) -> PathBuf {
    match shellexpand::full(raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(raw),
    }
}

/// Load profiles from a specific path; a missing file is an empty config
pub fn load_profiles_from(path: &Path) -> Result<ProfilesConfig, ConfigError> {
    if !path.exists() {
        return Ok(ProfilesConfig::default());
    }
    let content = std::fs::read_to_string(path)?;
    parse_profiles(&content)
}

/// Save profiles to a specific path
pub fn save_profiles_to(config: &ProfilesConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serialize_profiles(config)?;
    std::fs::write(path, content)?;
    Ok(())
}
