//! Compute code and the registry workers resolve it from
//!
//! Compute code cannot cross a process boundary as machine code, so every
//! function is registered under a name on both sides. Requests carry a
//! `CodeRef` and the worker looks the name up in its own `ComputeRegistry`.

pub mod builtins;
pub mod context;
pub mod worker;

pub use context::{ExecutionContext, InputSnapshot, Outputs, PortValue};
pub use worker::{execute_request, ComputeOutcome, ComputeRequest, ComputeResult};

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Origin assigned to code while it is being shipped to a worker
pub const PORTABLE_ORIGIN: &str = "__remote__";

/// Errors raised by compute code while it runs
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ComputeError {
    #[error("Missing value from port {0}")]
    MissingPort(String),

    #[error("'{0}' is a mandatory port")]
    MandatoryPort(String),

    #[error("{kind}: {}", .args.first().map(String::as_str).unwrap_or(""))]
    Raised { kind: String, args: Vec<String> },
}

impl ComputeError {
    /// Raise an error of an arbitrary kind
    pub fn raised(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Raised {
            kind: kind.into(),
            args: vec![message.into()],
        }
    }

    /// Error kind as reported across the worker boundary
    pub fn kind(&self) -> &str {
        match self {
            Self::MissingPort(_) => "MissingPortError",
            Self::MandatoryPort(_) => "MandatoryPortError",
            Self::Raised { kind, .. } => kind,
        }
    }

    /// Error arguments as reported across the worker boundary
    pub fn args(&self) -> Vec<String> {
        match self {
            Self::MissingPort(_) | Self::MandatoryPort(_) => vec![self.to_string()],
            Self::Raised { args, .. } => args.clone(),
        }
    }
}

/// Signature every compute function has
pub type ComputeFn = fn(&mut ExecutionContext) -> Result<(), ComputeError>;

/// Serializable reference to registered compute code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeRef {
    pub name: String,
    pub origin: String,
}

/// A registered compute function and its declared identity
pub struct ComputeCode {
    name: String,
    origin: String,
    /// Number of live `IdentityScope`s
    portable: AtomicUsize,
    func: ComputeFn,
}

impl std::fmt::Debug for ComputeCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeCode")
            .field("name", &self.name)
            .field("origin", &self.origin())
            .finish()
    }
}

impl ComputeCode {
    pub fn new(name: impl Into<String>, origin: impl Into<String>, func: ComputeFn) -> Self {
        Self {
            name: name.into(),
            origin: origin.into(),
            portable: AtomicUsize::new(0),
            func,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current origin: the portable one while any `IdentityScope` is alive
    pub fn origin(&self) -> String {
        if self.portable.load(Ordering::SeqCst) > 0 {
            PORTABLE_ORIGIN.to_string()
        } else {
            self.origin.clone()
        }
    }

    /// Reference to this code under its current identity
    pub fn code_ref(&self) -> CodeRef {
        CodeRef {
            name: self.name.clone(),
            origin: self.origin(),
        }
    }

    /// Run the function against a context
    pub fn call(&self, ctx: &mut ExecutionContext) -> Result<(), ComputeError> {
        (self.func)(ctx)
    }

    /// Swap in the portable origin until the returned scope is dropped.
    /// Scopes may overlap; the declared origin returns when the last one drops.
    pub fn portable_scope(&self) -> IdentityScope<'_> {
        self.portable.fetch_add(1, Ordering::SeqCst);
        IdentityScope { code: self }
    }
}

/// Restores a `ComputeCode`'s declared origin on every exit path
#[must_use = "the portable identity is reverted as soon as the scope drops"]
pub struct IdentityScope<'a> {
    code: &'a ComputeCode,
}

impl IdentityScope<'_> {
    /// Reference to the code under its portable identity
    pub fn code_ref(&self) -> CodeRef {
        self.code.code_ref()
    }
}

impl Drop for IdentityScope<'_> {
    fn drop(&mut self) {
        self.code.portable.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Name-indexed set of compute functions
#[derive(Debug, Clone, Default)]
pub struct ComputeRegistry {
    codes: HashMap<String, Arc<ComputeCode>>,
}

impl ComputeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the functions shipped with this crate
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtins::register_all(&mut registry);
        registry
    }

    /// Register a function, returning the shared handle to it
    pub fn register(
        &mut self,
        name: impl Into<String>,
        origin: impl Into<String>,
        func: ComputeFn,
    ) -> Arc<ComputeCode> {
        let code = Arc::new(ComputeCode::new(name, origin, func));
        self.codes.insert(code.name().to_string(), code.clone());
        code
    }

    pub fn get(&self, name: &str) -> Option<Arc<ComputeCode>> {
        self.codes.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.codes.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}
