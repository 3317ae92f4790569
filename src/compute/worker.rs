//! Worker-side execution of compute requests
//!
//! Whatever the compute code does, the worker answers with a `ComputeResult`:
//! errors and panics become `Failure` data, never an error crossing the
//! process boundary. Machine information is attached to every result.

use std::backtrace::Backtrace;
use std::panic::{self, AssertUnwindSafe};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{CodeRef, ComputeError, ComputeRegistry, ExecutionContext, InputSnapshot, Outputs};
use crate::provenance::MachineInfo;

/// Self-contained unit of work shipped to a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeRequest {
    /// Identifier for correlating worker logs with the dispatching side
    pub request_id: Uuid,
    pub code: CodeRef,
    pub inputs: InputSnapshot,
}

impl ComputeRequest {
    pub fn new(code: CodeRef, inputs: InputSnapshot) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            code,
            inputs,
        }
    }
}

/// Outcome of running compute code on a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ComputeOutcome {
    Success {
        outputs: Outputs,
    },
    Failure {
        #[serde(rename = "errorKind")]
        error_kind: String,
        #[serde(rename = "errorArgs")]
        error_args: Vec<String>,
        #[serde(rename = "stackTrace")]
        stack_trace: String,
    },
}

impl ComputeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// "<kind>: <first arg>" for failures
    pub fn error_message(&self) -> Option<String> {
        match self {
            Self::Success { .. } => None,
            Self::Failure {
                error_kind,
                error_args,
                ..
            } => Some(format!(
                "{}: {}",
                error_kind,
                error_args.first().map(String::as_str).unwrap_or("")
            )),
        }
    }
}

/// Result of a request together with the machine that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeResult {
    pub outcome: ComputeOutcome,
    pub machine: MachineInfo,
}

/// Run a request against a registry on this machine
pub fn execute_request(registry: &ComputeRegistry, request: ComputeRequest) -> ComputeResult {
    let machine = MachineInfo::current();
    let ComputeRequest {
        request_id,
        code,
        inputs,
    } = request;

    let Some(compute) = registry.get(&code.name) else {
        warn!("Request {} names unknown compute code '{}'", request_id, code.name);
        return ComputeResult {
            outcome: failure(
                "UnknownComputeError",
                vec![format!("no compute code registered as '{}'", code.name)],
                String::new(),
            ),
            machine,
        };
    };

    debug!(
        "Executing '{}' (origin {}) for request {} with {} input ports",
        code.name,
        code.origin,
        request_id,
        inputs.len()
    );

    let mut ctx = ExecutionContext::build_from(inputs);
    let run = panic::catch_unwind(AssertUnwindSafe(|| compute.call(&mut ctx)));

    let outcome = match run {
        Ok(Ok(())) => ComputeOutcome::Success {
            outputs: ctx.into_outputs(),
        },
        Ok(Err(err)) => raised(&code.name, &err),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            failure(
                "Panic",
                vec![message.clone()],
                format!(
                    "compute '{}' panicked: {}\n{}",
                    code.name,
                    message,
                    Backtrace::force_capture()
                ),
            )
        }
    };

    ComputeResult { outcome, machine }
}

fn raised(name: &str, err: &ComputeError) -> ComputeOutcome {
    failure(
        err.kind(),
        err.args(),
        format!(
            "compute '{}' raised {}\n{}",
            name,
            err,
            Backtrace::force_capture()
        ),
    )
}

fn failure(kind: &str, args: Vec<String>, stack_trace: String) -> ComputeOutcome {
    ComputeOutcome::Failure {
        error_kind: kind.to_string(),
        error_args: args,
        stack_trace,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> ComputeRegistry {
        let mut registry = ComputeRegistry::with_builtins();
        registry.register("needs_missing", "tests", |ctx| ctx.require("missing"));
        registry.register("panics", "tests", |_| panic!("worker exploded"));
        registry
    }

    fn request(name: &str, inputs: InputSnapshot) -> ComputeRequest {
        let code = registry().get(name).map(|c| c.code_ref()).unwrap_or(CodeRef {
            name: name.to_string(),
            origin: "tests".to_string(),
        });
        ComputeRequest::new(code, inputs)
    }

    #[test]
    fn test_double_scenario() {
        let result = execute_request(
            &registry(),
            request("double", InputSnapshot::new().with_value("x", json!(2.0))),
        );

        let mut expected = Outputs::new();
        expected.insert("y".to_string(), json!(4.0));
        assert_eq!(result.outcome, ComputeOutcome::Success { outputs: expected });
    }

    #[test]
    fn test_mandatory_port_failure() {
        let result = execute_request(&registry(), request("needs_missing", InputSnapshot::new()));

        match &result.outcome {
            ComputeOutcome::Failure {
                error_kind,
                error_args,
                stack_trace,
            } => {
                assert_eq!(error_kind, "MandatoryPortError");
                assert_eq!(error_args[0], "'missing' is a mandatory port");
                assert!(stack_trace.contains("needs_missing"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(
            result.outcome.error_message().unwrap(),
            "MandatoryPortError: 'missing' is a mandatory port"
        );
    }

    #[test]
    fn test_panic_becomes_failure() {
        let result = execute_request(&registry(), request("panics", InputSnapshot::new()));
        match result.outcome {
            ComputeOutcome::Failure {
                error_kind,
                error_args,
                ..
            } => {
                assert_eq!(error_kind, "Panic");
                assert_eq!(error_args, vec!["worker exploded".to_string()]);
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_code() {
        let result = execute_request(&registry(), request("nonexistent", InputSnapshot::new()));
        assert_eq!(
            result.outcome.error_message().unwrap(),
            "UnknownComputeError: no compute code registered as 'nonexistent'"
        );
    }

    #[test]
    fn test_machine_attached_to_failures() {
        let result = execute_request(&registry(), request("fail", InputSnapshot::new()));
        assert!(!result.outcome.is_success());
        assert!(!result.machine.os.is_empty());
        assert!(result.machine.architecture == 32 || result.machine.architecture == 64);
    }

    #[test]
    fn test_result_wire_format() {
        let result = execute_request(&registry(), request("fail", InputSnapshot::new()));
        let encoded = serde_json::to_value(&result).unwrap();
        assert_eq!(encoded["outcome"]["status"], json!("failure"));
        assert_eq!(encoded["outcome"]["errorKind"], json!("RuntimeError"));
        assert!(encoded["machine"]["ram"].is_u64());
    }
}
