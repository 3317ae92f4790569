//! Input snapshots and the execution context compute code runs against
//!
//! An `ExecutionContext` is a plain value built from an `InputSnapshot`. It
//! carries no reference to the pipeline that produced the snapshot, so it can
//! be rebuilt on any worker from the request alone.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ComputeError;

/// Values captured for a single input port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortValue {
    /// Every value connected to the port, in connection order
    pub values: Vec<Value>,

    /// True when the value came from the port's declared default
    #[serde(rename = "isDefault")]
    pub is_default: bool,
}

impl PortValue {
    pub fn new(value: Value, is_default: bool) -> Self {
        Self {
            values: vec![value],
            is_default,
        }
    }

    pub fn list(values: Vec<Value>) -> Self {
        Self {
            values,
            is_default: false,
        }
    }

    fn first(&self) -> Option<&Value> {
        self.values.first()
    }
}

/// Immutable capture of a module's input ports at dispatch time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputSnapshot {
    ports: IndexMap<String, PortValue>,
}

impl InputSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an explicitly connected value
    pub fn with_value(mut self, port: impl Into<String>, value: Value) -> Self {
        self.ports.insert(port.into(), PortValue::new(value, false));
        self
    }

    /// Add a value that came from the port's default
    pub fn with_default(mut self, port: impl Into<String>, value: Value) -> Self {
        self.ports.insert(port.into(), PortValue::new(value, true));
        self
    }

    /// Add a multi-valued port
    pub fn with_list(mut self, port: impl Into<String>, values: Vec<Value>) -> Self {
        self.ports.insert(port.into(), PortValue::list(values));
        self
    }

    pub fn insert(&mut self, port: impl Into<String>, value: PortValue) {
        self.ports.insert(port.into(), value);
    }

    pub fn port(&self, name: &str) -> Option<&PortValue> {
        self.ports.get(name)
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PortValue)> {
        self.ports.iter()
    }
}

impl FromIterator<(String, PortValue)> for InputSnapshot {
    fn from_iter<T: IntoIterator<Item = (String, PortValue)>>(iter: T) -> Self {
        Self {
            ports: iter.into_iter().collect(),
        }
    }
}

/// Output port values written by compute code
pub type Outputs = IndexMap<String, Value>;

/// Read-only view of the inputs plus an output sink
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    inputs: InputSnapshot,
    outputs: Outputs,
}

impl ExecutionContext {
    /// Build a fresh context for one request
    pub fn build_from(inputs: InputSnapshot) -> Self {
        Self {
            inputs,
            outputs: Outputs::new(),
        }
    }

    /// Value on `port`; defaults are only accepted when `allow_default` is set
    pub fn get(&self, port: &str, allow_default: bool) -> Result<&Value, ComputeError> {
        self.inputs
            .port(port)
            .filter(|p| allow_default || !p.is_default)
            .and_then(PortValue::first)
            .ok_or_else(|| ComputeError::MissingPort(port.to_string()))
    }

    /// True only for explicitly connected values
    pub fn has(&self, port: &str) -> bool {
        self.inputs
            .port(port)
            .map(|p| !p.is_default)
            .unwrap_or(false)
    }

    pub fn require(&self, port: &str) -> Result<(), ComputeError> {
        if self.has(port) {
            Ok(())
        } else {
            Err(ComputeError::MandatoryPort(port.to_string()))
        }
    }

    /// Explicit value on `port`, or `default` when absent or defaulted
    pub fn force_get(&self, port: &str, default: Value) -> Value {
        self.explicit(port)
            .and_then(PortValue::first)
            .cloned()
            .unwrap_or(default)
    }

    /// All values on a multi-valued port
    pub fn get_list(&self, port: &str) -> Result<&[Value], ComputeError> {
        self.explicit(port)
            .map(|p| p.values.as_slice())
            .ok_or_else(|| ComputeError::MissingPort(port.to_string()))
    }

    /// All values on a multi-valued port, empty when absent
    pub fn get_optional_list(&self, port: &str) -> &[Value] {
        self.explicit(port)
            .map(|p| p.values.as_slice())
            .unwrap_or(&[])
    }

    /// Record an output; the last write per port wins
    pub fn set_output(&mut self, port: impl Into<String>, value: Value) {
        self.outputs.insert(port.into(), value);
    }

    pub fn outputs(&self) -> &Outputs {
        &self.outputs
    }

    pub fn into_outputs(self) -> Outputs {
        self.outputs
    }

    fn explicit(&self, port: &str) -> Option<&PortValue> {
        self.inputs.port(port).filter(|p| !p.is_default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> ExecutionContext {
        ExecutionContext::build_from(
            InputSnapshot::new()
                .with_value("x", json!(2.0))
                .with_default("scale", json!(10))
                .with_list("values", vec![json!(1), json!(2), json!(3)]),
        )
    }

    #[test]
    fn test_get_explicit_value() {
        let ctx = context();
        assert_eq!(ctx.get("x", true).unwrap(), &json!(2.0));
        assert_eq!(ctx.get("x", false).unwrap(), &json!(2.0));
    }

    #[test]
    fn test_get_default_value() {
        let ctx = context();
        assert_eq!(ctx.get("scale", true).unwrap(), &json!(10));
        assert!(matches!(
            ctx.get("scale", false),
            Err(ComputeError::MissingPort(p)) if p == "scale"
        ));
    }

    #[test]
    fn test_get_missing_port() {
        let ctx = context();
        assert!(matches!(ctx.get("nope", true), Err(ComputeError::MissingPort(_))));
    }

    #[test]
    fn test_has_ignores_defaults() {
        let ctx = context();
        assert!(ctx.has("x"));
        assert!(!ctx.has("scale"));
        assert!(!ctx.has("nope"));
    }

    #[test]
    fn test_require() {
        let ctx = context();
        assert!(ctx.require("x").is_ok());
        assert!(matches!(
            ctx.require("scale"),
            Err(ComputeError::MandatoryPort(p)) if p == "scale"
        ));
    }

    #[test]
    fn test_force_get() {
        let ctx = context();
        assert_eq!(ctx.force_get("x", json!(0)), json!(2.0));
        assert_eq!(ctx.force_get("scale", json!(0)), json!(0));
        assert_eq!(ctx.force_get("nope", json!("d")), json!("d"));
    }

    #[test]
    fn test_lists() {
        let ctx = context();
        assert_eq!(ctx.get_list("values").unwrap().len(), 3);
        assert!(matches!(ctx.get_list("nope"), Err(ComputeError::MissingPort(_))));
        assert!(ctx.get_optional_list("nope").is_empty());
        assert!(ctx.get_optional_list("scale").is_empty());
        assert_eq!(ctx.get_optional_list("values"), &[json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn test_set_output_last_write_wins() {
        let mut ctx = context();
        ctx.set_output("y", json!(1));
        ctx.set_output("z", json!(2));
        ctx.set_output("y", json!(3));

        let outputs = ctx.into_outputs();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs["y"], json!(3));
    }

    #[test]
    fn test_contexts_are_independent() {
        let snapshot = InputSnapshot::new().with_value("x", json!(1));
        let mut a = ExecutionContext::build_from(snapshot.clone());
        let b = ExecutionContext::build_from(snapshot);

        a.set_output("y", json!(1));
        assert!(b.outputs().is_empty());
    }

    #[test]
    fn test_snapshot_wire_format() {
        let snapshot = InputSnapshot::new().with_default("k", json!("v"));
        let encoded = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(encoded, json!({"k": {"values": ["v"], "isDefault": true}}));
    }
}
