//! Compute functions shipped with the `offload` binary

use serde_json::{json, Value};

use super::{ComputeError, ComputeRegistry, ExecutionContext};

const ORIGIN: &str = module_path!();

pub fn register_all(registry: &mut ComputeRegistry) {
    registry.register("double", ORIGIN, double);
    registry.register("sum", ORIGIN, sum);
    registry.register("concat", ORIGIN, concat);
    registry.register("fail", ORIGIN, fail);
}

fn as_number(port: &str, value: &Value) -> Result<f64, ComputeError> {
    value.as_f64().ok_or_else(|| {
        ComputeError::raised("TypeError", format!("port {} expects a number, got {}", port, value))
    })
}

/// y = 2 * x
pub fn double(ctx: &mut ExecutionContext) -> Result<(), ComputeError> {
    let x = as_number("x", ctx.get("x", true)?)?;
    ctx.set_output("y", json!(x * 2.0));
    Ok(())
}

/// total = sum of every value on `values`
pub fn sum(ctx: &mut ExecutionContext) -> Result<(), ComputeError> {
    let total = ctx
        .get_optional_list("values")
        .iter()
        .map(|v| as_number("values", v))
        .sum::<Result<f64, _>>()?;
    ctx.set_output("total", json!(total));
    Ok(())
}

/// joined = left + separator + right
pub fn concat(ctx: &mut ExecutionContext) -> Result<(), ComputeError> {
    ctx.require("left")?;
    ctx.require("right")?;
    let separator = ctx.force_get("separator", json!(""));
    let joined = format!(
        "{}{}{}",
        text(ctx.get("left", false)?),
        text(&separator),
        text(ctx.get("right", false)?)
    );
    ctx.set_output("joined", Value::String(joined));
    Ok(())
}

/// Always raises, with the message taken from `message` when present
pub fn fail(ctx: &mut ExecutionContext) -> Result<(), ComputeError> {
    let message = ctx.force_get("message", json!("requested failure"));
    Err(ComputeError::raised("RuntimeError", text(&message)))
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
