//! Maps raw transform output onto the closed result taxonomy

use serde_json::Value;
use tracing::debug;

use crate::types::{ExecutionResult, FailureKind, StructuredResult};

/// Normalize a raw transform value. Total: never panics, never errors.
///
/// - `null` is empty text, strings are text
/// - objects whose `kind` names a structured result are shape-checked
/// - objects with a string `error` are failures (`failure` picks the kind)
/// - other objects and arrays become pretty-printed JSON text
/// - numbers and booleans are stringified
pub fn normalize(raw: &Value) -> ExecutionResult {
    match raw {
        Value::Null => ExecutionResult::Text(String::new()),
        Value::String(text) => ExecutionResult::Text(text.clone()),
        Value::Bool(b) => ExecutionResult::Text(b.to_string()),
        Value::Number(n) => ExecutionResult::Text(number_to_text(n)),
        Value::Object(map) => {
            if let Some(Value::String(kind)) = map.get("kind") {
                if StructuredResult::is_known_kind(kind) {
                    return match serde_json::from_value::<StructuredResult>(raw.clone()) {
                        Ok(structured) => ExecutionResult::Structured(structured),
                        Err(e) => {
                            debug!(kind = %kind, error = %e, "structured result failed shape check");
                            ExecutionResult::internal("invalid transform result")
                        }
                    };
                }
            }
            if let Some(Value::String(message)) = map.get("error") {
                let kind = map
                    .get("failure")
                    .and_then(|v| serde_json::from_value::<FailureKind>(v.clone()).ok())
                    .unwrap_or(FailureKind::UserInput);
                return ExecutionResult::failure(kind, message.clone());
            }
            to_json_text(raw)
        }
        Value::Array(_) => to_json_text(raw),
    }
}

fn to_json_text(raw: &Value) -> ExecutionResult {
    match serde_json::to_string_pretty(raw) {
        Ok(text) => ExecutionResult::Text(text),
        Err(_) => ExecutionResult::internal("unserializable result"),
    }
}

/// Integral floats print without a fraction, like script numbers do
fn number_to_text(n: &serde_json::Number) -> String {
    match n.as_f64() {
        Some(f) if !n.is_i64() && !n.is_u64() && f.fract() == 0.0 && f.abs() < 1e15 => {
            format!("{}", f as i64)
        }
        _ => n.to_string(),
    }
}
