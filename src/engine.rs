//! Rhai engine setup and the code execution harness

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rhai::{AST, Dynamic, Engine, EvalAltResult, Scope};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::capabilities::CapabilitySet;
use crate::normalize::normalize;
use crate::sandbox::ExecutionLimits;
use crate::types::{
    Cancelled, EngineError, ExecutionResult, FailureKind, InputPayload, OptionValue, Options,
};

/// Name the script sees its input under
pub const INPUT_BINDING: &str = "input";
/// Name the script sees its options under
pub const OPTIONS_BINDING: &str = "opts";

/// Flag that asks a running evaluation to stop at its next operation
pub type StopFlag = Arc<AtomicBool>;

// ============================================================================
// Harness
// ============================================================================

/// Compiles and runs script bodies against the capability set
///
/// Every execution gets a new engine and scope, so nothing a script does can
/// leak into a later one.
#[derive(Debug, Clone, Default)]
pub struct Harness {
    capabilities: CapabilitySet,
}

impl Harness {
    /// Create a harness granting the standard capability set
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a harness granting only `capabilities`
    pub fn with_capabilities(capabilities: CapabilitySet) -> Self {
        Self { capabilities }
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    /// Build a fresh engine for one execution
    fn build_engine(&self, limits: &ExecutionLimits, stop: StopFlag) -> Engine {
        let mut engine = Engine::new_raw();
        self.capabilities.install(&mut engine);

        // Apply limits
        engine.set_max_operations(limits.max_operations);
        engine.set_max_string_size(limits.max_string_size);
        engine.set_max_array_size(limits.max_array_size);
        engine.set_max_map_size(limits.max_map_size);
        engine.set_max_call_levels(limits.max_call_levels);
        engine.set_max_expr_depths(limits.max_expr_depth, limits.max_expr_depth);

        engine.disable_symbol("eval");

        engine.on_print(|text| debug!(target: "transform_engine::script", "{}", text));
        engine.on_debug(|text, source, pos| {
            debug!(target: "transform_engine::script", source = ?source, position = %pos, "{}", text)
        });

        engine.on_progress(move |_| {
            if stop.load(Ordering::Relaxed) {
                Some(Dynamic::UNIT)
            } else {
                None
            }
        });

        // Names outside the scope read as unit instead of raising
        #[allow(deprecated)]
        engine.on_var(|name, _index, context| {
            if context.scope().contains(name) {
                Ok(None)
            } else {
                Ok(Some(Dynamic::UNIT))
            }
        });

        engine
    }

    /// Compile without running; used to reject scripts up front
    pub fn compile(&self, code: &str, limits: &ExecutionLimits) -> Result<AST, EngineError> {
        let engine = self.build_engine(limits, Arc::new(AtomicBool::new(false)));
        engine
            .compile(code)
            .map_err(|e| EngineError::CompilationError(e.to_string()))
    }

    /// Run a script to completion on the current thread
    ///
    /// Only the operation budget bounds the run; there is no deadline.
    pub fn evaluate(
        &self,
        code: &str,
        input: &InputPayload,
        options: &Options,
        limits: &ExecutionLimits,
    ) -> ExecutionResult {
        self.evaluate_with_stop(code, input, options, limits, Arc::new(AtomicBool::new(false)))
    }

    /// Like [`Harness::evaluate`], but stops early once `stop` is raised
    pub fn evaluate_with_stop(
        &self,
        code: &str,
        input: &InputPayload,
        options: &Options,
        limits: &ExecutionLimits,
        stop: StopFlag,
    ) -> ExecutionResult {
        let engine = self.build_engine(limits, stop);

        let ast = match engine.compile(code) {
            Ok(ast) => ast,
            Err(e) => return ExecutionResult::failure(FailureKind::SandboxViolation, e.to_string()),
        };

        let mut scope = self.bind(input, options);
        match engine.eval_ast_with_scope::<Dynamic>(&mut scope, &ast) {
            Ok(value) => match dynamic_to_json(&value) {
                Ok(raw) => normalize(&raw),
                Err(e) => {
                    debug!(error = %e, "script returned a value with no JSON form");
                    ExecutionResult::internal("unserializable result")
                }
            },
            Err(e) => classify_error(*e, limits),
        }
    }

    /// Run a script under the deadline in `limits`
    ///
    /// The deadline is advisory: on expiry the caller gets a timeout
    /// immediately and the evaluation stops at its next operation.
    pub async fn run(
        &self,
        code: &str,
        input: &InputPayload,
        options: &Options,
        limits: &ExecutionLimits,
    ) -> ExecutionResult {
        // Nothing can cancel a fresh token
        match self
            .run_until_cancelled(code, input, options, limits, &CancellationToken::new())
            .await
        {
            Ok(result) => result,
            Err(Cancelled) => ExecutionResult::internal("uncancellable run was cancelled"),
        }
    }

    /// Run a script under the deadline in `limits`, abandoning it on `cancel`
    pub async fn run_until_cancelled(
        &self,
        code: &str,
        input: &InputPayload,
        options: &Options,
        limits: &ExecutionLimits,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, Cancelled> {
        let harness = self.clone();
        let code = code.to_string();
        let input = input.clone();
        let options = options.clone();
        let task_limits = limits.clone();
        deadline_race(
            move |stop| harness.evaluate_with_stop(&code, &input, &options, &task_limits, stop),
            limits.deadline_ms,
            cancel,
        )
        .await
    }

    /// Fresh scope: capability constants plus `input` and `opts`
    fn bind(&self, input: &InputPayload, options: &Options) -> Scope<'static> {
        let mut scope = self.capabilities.scope();
        scope.push_dynamic(INPUT_BINDING, input_to_dynamic(input));
        scope.push_dynamic(OPTIONS_BINDING, options_to_dynamic(options));
        scope
    }
}

/// Run `job` on a blocking thread, racing it against the deadline and `cancel`
///
/// Whichever settles first wins. A losing job keeps its thread until it
/// returns or notices the stop flag; its result is dropped.
pub(crate) async fn deadline_race<F>(
    job: F,
    deadline_ms: u64,
    cancel: &CancellationToken,
) -> Result<ExecutionResult, Cancelled>
where
    F: FnOnce(StopFlag) -> ExecutionResult + Send + 'static,
{
    if cancel.is_cancelled() {
        return Err(Cancelled);
    }

    let stop: StopFlag = Arc::new(AtomicBool::new(false));
    let task_stop = Arc::clone(&stop);
    let task = tokio::task::spawn_blocking(move || job(task_stop));

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            stop.store(true, Ordering::Relaxed);
            Err(Cancelled)
        }
        _ = tokio::time::sleep(Duration::from_millis(deadline_ms)) => {
            stop.store(true, Ordering::Relaxed);
            warn!(deadline_ms, "in-process execution exceeded its deadline");
            Ok(ExecutionResult::timeout(deadline_ms))
        }
        joined = task => match joined {
            Ok(result) => Ok(result),
            Err(e) => {
                error!(error = %e, "in-process execution panicked");
                Ok(ExecutionResult::internal("transform panicked"))
            }
        },
    }
}

/// Map an evaluation error onto the failure taxonomy
fn classify_error(error: EvalAltResult, limits: &ExecutionLimits) -> ExecutionResult {
    match error {
        EvalAltResult::ErrorRuntime(value, _) => ExecutionResult::user_input(thrown_message(&value)),
        EvalAltResult::ErrorTooManyOperations(_) => ExecutionResult::failure(
            FailureKind::Timeout,
            format!(
                "execution exceeded its operation budget ({})",
                limits.max_operations
            ),
        ),
        EvalAltResult::ErrorTerminated(_, _) => ExecutionResult::timeout(limits.deadline_ms),
        EvalAltResult::ErrorParsing(kind, pos) => ExecutionResult::failure(
            FailureKind::SandboxViolation,
            format!("{} ({})", kind, pos),
        ),
        // Errors raised inside script functions and closures arrive wrapped
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => classify_error(*inner, limits),
        EvalAltResult::ErrorFunctionNotFound(signature, pos) if is_disabled_call(&signature) => {
            ExecutionResult::failure(
                FailureKind::SandboxViolation,
                format!("'{}' is not available ({})", signature, pos),
            )
        }
        other => ExecutionResult::user_input(other.to_string()),
    }
}

fn is_disabled_call(signature: &str) -> bool {
    signature == "eval" || signature.starts_with("eval ") || signature.starts_with("eval(")
}

/// Message of a thrown value: strings verbatim, maps by their `message` field
fn thrown_message(value: &Dynamic) -> String {
    let value = value.flatten_clone();
    if value.is_string() {
        return value.into_string().unwrap_or_default();
    }
    if let Some(map) = value.clone().try_cast::<rhai::Map>() {
        if let Some(message) = map.get("message") {
            return message.to_string();
        }
    }
    if value.is_unit() {
        return "execution failed".to_string();
    }
    value.to_string()
}

// ============================================================================
// Conversions
// ============================================================================

/// A script value with no JSON representation (function pointers, custom types)
#[derive(Debug, Error)]
#[error("value of type '{0}' cannot be serialized")]
pub struct UnserializableValue(pub String);

/// Convert Rhai Dynamic to serde_json::Value
pub fn dynamic_to_json(value: &Dynamic) -> Result<serde_json::Value, UnserializableValue> {
    let value = value.flatten_clone();
    let json = if value.is_unit() {
        serde_json::Value::Null
    } else if value.is_string() {
        serde_json::Value::String(value.into_string().unwrap_or_default())
    } else if value.is_char() {
        serde_json::Value::String(value.as_char().unwrap_or_default().to_string())
    } else if value.is_int() {
        serde_json::Value::Number(serde_json::Number::from(value.as_int().unwrap_or(0)))
    } else if value.is_float() {
        let f = value.as_float().unwrap_or(0.0);
        match serde_json::Number::from_f64(f) {
            Some(n) => serde_json::Value::Number(n),
            None => serde_json::Value::String(f.to_string()),
        }
    } else if value.is_bool() {
        serde_json::Value::Bool(value.as_bool().unwrap_or(false))
    } else if value.is_blob() {
        let bytes = value.into_blob().unwrap_or_default();
        serde_json::Value::Array(bytes.into_iter().map(serde_json::Value::from).collect())
    } else if value.is_array() {
        let arr: Vec<Dynamic> = value.into_array().unwrap_or_default();
        serde_json::Value::Array(arr.iter().map(dynamic_to_json).collect::<Result<_, _>>()?)
    } else if value.is_map() {
        let map: rhai::Map = value.cast();
        let mut json_map = serde_json::Map::new();
        for (k, v) in map.iter() {
            json_map.insert(k.to_string(), dynamic_to_json(v)?);
        }
        serde_json::Value::Object(json_map)
    } else {
        return Err(UnserializableValue(value.type_name().to_string()));
    };
    Ok(json)
}

/// The value a script sees as `input`
pub fn input_to_dynamic(input: &InputPayload) -> Dynamic {
    match input {
        InputPayload::Empty => Dynamic::UNIT,
        InputPayload::Text(text) => Dynamic::from(text.clone()),
        InputPayload::DualText { left, right } => {
            let mut map = rhai::Map::new();
            map.insert("left".into(), Dynamic::from(left.clone()));
            map.insert("right".into(), Dynamic::from(right.clone()));
            Dynamic::from_map(map)
        }
        InputPayload::Binary(bytes) => Dynamic::from_blob(bytes.clone()),
    }
}

/// The map a script sees as `opts`
pub fn options_to_dynamic(options: &Options) -> Dynamic {
    let map: rhai::Map = options
        .iter()
        .map(|(name, value)| {
            let value = match value {
                OptionValue::Bool(b) => Dynamic::from(*b),
                OptionValue::Int(i) => Dynamic::from(*i),
                OptionValue::Float(f) => Dynamic::from(*f),
                OptionValue::Text(s) => Dynamic::from(s.clone()),
            };
            (name.as_str().into(), value)
        })
        .collect();
    Dynamic::from_map(map)
}

// ============================================================================
// Tests
// ============================================================================
