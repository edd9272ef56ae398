//! Core types for transform execution

use std::collections::BTreeMap;
use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::catalog::ToolId;
use crate::sandbox::ExecutionLimits;

/// Message shown to end users for internal failures
pub const GENERIC_FAILURE_MESSAGE: &str = "something went wrong";

// ============================================================================
// Requests
// ============================================================================

/// Input handed to a transform
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum InputPayload {
    /// No input at all (generators)
    #[default]
    Empty,
    /// A single text value
    Text(String),
    /// Two related strings, e.g. the sides of a comparison
    DualText { left: String, right: String },
    /// Raw bytes
    Binary(Vec<u8>),
}

impl InputPayload {
    /// The single text value, if this payload carries one
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl From<&str> for InputPayload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for InputPayload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Vec<u8>> for InputPayload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(bytes)
    }
}

/// A single tool option value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl OptionValue {
    /// Parse a command-line style value (`true`, `42`, `1.5`, anything else is text)
    pub fn parse_loose(raw: &str) -> Self {
        if let Ok(b) = raw.parse::<bool>() {
            Self::Bool(b)
        } else if let Ok(i) = raw.parse::<i64>() {
            Self::Int(i)
        } else if let Ok(f) = raw.parse::<f64>() {
            Self::Float(f)
        } else {
            Self::Text(raw.to_string())
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for OptionValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Named options passed alongside the input
pub type Options = BTreeMap<String, OptionValue>;

/// What to execute: a trusted catalog tool or an untrusted script body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Target {
    Tool(ToolId),
    Code(String),
}

/// A single request to the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformRequest {
    pub target: Target,
    #[serde(default)]
    pub input: InputPayload,
    #[serde(default)]
    pub options: Options,
    /// Overrides the configured deadline when set
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

impl TransformRequest {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            input: InputPayload::Empty,
            options: Options::new(),
            deadline_ms: None,
        }
    }

    /// Request to run a catalog tool
    pub fn tool(id: ToolId) -> Self {
        Self::new(Target::Tool(id))
    }

    /// Request to run a script body
    pub fn code(code: impl Into<String>) -> Self {
        Self::new(Target::Code(code.into()))
    }

    /// Builder: set input
    pub fn with_input(mut self, input: impl Into<InputPayload>) -> Self {
        self.input = input.into();
        self
    }

    /// Builder: add an option
    pub fn with_option(mut self, name: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        self.options.insert(name.into(), value.into());
        self
    }

    /// Builder: set the deadline
    pub fn with_deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.deadline_ms = Some(deadline_ms);
        self
    }

    /// Effective limits for this request, given the configured defaults
    pub fn effective_limits(&self, defaults: &ExecutionLimits) -> ExecutionLimits {
        match self.deadline_ms {
            Some(ms) => defaults.clone().with_deadline_ms(ms),
            None => defaults.clone(),
        }
    }
}

// ============================================================================
// Results
// ============================================================================

/// Category of a failed execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// Bad data or an error raised by the transform itself
    UserInput,
    /// The execution exceeded its budget
    Timeout,
    /// The code was rejected before execution
    SandboxViolation,
    /// Engine plumbing failed
    Internal,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserInput => "user-input",
            Self::Timeout => "timeout",
            Self::SandboxViolation => "sandbox-violation",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Text suitable for showing to an end user
    pub fn user_message(&self) -> &str {
        match self.kind {
            FailureKind::Internal => GENERIC_FAILURE_MESSAGE,
            _ => &self.message,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Image preview
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePayload {
    /// URL or data URL
    pub src: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// A color expressed in several notations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorBreakdown {
    pub hex: String,
    pub rgb: [u8; 3],
    /// Hue in degrees, saturation and lightness in percent
    pub hsl: [f64; 3],
    /// CSS color used to render a swatch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffTag {
    Added,
    Removed,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffChange {
    pub tag: DiffTag,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffPayload {
    pub changes: Vec<DiffChange>,
}

/// A file offered for download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadPayload {
    pub filename: String,
    pub mime: String,
    #[serde(with = "bytes_field")]
    pub bytes: Vec<u8>,
}

/// Node of a tree rendered by the visualizer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default)]
    pub children: Vec<TreeNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisualTree {
    pub root: TreeNode,
}

/// Result kinds with a fixed payload shape, discriminated by `kind`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StructuredResult {
    Image(ImagePayload),
    ColorBreakdown(ColorBreakdown),
    Diff(DiffPayload),
    Download(DownloadPayload),
    VisualTree(VisualTree),
}

impl StructuredResult {
    /// Discriminant values recognized by the normalizer
    pub const KINDS: [&'static str; 5] = ["image", "color-breakdown", "diff", "download", "visual-tree"];

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Image(_) => "image",
            Self::ColorBreakdown(_) => "color-breakdown",
            Self::Diff(_) => "diff",
            Self::Download(_) => "download",
            Self::VisualTree(_) => "visual-tree",
        }
    }

    pub fn is_known_kind(kind: &str) -> bool {
        Self::KINDS.contains(&kind)
    }
}

/// Outcome of one execution; exactly one variant per execution
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    Text(String),
    Structured(StructuredResult),
    Failure(Failure),
}

impl ExecutionResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failure(Failure::new(kind, message))
    }

    pub fn user_input(message: impl Into<String>) -> Self {
        Self::failure(FailureKind::UserInput, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::failure(FailureKind::Internal, message)
    }

    pub fn timeout(deadline_ms: u64) -> Self {
        Self::failure(
            FailureKind::Timeout,
            format!("execution exceeded {}ms", deadline_ms),
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_failure(&self) -> Option<&Failure> {
        match self {
            Self::Failure(failure) => Some(failure),
            _ => None,
        }
    }

    /// Canonical raw form; `normalize` maps it back to an equal result
    pub fn to_raw(&self) -> Value {
        match self {
            Self::Text(text) => Value::String(text.clone()),
            Self::Structured(structured) => structured_raw(serde_json::to_value(structured)),
            Self::Failure(failure) => failure.to_raw(),
        }
    }
}

/// A structured payload that will not serialize becomes an internal failure
fn structured_raw(serialized: Result<Value, serde_json::Error>) -> Value {
    match serialized {
        Ok(raw) => raw,
        Err(e) => {
            tracing::error!(error = %e, "structured result failed to serialize");
            Failure::new(FailureKind::Internal, "unserializable result").to_raw()
        }
    }
}

impl Failure {
    /// `{ "error": message, "failure": kind }`, with `failure` omitted for user input
    fn to_raw(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("error".to_string(), Value::String(self.message.clone()));
        if self.kind != FailureKind::UserInput {
            map.insert(
                "failure".to_string(),
                Value::String(self.kind.as_str().to_string()),
            );
        }
        Value::Object(map)
    }
}

impl From<Failure> for ExecutionResult {
    fn from(failure: Failure) -> Self {
        Self::Failure(failure)
    }
}

impl From<StructuredResult> for ExecutionResult {
    fn from(structured: StructuredResult) -> Self {
        Self::Structured(structured)
    }
}

/// Download bytes travel as base64; a plain array of byte values is also accepted
mod bytes_field {
    use super::BASE64;
    use base64::Engine as _;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Encoded(String),
        Raw(Vec<u8>),
    }

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Encoded(encoded) => BASE64.decode(encoded.as_bytes()).map_err(D::Error::custom),
            Repr::Raw(bytes) => Ok(bytes),
        }
    }
}

/// Encode bytes the way download payloads carry them
pub fn encode_bytes(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

// ============================================================================
// Errors
// ============================================================================

/// Errors from engine plumbing; each maps onto exactly one `Failure`
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Script compilation failed: {0}")]
    CompilationError(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to start isolated context: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    #[error("Isolated context I/O failed: {0}")]
    WorkerIo(#[from] std::io::Error),

    #[error("Malformed isolated context message: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("Isolated context exited without a result ({0})")]
    WorkerCrashed(String),
}

impl From<EngineError> for Failure {
    fn from(error: EngineError) -> Self {
        let kind = match &error {
            EngineError::CompilationError(_) => FailureKind::SandboxViolation,
            EngineError::UnknownTool(_) => FailureKind::UserInput,
            _ => FailureKind::Internal,
        };
        Failure::new(kind, error.to_string())
    }
}

/// The execution was cancelled by its caller; never shown as an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("execution cancelled")]
pub struct Cancelled;
