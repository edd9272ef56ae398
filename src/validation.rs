//! Smoke-testing a freshly authored script before it is offered as a tool
//!
//! Runs in-process through the harness, never through a worker: a weaker
//! boundary is acceptable for a one-off check on a sample input.

use std::time::Instant;

use serde::Serialize;

use crate::engine::Harness;
use crate::sandbox::ExecutionLimits;
use crate::types::{ExecutionResult, FailureKind, InputPayload, Options};

/// Result of a validation run
#[derive(Debug, Clone, PartialEq)]
pub struct TestOutcome {
    pub success: bool,
    pub result: Option<ExecutionResult>,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub elapsed_ms: u64,
}

impl TestOutcome {
    fn classify(result: ExecutionResult, elapsed_ms: u64) -> Self {
        match result {
            ExecutionResult::Failure(failure) => Self {
                success: false,
                result: None,
                error: Some(failure.message),
                failure_kind: Some(failure.kind),
                elapsed_ms,
            },
            other => Self {
                success: true,
                result: Some(other),
                error: None,
                failure_kind: None,
                elapsed_ms,
            },
        }
    }

    /// Summary suitable for an authoring UI
    pub fn summary(&self) -> TestSummary {
        TestSummary {
            success: self.success,
            output: self.result.as_ref().map(|r| match r {
                ExecutionResult::Text(text) => text.clone(),
                other => other.to_raw().to_string(),
            }),
            error: self.error.clone(),
            elapsed_ms: self.elapsed_ms,
        }
    }
}

/// Serializable view of a [`TestOutcome`]
#[derive(Debug, Clone, Serialize)]
pub struct TestSummary {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

/// Compile and run `code` once against a sample, with quick limits
pub async fn test(code: &str, sample_input: &InputPayload, sample_options: &Options) -> TestOutcome {
    test_with(
        &Harness::new(),
        code,
        sample_input,
        sample_options,
        &ExecutionLimits::quick(),
    )
    .await
}

/// Like [`test`], with an explicit harness and limits
pub async fn test_with(
    harness: &Harness,
    code: &str,
    sample_input: &InputPayload,
    sample_options: &Options,
    limits: &ExecutionLimits,
) -> TestOutcome {
    let started = Instant::now();

    // Reject before running anything
    if let Err(e) = harness.compile(code, limits) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        return TestOutcome::classify(
            ExecutionResult::failure(FailureKind::SandboxViolation, e.to_string()),
            elapsed_ms,
        );
    }

    let result = harness.run(code, sample_input, sample_options, limits).await;
    TestOutcome::classify(result, started.elapsed().as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_passing_script() {
        let outcome = test("input.to_upper()", &"abc".into(), &Options::new()).await;
        assert!(outcome.success);
        assert_eq!(outcome.result, Some(ExecutionResult::text("ABC")));
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_syntax_error_is_sandbox_violation() {
        let outcome = test("let = ;", &InputPayload::Empty, &Options::new()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.failure_kind, Some(FailureKind::SandboxViolation));
        assert!(outcome.error.unwrap().starts_with("Script compilation failed"));
    }

    #[tokio::test]
    async fn test_thrown_error_is_reported() {
        let outcome = test(r#"throw "bad";"#, &InputPayload::Empty, &Options::new()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("bad"));
        assert_eq!(outcome.failure_kind, Some(FailureKind::UserInput));
    }

    #[tokio::test]
    async fn test_runaway_loop_fails_fast() {
        let outcome = test("loop {}", &InputPayload::Empty, &Options::new()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.failure_kind, Some(FailureKind::Timeout));
        assert!(outcome.elapsed_ms < 1_000 + 500);
    }

    #[tokio::test]
    async fn test_summary_serializes_structured_output() {
        let outcome = test(
            r#"#{ kind: "image", src: "data:," }"#,
            &InputPayload::Empty,
            &Options::new(),
        )
        .await;
        let summary = outcome.summary();
        assert!(summary.success);
        assert!(summary.output.unwrap().contains("\"kind\":\"image\""));
    }
}
