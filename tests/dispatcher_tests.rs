//! In-process dispatcher tests
//!
//! Everything here runs with the in-process policy, so no worker binary is
//! involved. See `isolation_tests.rs` for the worker path.

use transform_engine::types::{DiffTag, StructuredResult};
use transform_engine::{
    Dispatcher, EngineConfig, ExecutionLimits, ExecutionResult, ExecutionSlot, FailureKind,
    InputPayload, RoutingPolicy, ToolId, TransformRequest, validation,
};

fn dispatcher() -> Dispatcher {
    Dispatcher::new(EngineConfig::default().with_policy(RoutingPolicy::InProcess))
}

// ============================================================================
// Catalog tools
// ============================================================================

#[tokio::test]
async fn test_base64_round_trip() {
    let dispatcher = dispatcher();
    let encoded = dispatcher
        .execute(TransformRequest::tool(ToolId::Base64Encode).with_input("hello"), None)
        .await
        .unwrap();
    assert_eq!(encoded, ExecutionResult::text("aGVsbG8="));

    let decoded = dispatcher
        .execute(
            TransformRequest::tool(ToolId::Base64Decode).with_input(encoded.as_text().unwrap()),
            None,
        )
        .await
        .unwrap();
    assert_eq!(decoded, ExecutionResult::text("hello"));
}

#[tokio::test]
async fn test_invalid_base64_is_user_input_failure() {
    let result = dispatcher()
        .execute(TransformRequest::tool(ToolId::Base64Decode).with_input("!!!"), None)
        .await
        .unwrap();
    assert_eq!(result.as_failure().unwrap().kind, FailureKind::UserInput);
}

#[tokio::test]
async fn test_text_diff_is_structured() {
    let request = TransformRequest::tool(ToolId::TextDiff)
        .with_input(InputPayload::DualText {
            left: "a\nb\n".into(),
            right: "a\nc\n".into(),
        })
        .with_option("mode", "lines");
    let result = dispatcher().execute(request, None).await.unwrap();

    let ExecutionResult::Structured(StructuredResult::Diff(diff)) = result else {
        panic!("expected a diff, got {:?}", result);
    };
    let tags: Vec<DiffTag> = diff.changes.iter().map(|c| c.tag).collect();
    assert!(tags.contains(&DiffTag::Unchanged));
    assert!(tags.contains(&DiffTag::Added));
    assert!(tags.contains(&DiffTag::Removed));
}

#[tokio::test]
async fn test_color_breakdown() {
    let result = dispatcher()
        .execute(TransformRequest::tool(ToolId::ColorBreakdown).with_input("#ff0000"), None)
        .await
        .unwrap();
    let ExecutionResult::Structured(StructuredResult::ColorBreakdown(color)) = result else {
        panic!("expected a color breakdown, got {:?}", result);
    };
    assert_eq!(color.rgb, [255, 0, 0]);
    assert_eq!(color.hex, "#ff0000");
}

// ============================================================================
// Scripts
// ============================================================================

#[tokio::test]
async fn test_script_returns_text() {
    let result = dispatcher()
        .execute(TransformRequest::code("return input.to_upper();").with_input("abc"), None)
        .await
        .unwrap();
    assert_eq!(result, ExecutionResult::text("ABC"));
}

#[tokio::test]
async fn test_script_reads_options() {
    let request = TransformRequest::code(r#"if opts.shout { input + "!" } else { input }"#)
        .with_input("hey")
        .with_option("shout", true);
    let result = dispatcher().execute(request, None).await.unwrap();
    assert_eq!(result, ExecutionResult::text("hey!"));
}

#[tokio::test]
async fn test_thrown_error_is_user_input() {
    let result = dispatcher()
        .execute(TransformRequest::code(r#"throw "bad";"#), None)
        .await
        .unwrap();
    let failure = result.as_failure().unwrap();
    assert_eq!(failure.kind, FailureKind::UserInput);
    assert_eq!(failure.message, "bad");
}

#[tokio::test]
async fn test_throw_from_helper_function_is_verbatim() {
    let request =
        TransformRequest::code(r#"fn check(x) { throw "bad"; } check(input)"#).with_input("abc");
    let result = dispatcher().execute(request, None).await.unwrap();
    assert_eq!(result, ExecutionResult::user_input("bad"));
}

#[tokio::test]
async fn test_error_shaped_map_is_failure() {
    let result = dispatcher()
        .execute(TransformRequest::code(r#"#{ error: "X" }"#), None)
        .await
        .unwrap();
    assert_eq!(result, ExecutionResult::user_input("X"));
}

#[tokio::test]
async fn test_unknown_kind_map_is_pretty_text() {
    let result = dispatcher()
        .execute(TransformRequest::code(r#"#{ kind: "chart", points: 3 }"#), None)
        .await
        .unwrap();
    let text = result.as_text().unwrap();
    assert!(text.contains("\"kind\": \"chart\""));
}

#[tokio::test]
async fn test_unit_result_is_empty_text() {
    let result = dispatcher()
        .execute(TransformRequest::code("let x = 1;"), None)
        .await
        .unwrap();
    assert_eq!(result, ExecutionResult::text(""));
}

#[tokio::test]
async fn test_undefined_identifier_is_unit() {
    let result = dispatcher()
        .execute(TransformRequest::code("let seen = document; seen"), None)
        .await
        .unwrap();
    assert_eq!(result, ExecutionResult::text(""));
}

#[tokio::test]
async fn test_runaway_script_times_out() {
    let request = TransformRequest::code("loop {}").with_deadline_ms(100);
    let started = std::time::Instant::now();
    let result = dispatcher().execute(request, None).await.unwrap();
    assert_eq!(result.as_failure().unwrap().kind, FailureKind::Timeout);
    assert!(started.elapsed().as_millis() < 1_000);
}

#[tokio::test]
async fn test_operation_budget_is_timeout() {
    let dispatcher = Dispatcher::new(
        EngineConfig::default()
            .with_policy(RoutingPolicy::InProcess)
            .with_limits(ExecutionLimits::default().with_max_operations(1_000)),
    );
    let result = dispatcher
        .execute(TransformRequest::code("loop {}"), None)
        .await
        .unwrap();
    assert_eq!(result.as_failure().unwrap().kind, FailureKind::Timeout);
}

#[tokio::test]
async fn test_syntax_error_is_sandbox_violation() {
    let result = dispatcher()
        .execute(TransformRequest::code("let = ;"), None)
        .await
        .unwrap();
    assert_eq!(result.as_failure().unwrap().kind, FailureKind::SandboxViolation);
}

// ============================================================================
// Cancellation and supersession
// ============================================================================

#[tokio::test]
async fn test_slot_delivers_only_latest() {
    let mut slot = ExecutionSlot::new(dispatcher());
    let first = slot.submit(TransformRequest::code("loop {}").with_deadline_ms(5_000));
    let second = slot.submit(TransformRequest::tool(ToolId::UpperCase).with_input("b"));

    assert!(first.is_cancelled());
    assert!(first.outcome().await.is_err());
    assert_eq!(second.outcome().await, Ok(ExecutionResult::text("B")));
}

#[tokio::test]
async fn test_handle_ids_are_unique() {
    let dispatcher = dispatcher();
    let a = dispatcher.spawn(TransformRequest::tool(ToolId::UpperCase));
    let b = dispatcher.spawn(TransformRequest::tool(ToolId::UpperCase));
    assert_ne!(a.id(), b.id());
}

// ============================================================================
// Validation
// ============================================================================

#[tokio::test]
async fn test_validation_reports_success() {
    let outcome = validation::test(
        "input.len()",
        &InputPayload::from("four"),
        &Default::default(),
    )
    .await;
    assert!(outcome.success);
    assert_eq!(outcome.result, Some(ExecutionResult::text("4")));
}

#[tokio::test]
async fn test_validation_reports_failure() {
    let outcome = validation::test(r#"throw "nope";"#, &InputPayload::Empty, &Default::default()).await;
    assert!(!outcome.success);
    assert_eq!(outcome.error.as_deref(), Some("nope"));
}
