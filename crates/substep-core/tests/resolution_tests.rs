use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::json;
use std::cell::Cell;
use std::sync::Arc;
use substep_core::{
    CacheError, DocumentId, InputVersion, SessionCacheController, StaticDocumentSource, StepName,
};
use substep_test_utils::{
    active_controller, modified_record, original_document, record_with, CountingClient, DOCUMENT,
    ORIGINAL_TEXT,
};

async fn seeded(records: Vec<substep_core::StepRecord>) -> SessionCacheController {
    let client = Arc::new(CountingClient::new());
    for record in records {
        client.seed(record);
    }
    let controller = SessionCacheController::new(client);
    controller.init_session("s1").await.unwrap();
    controller
}

#[tokio::test]
async fn test_only_older_predecessor_modified() {
    let controller = seeded(vec![modified_record("s1", "stepA", "X")]).await;

    let text = controller.resolve_input_text(&["stepB", "stepA"], || ORIGINAL_TEXT.to_string());

    assert_eq!(text, "X");
}

#[tokio::test]
async fn test_most_recent_predecessor_wins() {
    let controller = seeded(vec![
        modified_record("s1", "stepA", "A-edit"),
        modified_record("s1", "stepB", "B-edit"),
    ])
    .await;

    let text = controller.resolve_input_text(&["stepB", "stepA"], || ORIGINAL_TEXT.to_string());
    assert_eq!(text, "B-edit");

    let version = controller.resolve_input_version(&["stepB", "stepA"]);
    assert_eq!(version.source_step(), Some(&StepName::from("stepB")));
}

#[tokio::test]
async fn test_fallback_invoked_exactly_once() {
    let controller = seeded(vec![record_with(
        "s1",
        "stepA",
        Some(json!({"score": 1})),
        Some(json!({"a": 1})),
        None,
    )])
    .await;
    let calls = Cell::new(0);
    let fallback = || {
        calls.set(calls.get() + 1);
        ORIGINAL_TEXT.to_string()
    };

    let empty: [&str; 0] = [];
    assert_eq!(controller.resolve_input_text(&empty, fallback), ORIGINAL_TEXT);
    assert_eq!(calls.get(), 1);

    let unmodified = ["stepA", "never-visited"];
    let text = controller.resolve_input_text(&unmodified, || {
        calls.set(calls.get() + 1);
        ORIGINAL_TEXT.to_string()
    });
    assert_eq!(text, ORIGINAL_TEXT);
    assert_eq!(calls.get(), 2);
}

#[tokio::test]
async fn test_unvisited_and_unmodified_are_skipped_alike() {
    let controller = seeded(vec![
        record_with("s1", "analyzed-only", Some(json!({})), None, None),
        modified_record("s1", "oldest", "oldest-edit"),
    ])
    .await;

    let version = controller.resolve_input_version(&["never-visited", "analyzed-only", "oldest"]);

    assert_eq!(
        version,
        InputVersion::Modified {
            step: StepName::from("oldest"),
            text: "oldest-edit".to_string(),
        }
    );
}

#[tokio::test]
async fn test_scenario_two_step_session() {
    let (controller, _client) = active_controller("s1").await;
    let documents = original_document();
    let document = DocumentId::from(DOCUMENT);

    controller
        .save_analysis_result("step1-0", json!({"score": 10}))
        .await
        .unwrap();
    assert!(controller.has_state("step1-0"));

    let input = controller
        .resolve_input_text_from(&["step1-0"], &documents, &document)
        .await
        .unwrap();
    assert_eq!(input, ORIGINAL_TEXT);

    controller
        .save_modified_text("step1-0", "EDITED")
        .await
        .unwrap();
    let input = controller
        .resolve_input_text_from(&["step1-0"], &documents, &document)
        .await
        .unwrap();
    assert_eq!(input, "EDITED");

    let record = controller.get_state("step1-0").unwrap();
    assert_eq!(record.analysis_result, Some(json!({"score": 10})));
}

#[tokio::test]
async fn test_missing_original_is_reported() {
    let (controller, _client) = active_controller("s1").await;
    let documents = StaticDocumentSource::new();

    let err = controller
        .resolve_input_text_from(&["stepA"], &documents, &DocumentId::from("missing"))
        .await
        .unwrap_err();

    assert!(matches!(err, CacheError::Document { .. }));
    assert!(!err.is_retryable());
    assert!(controller.error().unwrap().contains("missing"));
}

#[tokio::test]
async fn test_modified_predecessor_skips_document_fetch() {
    let controller = seeded(vec![modified_record("s1", "stepA", "X")]).await;
    let documents = StaticDocumentSource::new();

    let text = controller
        .resolve_input_text_from(&["stepA"], &documents, &DocumentId::from("missing"))
        .await
        .unwrap();

    assert_eq!(text, "X");
}

#[tokio::test]
async fn test_cleared_predecessor_falls_back() {
    let controller = seeded(vec![
        modified_record("s1", "stepB", "B-edit"),
        modified_record("s1", "stepA", "A-edit"),
    ])
    .await;

    controller.clear_state("stepB").await.unwrap();

    let text = controller.resolve_input_text(&["stepB", "stepA"], || ORIGINAL_TEXT.to_string());
    assert_eq!(text, "A-edit");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_resolution_matches_first_modified_predecessor(
        edits in proptest::collection::vec(proptest::option::of("[a-z]{1,8}"), 0..6)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let names: Vec<String> = (0..edits.len()).map(|i| format!("step{i}")).collect();
        let records = names
            .iter()
            .zip(&edits)
            .map(|(name, edit)| record_with("s1", name, None, Some(json!({})), edit.as_deref()))
            .collect();
        let controller = runtime.block_on(seeded(records));

        let text = controller.resolve_input_text(&names, || ORIGINAL_TEXT.to_string());

        let expected = edits
            .iter()
            .flatten()
            .next()
            .cloned()
            .unwrap_or_else(|| ORIGINAL_TEXT.to_string());
        prop_assert_eq!(text, expected);
    }
}
