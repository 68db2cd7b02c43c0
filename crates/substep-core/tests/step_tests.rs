use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use substep_core::{
    AnalysisOutcome, CacheError, EngineConfig, InputVersion, ModifyMode, RegenerationBudget,
    SessionCacheController, StaticDocumentSource, StepContext, StepStatus, SuggestionCache,
};
use substep_test_utils::{
    active_controller, modified_record, original_document, record_with, CountingClient,
    EchoSuggester, ScriptedAnalyzer, UppercaseWorkflow, DOCUMENT, ORIGINAL_TEXT,
};

fn context(controller: &SessionCacheController, step: &str, predecessors: &[&str]) -> StepContext {
    StepContext::new(controller.clone(), step, DOCUMENT).with_predecessors(predecessors.iter().copied())
}

#[tokio::test]
async fn test_analysis_runs_on_resolved_input() {
    let (controller, _client) = active_controller("s1").await;
    controller.save_modified_text("step1-0", "EDITED").await.unwrap();
    let step = context(&controller, "step1-1", &["step1-0"]);
    let analyzer = ScriptedAnalyzer::returning(json!({"issues": []}));

    let outcome = step.analysis(&original_document(), &analyzer).await.unwrap();

    assert!(outcome.is_fresh());
    assert_eq!(analyzer.inputs(), vec!["EDITED".to_string()]);
    assert!(controller.has_state("step1-1"));
}

#[tokio::test]
async fn test_cached_analysis_skips_document_and_analyzer() {
    let client = Arc::new(CountingClient::new());
    client.seed(record_with("s1", "step", Some(json!({"score": 2})), None, None));
    let controller = SessionCacheController::new(client);
    controller.init_session("s1").await.unwrap();

    let step = context(&controller, "step", &[]);
    let analyzer = ScriptedAnalyzer::returning(json!({"score": 99}));
    let no_documents = StaticDocumentSource::new();

    let outcome = step.analysis(&no_documents, &analyzer).await.unwrap();

    assert_eq!(outcome, AnalysisOutcome::Cached(json!({"score": 2})));
    assert_eq!(analyzer.calls(), 0);
}

#[tokio::test]
async fn test_null_analysis_is_retried() {
    let (controller, client) = active_controller("s1").await;
    let step = context(&controller, "step", &[]);
    let analyzer = ScriptedAnalyzer::returning(Value::Null);

    for _ in 0..2 {
        let outcome = step.analysis(&original_document(), &analyzer).await.unwrap();
        assert_eq!(outcome, AnalysisOutcome::Fresh(Value::Null));
    }

    assert_eq!(analyzer.calls(), 2);
    assert!(!controller.has_state("step"));
    assert!(client.stored("s1", "step").is_none());
}

#[tokio::test]
async fn test_reanalyze_clears_only_analysis() {
    let client = Arc::new(CountingClient::new());
    client.seed(
        record_with(
            "s1",
            "step",
            Some(json!({"score": 2})),
            Some(json!({"sel": [1]})),
            Some("kept text"),
        )
        .with_status(StepStatus::Completed),
    );
    let controller = SessionCacheController::new(client);
    controller.init_session("s1").await.unwrap();
    let step = context(&controller, "step", &[]);
    let analyzer = ScriptedAnalyzer::returning(json!({"score": 8}));

    let outcome = step.reanalyze(&original_document(), &analyzer).await.unwrap();

    assert_eq!(outcome, AnalysisOutcome::Fresh(json!({"score": 8})));
    let record = step.record().unwrap();
    assert_eq!(record.analysis_result, Some(json!({"score": 8})));
    assert_eq!(record.user_inputs, Some(json!({"sel": [1]})));
    assert_eq!(record.modified_text.as_deref(), Some("kept text"));
    assert_eq!(record.status, StepStatus::Pending);
}

#[tokio::test]
async fn test_suggestions_fetched_once_per_issue() {
    let (controller, _client) = active_controller("s1").await;
    let step = context(&controller, "step", &[]);
    let suggester = EchoSuggester::new();
    let issue = json!({"type": "passive"});

    let first = step.suggestion(0, &issue, &suggester).await.unwrap();
    let again = step.suggestion(0, &issue, &suggester).await.unwrap();
    step.suggestion(1, &json!({"type": "jargon"}), &suggester)
        .await
        .unwrap();

    assert_eq!(first, again);
    assert_eq!(first["document"], json!(DOCUMENT));
    assert_eq!(suggester.calls(), 2);
}

#[tokio::test]
async fn test_fresh_analysis_drops_cached_suggestions() {
    let (controller, _client) = active_controller("s1").await;
    let step = context(&controller, "step", &[]);
    let suggester = EchoSuggester::new();
    let analyzer = ScriptedAnalyzer::returning(json!({"issues": ["x"]}));
    let issue = json!({"type": "passive"});

    step.suggestion(0, &issue, &suggester).await.unwrap();
    step.analysis(&original_document(), &analyzer).await.unwrap();
    step.suggestion(0, &issue, &suggester).await.unwrap();
    assert_eq!(suggester.calls(), 2);

    step.analysis(&original_document(), &analyzer).await.unwrap();
    step.suggestion(0, &issue, &suggester).await.unwrap();
    assert_eq!(suggester.calls(), 2);

    step.reanalyze(&original_document(), &analyzer).await.unwrap();
    step.suggestion(0, &issue, &suggester).await.unwrap();
    assert_eq!(suggester.calls(), 3);
}

#[tokio::test]
async fn test_double_click_fetches_suggestion_once() {
    let (controller, _client) = active_controller("s1").await;
    let step = context(&controller, "step", &[]);
    let suggester = EchoSuggester::new().with_delay(Duration::from_millis(30));
    let issue = json!({"type": "passive"});

    let (first, second) = tokio::join!(
        step.suggestion(0, &issue, &suggester),
        step.suggestion(0, &issue, &suggester),
    );

    assert_eq!(first.unwrap(), second.unwrap());
    assert_eq!(suggester.calls(), 1);
}

#[tokio::test]
async fn test_failed_suggestion_is_not_cached() {
    let (controller, _client) = active_controller("s1").await;
    let step = context(&controller, "step", &[]);
    let suggester = EchoSuggester::new();
    let issue = json!({"type": "passive"});

    suggester.fail(true);
    let err = step.suggestion(0, &issue, &suggester).await.unwrap_err();
    assert!(matches!(err, CacheError::Collaborator { .. }));
    assert!(!step.suggestions().contains(0));

    suggester.fail(false);
    step.suggestion(0, &issue, &suggester).await.unwrap();
    assert_eq!(suggester.calls(), 2);
}

#[tokio::test]
async fn test_rebind_issues_clears_on_reorder() {
    let (controller, _client) = active_controller("s1").await;
    let step = context(&controller, "step", &[])
        .with_suggestion_cache(SuggestionCache::from_config(&EngineConfig::default()));
    let suggester = EchoSuggester::new();
    let issues = vec![json!({"type": "a"}), json!({"type": "b"})];

    step.rebind_issues(&issues);
    step.suggestion(1, &issues[1], &suggester).await.unwrap();
    assert!(!step.rebind_issues(&issues));
    assert!(step.suggestions().contains(1));

    let reordered = vec![issues[1].clone(), issues[0].clone()];
    assert!(step.rebind_issues(&reordered));
    assert!(!step.suggestions().contains(1));
}

#[tokio::test]
async fn test_select_issues_saves_user_inputs() {
    let (controller, client) = active_controller("s1").await;
    let step = context(&controller, "step", &[]);

    step.select_issues(json!({"sel": [0, 2]})).await.unwrap();

    assert_eq!(step.record().unwrap().user_inputs, Some(json!({"sel": [0, 2]})));
    assert!(client.stored("s1", "step").is_some());
}

#[tokio::test]
async fn test_modify_variants() {
    let (controller, _client) = active_controller("s1").await;
    let step = context(&controller, "step", &[]);
    let workflow = UppercaseWorkflow::new();
    let mut budget = RegenerationBudget::default();
    step.select_issues(json!({"sel": [1]})).await.unwrap();

    let prompt = step
        .modify(&original_document(), &workflow, ModifyMode::ManualPrompt, &mut budget)
        .await
        .unwrap();
    assert!(prompt.contains(ORIGINAL_TEXT));
    assert!(prompt.contains("{\"sel\":[1]}"));

    let rewrite = step
        .modify(&original_document(), &workflow, ModifyMode::AutomatedRewrite, &mut budget)
        .await
        .unwrap();
    assert_eq!(rewrite, ORIGINAL_TEXT.to_uppercase());
    assert_eq!(budget.remaining(), 1);
    assert!(step.record().unwrap().modified_text.is_none());
}

#[tokio::test]
async fn test_regeneration_budget_caps_modify() {
    let (controller, _client) = active_controller("s1").await;
    let step = context(&controller, "step", &[]);
    let workflow = UppercaseWorkflow::new();
    let mut budget = RegenerationBudget::new(2);
    let documents = original_document();

    workflow.fail(true);
    assert!(step
        .modify(&documents, &workflow, ModifyMode::AutomatedRewrite, &mut budget)
        .await
        .is_err());
    assert_eq!(budget.used(), 0);

    workflow.fail(false);
    for _ in 0..2 {
        step.modify(&documents, &workflow, ModifyMode::AutomatedRewrite, &mut budget)
            .await
            .unwrap();
    }
    let err = step
        .modify(&documents, &workflow, ModifyMode::AutomatedRewrite, &mut budget)
        .await
        .unwrap_err();

    assert!(matches!(err, CacheError::RegenerationLimit { max: 2 }));
    assert_eq!(workflow.calls(), 3);
}

#[tokio::test]
async fn test_accept_feeds_downstream_steps() {
    let (controller, _client) = active_controller("s1").await;
    let upstream = context(&controller, "step1-0", &[]);
    let downstream = context(&controller, "step1-1", &["step1-0"]);
    upstream.select_issues(json!({"sel": [0]})).await.unwrap();

    let record = upstream.accept("EDITED").await.unwrap();

    assert_eq!(record.modified_text.as_deref(), Some("EDITED"));
    assert_eq!(record.status, StepStatus::Completed);
    assert_eq!(record.user_inputs, Some(json!({"sel": [0]})));
    assert_eq!(
        downstream.input_text(&original_document()).await.unwrap(),
        "EDITED"
    );
    assert_eq!(
        downstream.input_version().source_step().map(|s| s.as_str()),
        Some("step1-0")
    );
}

#[tokio::test]
async fn test_skip_passes_version_through() {
    let client = Arc::new(CountingClient::new());
    client.seed(modified_record("s1", "step1-0", "from step 0"));
    let controller = SessionCacheController::new(client);
    controller.init_session("s1").await.unwrap();

    let skipped = context(&controller, "step1-1", &["step1-0"]);
    let last = context(&controller, "step1-2", &["step1-1", "step1-0"]);

    let record = skipped.skip().await.unwrap();
    assert_eq!(record.status, StepStatus::Skipped);
    assert_eq!(
        last.input_text(&original_document()).await.unwrap(),
        "from step 0"
    );
}

#[tokio::test]
async fn test_first_step_reads_original() {
    let (controller, _client) = active_controller("s1").await;
    let step = context(&controller, "step1-0", &[]);

    assert_eq!(step.input_version(), InputVersion::Original);
    assert_eq!(
        step.input_text(&original_document()).await.unwrap(),
        ORIGINAL_TEXT
    );
    assert_eq!(step.predecessors().len(), 0);
    assert_eq!(step.document().as_str(), DOCUMENT);
}
