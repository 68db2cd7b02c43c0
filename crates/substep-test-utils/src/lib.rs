//! Testing utilities for the Substep workspace
//!
//! Shared fakes, fixtures and helpers for the integration suites.

#![allow(missing_docs)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use substep_core::{
    Analyzer, CollaboratorError, DocumentId, InMemoryStateClient, ModifyWorkflow, RemoteError,
    RemoteStateClient, SaveRequest, SessionCacheController, SessionId, StaticDocumentSource,
    StepName, StepRecord, StepStatus,
};

pub const DOCUMENT: &str = "doc-1";
pub const ORIGINAL_TEXT: &str = "The original document text.";

/// Per-operation call counts
#[derive(Debug, Default)]
pub struct CallCounts {
    pub load_session: AtomicUsize,
    pub load_step: AtomicUsize,
    pub upsert: AtomicUsize,
    pub delete_step: AtomicUsize,
    pub delete_session: AtomicUsize,
}

impl CallCounts {
    pub fn load_session(&self) -> usize {
        self.load_session.load(Ordering::SeqCst)
    }

    pub fn load_step(&self) -> usize {
        self.load_step.load(Ordering::SeqCst)
    }

    pub fn upsert(&self) -> usize {
        self.upsert.load(Ordering::SeqCst)
    }

    pub fn delete_step(&self) -> usize {
        self.delete_step.load(Ordering::SeqCst)
    }

    pub fn delete_session(&self) -> usize {
        self.delete_session.load(Ordering::SeqCst)
    }
}

/// In-memory store that counts calls and can be told to fail
#[derive(Debug, Default)]
pub struct CountingClient {
    inner: InMemoryStateClient,
    pub calls: CallCounts,
    fail_loads: AtomicBool,
    fail_saves: AtomicBool,
    fail_deletes: AtomicBool,
    load_delay: Option<Duration>,
    save_delay: Option<Duration>,
}

impl CountingClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = Some(delay);
        self
    }

    pub fn with_save_delay(mut self, delay: Duration) -> Self {
        self.save_delay = Some(delay);
        self
    }

    pub fn seed(&self, record: StepRecord) {
        self.inner.seed(record);
    }

    pub fn stored(&self, session: &str, step: &str) -> Option<StepRecord> {
        self.inner.stored(session, step)
    }

    pub fn record_count(&self, session: &str) -> usize {
        self.inner.record_count(session)
    }

    pub fn fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    fn outage(flag: &AtomicBool) -> Result<(), RemoteError> {
        if flag.load(Ordering::SeqCst) {
            return Err(RemoteError::server(503, "store unavailable"));
        }
        Ok(())
    }
}

async fn pause(delay: Option<Duration>) {
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
}

#[async_trait]
impl RemoteStateClient for CountingClient {
    async fn load_session(
        &self,
        session: &SessionId,
    ) -> Result<HashMap<StepName, StepRecord>, RemoteError> {
        self.calls.load_session.fetch_add(1, Ordering::SeqCst);
        pause(self.load_delay).await;
        Self::outage(&self.fail_loads)?;
        self.inner.load_session(session).await
    }

    async fn load_step(
        &self,
        session: &SessionId,
        step: &StepName,
    ) -> Result<StepRecord, RemoteError> {
        self.calls.load_step.fetch_add(1, Ordering::SeqCst);
        pause(self.load_delay).await;
        Self::outage(&self.fail_loads)?;
        self.inner.load_step(session, step).await
    }

    async fn upsert(&self, request: SaveRequest) -> Result<StepRecord, RemoteError> {
        self.calls.upsert.fetch_add(1, Ordering::SeqCst);
        pause(self.save_delay).await;
        Self::outage(&self.fail_saves)?;
        self.inner.upsert(request).await
    }

    async fn delete_step(&self, session: &SessionId, step: &StepName) -> Result<(), RemoteError> {
        self.calls.delete_step.fetch_add(1, Ordering::SeqCst);
        Self::outage(&self.fail_deletes)?;
        self.inner.delete_step(session, step).await
    }

    async fn delete_session(&self, session: &SessionId) -> Result<(), RemoteError> {
        self.calls.delete_session.fetch_add(1, Ordering::SeqCst);
        Self::outage(&self.fail_deletes)?;
        self.inner.delete_session(session).await
    }
}

/// Store whose every call fails with a transport error
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingClient;

#[async_trait]
impl RemoteStateClient for FailingClient {
    async fn load_session(&self, _: &SessionId) -> Result<HashMap<StepName, StepRecord>, RemoteError> {
        Err(RemoteError::transport("connection refused"))
    }

    async fn load_step(&self, _: &SessionId, _: &StepName) -> Result<StepRecord, RemoteError> {
        Err(RemoteError::transport("connection refused"))
    }

    async fn upsert(&self, _: SaveRequest) -> Result<StepRecord, RemoteError> {
        Err(RemoteError::transport("connection refused"))
    }

    async fn delete_step(&self, _: &SessionId, _: &StepName) -> Result<(), RemoteError> {
        Err(RemoteError::transport("connection refused"))
    }

    async fn delete_session(&self, _: &SessionId) -> Result<(), RemoteError> {
        Err(RemoteError::transport("connection refused"))
    }
}

/// Analyzer returning a fixed result, with call counting
#[derive(Debug)]
pub struct ScriptedAnalyzer {
    result: Value,
    delay: Option<Duration>,
    failures_left: AtomicUsize,
    calls: AtomicUsize,
    inputs: Mutex<Vec<String>>,
}

impl ScriptedAnalyzer {
    pub fn returning(result: Value) -> Self {
        Self {
            result,
            delay: None,
            failures_left: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the first `n` calls
    pub fn failing_first(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Input texts received, in call order
    pub fn inputs(&self) -> Vec<String> {
        self.inputs.lock().clone()
    }
}

#[async_trait]
impl Analyzer for ScriptedAnalyzer {
    async fn analyze(&self, text: &str, _: Option<&Value>) -> Result<Value, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().push(text.to_string());
        pause(self.delay).await;

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CollaboratorError::Analysis("model timeout".into()));
        }
        Ok(self.result.clone())
    }
}

/// Suggester echoing the issue back, with call counting
#[derive(Debug, Default)]
pub struct EchoSuggester {
    calls: AtomicUsize,
    fail: AtomicBool,
    delay: Option<Duration>,
}

impl EchoSuggester {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl substep_core::Suggester for EchoSuggester {
    async fn suggest(&self, document: &DocumentId, issue: &Value) -> Result<Value, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        pause(self.delay).await;
        if self.fail.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Suggestion("lookup failed".into()));
        }
        Ok(json!({ "document": document.as_str(), "fix_for": issue }))
    }
}

/// Modify workflow with deterministic outputs
#[derive(Debug, Default)]
pub struct UppercaseWorkflow {
    calls: AtomicUsize,
    fail: AtomicBool,
}

impl UppercaseWorkflow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn attempt(&self) -> Result<(), CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Modify("rewrite failed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ModifyWorkflow for UppercaseWorkflow {
    async fn generate_prompt(
        &self,
        text: &str,
        selections: Option<&Value>,
    ) -> Result<String, CollaboratorError> {
        self.attempt()?;
        let selections = selections.map_or_else(|| "none".to_string(), Value::to_string);
        Ok(format!("Rewrite the text fixing issues {selections}:\n{text}"))
    }

    async fn apply_rewrite(
        &self,
        text: &str,
        _: Option<&Value>,
    ) -> Result<String, CollaboratorError> {
        self.attempt()?;
        Ok(text.to_uppercase())
    }
}

/// Record for a step with the given fields set
pub fn record_with(
    session: &str,
    step: &str,
    analysis_result: Option<Value>,
    user_inputs: Option<Value>,
    modified_text: Option<&str>,
) -> StepRecord {
    let mut record = StepRecord::new(session, step);
    record.analysis_result = analysis_result;
    record.user_inputs = user_inputs;
    record.modified_text = modified_text.map(str::to_string);
    record
}

/// Completed record carrying a modified version
pub fn modified_record(session: &str, step: &str, text: &str) -> StepRecord {
    record_with(session, step, None, None, Some(text)).with_status(StepStatus::Completed)
}

/// Document source holding [`ORIGINAL_TEXT`] under [`DOCUMENT`]
pub fn original_document() -> StaticDocumentSource {
    StaticDocumentSource::new().with_document(DOCUMENT, ORIGINAL_TEXT)
}

/// Controller over a fresh counting client, already initialized for `session`
pub async fn active_controller(session: &str) -> (SessionCacheController, Arc<CountingClient>) {
    let client = Arc::new(CountingClient::new());
    let controller = SessionCacheController::new(client.clone());
    controller
        .init_session(session)
        .await
        .expect("init against in-memory store");
    (controller, client)
}
