//! In-memory reference backends

use super::{DocumentSource, RemoteStateClient};
use crate::error::RemoteError;
use crate::types::{DocumentId, RecordId, SaveRequest, SessionId, StepName, StepRecord};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::Duration;
use ulid::Ulid;

/// Remote store kept in process memory
///
/// Behaves like the HTTP store: assigns ULID record ids on first save,
/// refreshes `updated_at` on every save, and answers `NotFound` for unknown
/// sessions and steps.
#[derive(Debug, Default)]
pub struct InMemoryStateClient {
    sessions: DashMap<SessionId, HashMap<StepName, StepRecord>>,
    latency: Option<Duration>,
}

impl InMemoryStateClient {
    /// Create empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency` to surface interleavings
    #[inline]
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Store a record as-is, bypassing id assignment
    pub fn seed(&self, record: StepRecord) {
        self.sessions
            .entry(record.session_id.clone())
            .or_default()
            .insert(record.step_name.clone(), record);
    }

    /// Read a stored record
    #[must_use]
    pub fn stored(&self, session: &str, step: &str) -> Option<StepRecord> {
        self.sessions
            .get(session)
            .and_then(|steps| steps.get(step).cloned())
    }

    /// Number of records stored for a session
    #[must_use]
    pub fn record_count(&self, session: &str) -> usize {
        self.sessions.get(session).map_or(0, |steps| steps.len())
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl RemoteStateClient for InMemoryStateClient {
    async fn load_session(
        &self,
        session: &SessionId,
    ) -> Result<HashMap<StepName, StepRecord>, RemoteError> {
        self.simulate_latency().await;
        match self.sessions.get(session) {
            Some(steps) if !steps.is_empty() => Ok(steps.clone()),
            _ => Err(RemoteError::NotFound),
        }
    }

    async fn load_step(
        &self,
        session: &SessionId,
        step: &StepName,
    ) -> Result<StepRecord, RemoteError> {
        self.simulate_latency().await;
        self.stored(session.as_str(), step.as_str())
            .ok_or(RemoteError::NotFound)
    }

    async fn upsert(&self, request: SaveRequest) -> Result<StepRecord, RemoteError> {
        self.simulate_latency().await;
        let mut steps = self.sessions.entry(request.session_id.clone()).or_default();
        let id = steps
            .get(&request.step_name)
            .and_then(|existing| existing.id.clone())
            .unwrap_or_else(|| RecordId::new(Ulid::new().to_string()));
        let record = request.into_record(id, Utc::now());
        steps.insert(record.step_name.clone(), record.clone());
        Ok(record)
    }

    async fn delete_step(&self, session: &SessionId, step: &StepName) -> Result<(), RemoteError> {
        self.simulate_latency().await;
        if let Some(mut steps) = self.sessions.get_mut(session) {
            steps.remove(step);
        }
        Ok(())
    }

    async fn delete_session(&self, session: &SessionId) -> Result<(), RemoteError> {
        self.simulate_latency().await;
        self.sessions.remove(session);
        Ok(())
    }
}

/// Document source backed by a fixed map
#[derive(Debug, Default, Clone)]
pub struct StaticDocumentSource {
    documents: HashMap<DocumentId, String>,
}

impl StaticDocumentSource {
    /// Create empty source
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With document text
    #[must_use]
    pub fn with_document(mut self, document: impl Into<DocumentId>, text: impl Into<String>) -> Self {
        self.documents.insert(document.into(), text.into());
        self
    }
}

#[async_trait]
impl DocumentSource for StaticDocumentSource {
    async fn original_text(&self, document: &DocumentId) -> Result<String, RemoteError> {
        self.documents
            .get(document)
            .cloned()
            .ok_or(RemoteError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{StepStatus, StepUpdate};
    use serde_json::json;

    fn request(step: &str) -> SaveRequest {
        StepUpdate::new()
            .user_inputs(json!({"sel": [1]}))
            .merge_onto(&SessionId::from("s1"), &StepName::from(step), None)
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let client = InMemoryStateClient::new();
        let result = client.load_session(&SessionId::from("missing")).await;
        assert_eq!(result.unwrap_err(), RemoteError::NotFound);
    }

    #[tokio::test]
    async fn upsert_assigns_stable_id() {
        let client = InMemoryStateClient::new();

        let first = client.upsert(request("a")).await.unwrap();
        let second = client.upsert(request("a")).await.unwrap();

        assert!(first.id.is_some());
        assert_eq!(first.id, second.id);
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(client.record_count("s1"), 1);
    }

    #[tokio::test]
    async fn delete_step_then_load_is_not_found() {
        let client = InMemoryStateClient::new();
        client.upsert(request("a")).await.unwrap();

        let session = SessionId::from("s1");
        let step = StepName::from("a");
        client.delete_step(&session, &step).await.unwrap();

        assert!(client.load_step(&session, &step).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn seeded_records_load_in_bulk() {
        let client = InMemoryStateClient::new();
        client.seed(StepRecord::new("s1", "a").with_status(StepStatus::Completed));
        client.seed(StepRecord::new("s1", "b"));

        let records = client.load_session(&SessionId::from("s1")).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[&StepName::from("a")].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn static_source_missing_document() {
        let source = StaticDocumentSource::new().with_document("doc-1", "original");
        assert_eq!(
            source.original_text(&DocumentId::from("doc-1")).await.unwrap(),
            "original"
        );
        assert!(source
            .original_text(&DocumentId::from("doc-2"))
            .await
            .unwrap_err()
            .is_not_found());
    }
}
