//! Remote persistence contracts
//!
//! The engine never talks to a network client directly. It consumes:
//! - [`RemoteStateClient`]: per-session step record persistence
//! - [`DocumentSource`]: pristine original document text
//!
//! [`InMemoryStateClient`] and [`StaticDocumentSource`] are reference
//! backends used by the CLI and the test suites.

mod memory;

pub use memory::{InMemoryStateClient, StaticDocumentSource};

use crate::error::RemoteError;
use crate::types::{DocumentId, SaveRequest, SessionId, StepName, StepRecord};
use async_trait::async_trait;
use std::collections::HashMap;

/// Persistence API for step records
///
/// Loads return [`RemoteError::NotFound`] for missing keys so the engine can
/// tell "nothing stored" apart from transport or server failures.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteStateClient: Send + Sync {
    /// Load every record of a session keyed by step name
    async fn load_session(
        &self,
        session: &SessionId,
    ) -> Result<HashMap<StepName, StepRecord>, RemoteError>;

    /// Load one record
    async fn load_step(
        &self,
        session: &SessionId,
        step: &StepName,
    ) -> Result<StepRecord, RemoteError>;

    /// Insert or replace a record, returning the authoritative stored value
    async fn upsert(&self, request: SaveRequest) -> Result<StepRecord, RemoteError>;

    /// Delete one record
    async fn delete_step(&self, session: &SessionId, step: &StepName) -> Result<(), RemoteError>;

    /// Delete every record of a session
    async fn delete_session(&self, session: &SessionId) -> Result<(), RemoteError>;
}

/// Source of pristine document text
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Fetch the original text of a document
    async fn original_text(&self, document: &DocumentId) -> Result<String, RemoteError>;
}
