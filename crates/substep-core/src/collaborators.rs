//! External collaborator contracts
//!
//! Analysis, suggestion and modify calls are opaque to the engine; it only
//! caches what they return.

use crate::error::CollaboratorError;
use crate::types::DocumentId;
use async_trait::async_trait;
use serde_json::Value;

/// Expensive per-step analysis (e.g. an LLM call)
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Analyze the step's input text
    async fn analyze(&self, text: &str, context: Option<&Value>) -> Result<Value, CollaboratorError>;
}

/// Per-issue remediation lookup
#[async_trait]
pub trait Suggester: Send + Sync {
    /// Produce a suggestion for one issue
    async fn suggest(&self, document: &DocumentId, issue: &Value) -> Result<Value, CollaboratorError>;
}

/// Which modify variant to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyMode {
    /// Produce a prompt the user edits with by hand
    ManualPrompt,
    /// Rewrite the document automatically
    AutomatedRewrite,
}

/// Document modification workflow
#[async_trait]
pub trait ModifyWorkflow: Send + Sync {
    /// Generate a prompt for manual editing
    async fn generate_prompt(
        &self,
        text: &str,
        selections: Option<&Value>,
    ) -> Result<String, CollaboratorError>;

    /// Apply an automated rewrite
    async fn apply_rewrite(
        &self,
        text: &str,
        selections: Option<&Value>,
    ) -> Result<String, CollaboratorError>;

    /// Dispatch on mode
    async fn run(
        &self,
        mode: ModifyMode,
        text: &str,
        selections: Option<&Value>,
    ) -> Result<String, CollaboratorError> {
        match mode {
            ModifyMode::ManualPrompt => self.generate_prompt(text, selections).await,
            ModifyMode::AutomatedRewrite => self.apply_rewrite(text, selections).await,
        }
    }
}
