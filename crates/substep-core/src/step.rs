//! Step-level context
//!
//! [`StepContext`] bundles what one mounted pipeline step needs: the shared
//! controller, the step's name and predecessor chain, the document it works
//! on, and its own suggestion cache.

use crate::analysis::AnalysisOutcome;
use crate::collaborators::{Analyzer, ModifyMode, ModifyWorkflow, Suggester};
use crate::config::EngineConfig;
use crate::controller::{SessionCacheController, WriteTicket};
use crate::error::{CacheError, CacheResult};
use crate::remote::DocumentSource;
use crate::resolver::InputVersion;
use crate::suggestion::SuggestionCache;
use crate::types::{DocumentId, StepName, StepRecord, StepStatus, StepUpdate};
use serde::Serialize;
use serde_json::Value;

/// Caller-owned cap on modify regenerations
///
/// The engine never stores it; each caller decides how many attempts a user
/// gets. Failed attempts are not counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegenerationBudget {
    max: u32,
    used: u32,
}

impl RegenerationBudget {
    /// Create budget allowing `max` regenerations
    #[inline]
    #[must_use]
    pub fn new(max: u32) -> Self {
        Self { max, used: 0 }
    }

    /// Create budget from engine configuration
    #[inline]
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.max_regenerations)
    }

    /// Regenerations allowed
    #[inline]
    #[must_use]
    pub fn max(&self) -> u32 {
        self.max
    }

    /// Regenerations used so far
    #[inline]
    #[must_use]
    pub fn used(&self) -> u32 {
        self.used
    }

    /// Regenerations left
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.max.saturating_sub(self.used)
    }

    /// Check if no regeneration is left
    #[inline]
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// Fail with `RegenerationLimit` if exhausted
    pub fn ensure_remaining(&self) -> CacheResult<()> {
        if self.is_exhausted() {
            return Err(CacheError::RegenerationLimit { max: self.max });
        }
        Ok(())
    }

    /// Use one regeneration, returning how many are left
    pub fn try_consume(&mut self) -> CacheResult<u32> {
        self.ensure_remaining()?;
        self.used += 1;
        Ok(self.remaining())
    }

    /// Start over
    #[inline]
    pub fn reset(&mut self) {
        self.used = 0;
    }
}

impl Default for RegenerationBudget {
    fn default() -> Self {
        Self::new(3)
    }
}

/// One mounted pipeline step
#[derive(Debug, Clone)]
pub struct StepContext {
    controller: SessionCacheController,
    step: StepName,
    predecessors: Vec<StepName>,
    document: DocumentId,
    suggestions: SuggestionCache,
}

impl StepContext {
    /// Create context with no predecessors and a default suggestion cache
    #[must_use]
    pub fn new(
        controller: SessionCacheController,
        step: impl Into<StepName>,
        document: impl Into<DocumentId>,
    ) -> Self {
        Self {
            controller,
            step: step.into(),
            predecessors: Vec::new(),
            document: document.into(),
            suggestions: SuggestionCache::default(),
        }
    }

    /// With predecessor chain, most recent first
    #[must_use]
    pub fn with_predecessors<I, S>(mut self, predecessors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StepName>,
    {
        self.predecessors = predecessors.into_iter().map(Into::into).collect();
        self
    }

    /// With suggestion cache
    #[must_use]
    pub fn with_suggestion_cache(mut self, suggestions: SuggestionCache) -> Self {
        self.suggestions = suggestions;
        self
    }

    /// Step name
    #[inline]
    #[must_use]
    pub fn step(&self) -> &StepName {
        &self.step
    }

    /// Predecessor chain
    #[inline]
    #[must_use]
    pub fn predecessors(&self) -> &[StepName] {
        &self.predecessors
    }

    /// Document id
    #[inline]
    #[must_use]
    pub fn document(&self) -> &DocumentId {
        &self.document
    }

    /// Shared controller
    #[inline]
    #[must_use]
    pub fn controller(&self) -> &SessionCacheController {
        &self.controller
    }

    /// Step's suggestion cache
    #[inline]
    #[must_use]
    pub fn suggestions(&self) -> &SuggestionCache {
        &self.suggestions
    }

    /// Cached record of this step
    #[must_use]
    pub fn record(&self) -> Option<StepRecord> {
        self.controller.get_state(self.step.as_str())
    }

    /// Which version this step operates on
    #[must_use]
    pub fn input_version(&self) -> InputVersion {
        self.controller.resolve_input_version(self.predecessors.as_slice())
    }

    /// Resolve this step's input text
    ///
    /// # Errors
    /// - `CacheError::Document` if the original is needed and cannot be fetched
    pub async fn input_text(&self, source: &dyn DocumentSource) -> CacheResult<String> {
        self.controller
            .resolve_input_text_from(self.predecessors.as_slice(), source, &self.document)
            .await
    }

    /// Memoized analysis of this step's input
    ///
    /// A cached result is returned without touching the document source. The
    /// step's user inputs are passed to the analyzer as context. A fresh
    /// result drops every cached suggestion.
    pub async fn analysis(
        &self,
        source: &dyn DocumentSource,
        analyzer: &dyn Analyzer,
    ) -> CacheResult<AnalysisOutcome> {
        let record = self.record();
        if let Some(cached) = record
            .as_ref()
            .filter(|r| r.has_analysis())
            .and_then(|r| r.analysis_result.clone())
        {
            return Ok(AnalysisOutcome::Cached(cached));
        }

        let text = self.input_text(source).await?;
        let context = record.and_then(|r| r.user_inputs);
        let outcome = self
            .controller
            .analyze_once(self.step.as_str(), &text, context.as_ref(), analyzer)
            .await?;
        if outcome.is_fresh() {
            self.suggestions.invalidate_all();
        }
        Ok(outcome)
    }

    /// Discard the cached analysis, re-open the step and analyze again
    ///
    /// Only `analysis_result` is cleared; user inputs and modified text stay.
    pub async fn reanalyze(
        &self,
        source: &dyn DocumentSource,
        analyzer: &dyn Analyzer,
    ) -> CacheResult<AnalysisOutcome> {
        let update = StepUpdate::new()
            .clear_analysis_result()
            .status(StepStatus::Pending);
        self.controller.save(self.step.as_str(), update).await?;
        self.suggestions.invalidate_all();
        tracing::info!(step = %self.step, "re-analysis requested");
        self.analysis(source, analyzer).await
    }

    /// Suggestion for the issue at `index`, fetched at most once
    ///
    /// # Errors
    /// - `CacheError::Collaborator` if the lookup fails; nothing is cached
    pub async fn suggestion(
        &self,
        index: usize,
        issue: &Value,
        suggester: &dyn Suggester,
    ) -> CacheResult<Value> {
        self.suggestions
            .get_or_fetch(index, || suggester.suggest(&self.document, issue))
            .await
            .map_err(|source| {
                tracing::warn!(step = %self.step, index, error = %source, "suggestion lookup failed");
                CacheError::Collaborator {
                    step: self.step.clone(),
                    source,
                }
            })
    }

    /// Bind the suggestion cache to the current issue list
    pub fn rebind_issues<I: Serialize>(&self, issues: &[I]) -> bool {
        self.suggestions.rebind(issues)
    }

    /// Persist the user's issue selection
    pub fn select_issues(&self, selection: Value) -> WriteTicket<StepRecord> {
        self.controller.save_user_inputs(self.step.as_str(), selection)
    }

    /// Run a modify variant over this step's input
    ///
    /// Returns the prompt (manual mode) or the rewritten text (automated
    /// mode). Nothing is saved until [`StepContext::accept`].
    ///
    /// # Errors
    /// - `CacheError::RegenerationLimit` once `budget` is used up
    /// - `CacheError::Collaborator` if the workflow fails
    pub async fn modify(
        &self,
        source: &dyn DocumentSource,
        workflow: &dyn ModifyWorkflow,
        mode: ModifyMode,
        budget: &mut RegenerationBudget,
    ) -> CacheResult<String> {
        budget.ensure_remaining()?;
        let text = self.input_text(source).await?;
        let selections = self.record().and_then(|r| r.user_inputs);

        let output = workflow
            .run(mode, &text, selections.as_ref())
            .await
            .map_err(|source| {
                self.controller.report(CacheError::Collaborator {
                    step: self.step.clone(),
                    source,
                })
            })?;
        let left = budget.try_consume()?;
        tracing::debug!(step = %self.step, ?mode, remaining = left, "modify produced output");
        Ok(output)
    }

    /// Store `text` as this step's version and complete the step
    pub fn accept(&self, text: impl Into<String>) -> WriteTicket<StepRecord> {
        let update = StepUpdate::new()
            .modified_text(text)
            .status(StepStatus::Completed);
        self.controller.save(self.step.as_str(), update)
    }

    /// Skip this step
    pub fn skip(&self) -> WriteTicket<StepRecord> {
        self.controller.mark_skipped(self.step.as_str())
    }
}
