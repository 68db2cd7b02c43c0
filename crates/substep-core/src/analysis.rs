//! Analysis memoization
//!
//! Expensive analysis runs at most once per step per session. The cache
//! check, the analyzer call and the save happen under one per-step gate, so
//! a concurrent mount of the same step waits and then reads the cached
//! result instead of analyzing again.

use crate::collaborators::Analyzer;
use crate::controller::SessionCacheController;
use crate::error::{CacheError, CacheResult};
use crate::types::StepName;
use serde_json::Value;
use tokio::sync::OwnedMutexGuard;

/// Where an analysis result came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisOutcome {
    /// Served from the session cache; the analyzer was not called
    Cached(Value),
    /// Produced by the analyzer during this call
    Fresh(Value),
}

impl AnalysisOutcome {
    /// Borrow the result
    #[inline]
    #[must_use]
    pub fn value(&self) -> &Value {
        match self {
            Self::Cached(value) | Self::Fresh(value) => value,
        }
    }

    /// Take the result
    #[inline]
    #[must_use]
    pub fn into_value(self) -> Value {
        match self {
            Self::Cached(value) | Self::Fresh(value) => value,
        }
    }

    /// Check if the analyzer ran
    #[inline]
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh(_))
    }
}

/// Exclusive right to run analysis for one step
///
/// Held by callers that drive the analyzer themselves. Released on drop.
#[derive(Debug)]
pub struct AnalysisGuard {
    step: StepName,
    _running: OwnedMutexGuard<()>,
}

impl AnalysisGuard {
    /// Step being analyzed
    #[inline]
    #[must_use]
    pub fn step(&self) -> &StepName {
        &self.step
    }
}

impl SessionCacheController {
    /// Return the cached analysis or run `analyzer` once and persist it
    ///
    /// A failed or null analysis caches nothing. If the analysis succeeds but the
    /// save fails, the fresh result is still returned and the save failure is
    /// surfaced through [`SessionCacheController::error`].
    ///
    /// # Errors
    /// - `CacheError::Collaborator` if the analyzer fails
    pub async fn analyze_once(
        &self,
        step: &str,
        text: &str,
        context: Option<&Value>,
        analyzer: &dyn Analyzer,
    ) -> CacheResult<AnalysisOutcome> {
        let gate = self.analysis_gate(step);
        let _running = gate.lock().await;

        if let Some(cached) = self
            .get_state(step)
            .and_then(|r| r.analysis_result)
            .filter(|v| !v.is_null())
        {
            tracing::debug!(step = %step, "analysis served from cache");
            return Ok(AnalysisOutcome::Cached(cached));
        }

        tracing::info!(step = %step, "running analysis");
        let result = analyzer.analyze(text, context).await.map_err(|source| {
            self.report(CacheError::Collaborator {
                step: StepName::from(step),
                source,
            })
        })?;

        if result.is_null() {
            tracing::debug!(step = %step, "analyzer returned null, nothing cached");
            return Ok(AnalysisOutcome::Fresh(result));
        }
        if let Err(e) = self.save_analysis_result(step, result.clone()).await {
            tracing::warn!(step = %step, error = %e, "analysis result not persisted");
        }
        Ok(AnalysisOutcome::Fresh(result))
    }

    /// Claim the step for analysis if nothing is cached and nobody else is
    /// analyzing it
    #[must_use]
    pub fn try_begin_analysis(&self, step: &str) -> Option<AnalysisGuard> {
        if self.has_state(step) {
            return None;
        }
        let running = self.analysis_gate(step).try_lock_owned().ok()?;
        if self.has_state(step) {
            return None;
        }
        Some(AnalysisGuard {
            step: StepName::from(step),
            _running: running,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CollaboratorError;
    use crate::remote::InMemoryStateClient;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
        fail: bool,
        null: bool,
    }

    #[async_trait]
    impl Analyzer for Counting {
        async fn analyze(&self, text: &str, _: Option<&Value>) -> Result<Value, CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(CollaboratorError::Analysis("model unavailable".into()));
            }
            if self.null {
                return Ok(Value::Null);
            }
            Ok(json!({ "length": text.len() }))
        }
    }

    async fn active() -> SessionCacheController {
        let controller = SessionCacheController::new(Arc::new(InMemoryStateClient::new()));
        controller.init_session("s1").await.unwrap();
        controller
    }

    #[tokio::test]
    async fn second_call_is_cached() {
        let controller = active().await;
        let analyzer = Counting::default();

        let first = controller
            .analyze_once("step", "hello", None, &analyzer)
            .await
            .unwrap();
        let second = controller
            .analyze_once("step", "hello", None, &analyzer)
            .await
            .unwrap();

        assert!(first.is_fresh());
        assert_eq!(second, AnalysisOutcome::Cached(json!({ "length": 5 })));
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 1);
        assert!(controller.has_state("step"));
    }

    #[tokio::test]
    async fn failed_analysis_caches_nothing() {
        let controller = active().await;
        let analyzer = Counting {
            fail: true,
            ..Counting::default()
        };

        let err = controller
            .analyze_once("step", "hello", None, &analyzer)
            .await
            .unwrap_err();

        assert!(matches!(err, CacheError::Collaborator { .. }));
        assert!(!controller.has_state("step"));
        assert!(controller.get_state("step").is_none());
    }

    #[tokio::test]
    async fn null_result_is_never_cached() {
        let controller = active().await;
        let analyzer = Counting {
            null: true,
            ..Counting::default()
        };

        for _ in 0..2 {
            let outcome = controller
                .analyze_once("step", "hello", None, &analyzer)
                .await
                .unwrap();
            assert_eq!(outcome, AnalysisOutcome::Fresh(Value::Null));
        }

        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 2);
        assert!(!controller.has_state("step"));
        assert!(controller.get_state("step").is_none());
        assert!(controller.try_begin_analysis("step").is_some());
    }

    #[tokio::test]
    async fn guard_is_exclusive_until_dropped() {
        let controller = active().await;

        let guard = controller.try_begin_analysis("step").unwrap();
        assert_eq!(guard.step().as_str(), "step");
        assert!(controller.try_begin_analysis("step").is_none());
        assert!(controller.try_begin_analysis("other").is_some());

        drop(guard);
        assert!(controller.try_begin_analysis("step").is_some());
    }

    #[tokio::test]
    async fn guard_refused_once_cached() {
        let controller = active().await;
        controller
            .save_analysis_result("step", json!({"score": 1}))
            .await
            .unwrap();

        assert!(controller.try_begin_analysis("step").is_none());
    }
}
