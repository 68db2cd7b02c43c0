//! Per-step suggestion cache using moka
//!
//! Caches expensive per-issue suggestion lookups for one mounted step.
//! Entries are keyed by the issue's position in the step's current issue
//! list, so the cache must be cleared whenever that list is recomputed.

use crate::config::EngineConfig;
use moka::future::Cache;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Positional suggestion cache
///
/// Keys carry a generation so invalidation is immediate; moka reclaims the
/// dropped generation's entries lazily.
#[derive(Debug, Clone)]
pub struct SuggestionCache {
    inner: Cache<(u64, usize), Value>,
    binding: Arc<Mutex<Binding>>,
}

#[derive(Debug, Default)]
struct Binding {
    generation: u64,
    issues_fingerprint: Option<blake3::Hash>,
}

impl SuggestionCache {
    /// Create cache with max capacity
    #[inline]
    #[must_use]
    pub fn new(max_capacity: u64) -> Self {
        Self::from_cache(Cache::new(max_capacity))
    }

    /// Create cache with time-based expiration
    #[inline]
    #[must_use]
    pub fn with_ttl(max_capacity: u64, ttl: Duration) -> Self {
        Self::from_cache(
            Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
        )
    }

    /// Create cache sized from engine configuration
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        match config.suggestion_ttl() {
            Some(ttl) => Self::with_ttl(config.suggestion_capacity, ttl),
            None => Self::new(config.suggestion_capacity),
        }
    }

    fn from_cache(inner: Cache<(u64, usize), Value>) -> Self {
        Self {
            inner,
            binding: Arc::new(Mutex::new(Binding::default())),
        }
    }

    fn key(&self, issue_index: usize) -> (u64, usize) {
        (self.binding.lock().generation, issue_index)
    }

    /// Get cached suggestion for an issue index
    #[inline]
    pub async fn get(&self, issue_index: usize) -> Option<Value> {
        self.inner.get(&self.key(issue_index)).await
    }

    /// Cache suggestion for an issue index
    #[inline]
    pub async fn put(&self, issue_index: usize, suggestion: Value) {
        self.inner.insert(self.key(issue_index), suggestion).await;
    }

    /// Check if an issue index has a cached suggestion
    #[inline]
    #[must_use]
    pub fn contains(&self, issue_index: usize) -> bool {
        self.inner.contains_key(&self.key(issue_index))
    }

    /// Get cached suggestion or fetch and cache it
    ///
    /// Concurrent lookups for the same issue share one fetch. Failed fetches
    /// are not cached.
    pub async fn get_or_fetch<E, F, Fut>(&self, issue_index: usize, fetch: F) -> Result<Value, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
        E: Clone + Send + Sync + 'static,
    {
        self.inner
            .try_get_with(self.key(issue_index), fetch())
            .await
            .map_err(|e| E::clone(&e))
    }

    /// Drop every cached suggestion
    pub fn invalidate_all(&self) {
        let mut binding = self.binding.lock();
        binding.generation += 1;
        binding.issues_fingerprint = None;
        self.inner.invalidate_all();
    }

    /// Bind the cache to an issue list, clearing it if the list changed
    ///
    /// Returns `true` when cached entries were dropped.
    pub fn rebind<I: Serialize>(&self, issues: &[I]) -> bool {
        let fingerprint = serde_json::to_vec(issues)
            .ok()
            .map(|bytes| blake3::hash(&bytes));

        let mut binding = self.binding.lock();
        if fingerprint.is_some() && binding.issues_fingerprint == fingerprint {
            return false;
        }

        binding.generation += 1;
        binding.issues_fingerprint = fingerprint;
        self.inner.invalidate_all();
        tracing::debug!(issues = issues.len(), "suggestion cache rebound to new issue list");
        true
    }

    /// Get approximate entry count
    #[inline]
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

impl Default for SuggestionCache {
    /// Create cache with default capacity (256 entries)
    fn default() -> Self {
        Self::new(256)
    }
}
