//! In-memory step record store
//!
//! One map per session, keyed by step name. Reads clone out of the map and
//! never perform I/O; the controller is the only writer.

use crate::resolver::VersionSource;
use crate::types::{StepName, StepRecord};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct StoredRecord {
    record: StepRecord,
    synced_at: DateTime<Utc>,
}

/// Keyed map from step name to its cached record
#[derive(Debug, Default)]
pub struct StepRecordStore {
    records: RwLock<HashMap<StepName, StoredRecord>>,
}

impl StepRecordStore {
    /// Create empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a copy of a step's record
    #[must_use]
    pub fn get(&self, step: &str) -> Option<StepRecord> {
        self.records.read().get(step).map(|s| s.record.clone())
    }

    /// Check if a step has any record
    #[inline]
    #[must_use]
    pub fn contains(&self, step: &str) -> bool {
        self.records.read().contains_key(step)
    }

    /// Check if a step has a cached analysis result
    #[must_use]
    pub fn has_analysis(&self, step: &str) -> bool {
        self.records
            .read()
            .get(step)
            .is_some_and(|s| s.record.has_analysis())
    }

    /// Insert or replace a step's record, stamping its sync time
    pub fn insert(&self, step: StepName, record: StepRecord) {
        let stored = StoredRecord {
            record,
            synced_at: Utc::now(),
        };
        self.records.write().insert(step, stored);
    }

    /// Remove a step's record
    pub fn remove(&self, step: &str) -> Option<StepRecord> {
        self.records.write().remove(step).map(|s| s.record)
    }

    /// Replace the whole map in one step
    pub fn replace_all(&self, records: impl IntoIterator<Item = StepRecord>) {
        let synced_at = Utc::now();
        let fresh: HashMap<_, _> = records
            .into_iter()
            .map(|record| {
                (
                    record.step_name.clone(),
                    StoredRecord { record, synced_at },
                )
            })
            .collect();
        *self.records.write() = fresh;
    }

    /// Drop every record
    pub fn clear(&self) {
        self.records.write().clear();
    }

    /// Number of cached records
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Check if no record is cached
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Cached step names, sorted
    #[must_use]
    pub fn step_names(&self) -> Vec<StepName> {
        let mut names: Vec<_> = self.records.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// When a step's record was last written from the remote store
    #[must_use]
    pub fn last_synced(&self, step: &str) -> Option<DateTime<Utc>> {
        self.records.read().get(step).map(|s| s.synced_at)
    }
}

impl VersionSource for StepRecordStore {
    fn modified_text(&self, step: &str) -> Option<String> {
        self.records
            .read()
            .get(step)
            .and_then(|s| s.record.modified_text.clone())
    }
}
