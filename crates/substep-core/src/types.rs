//! Core types for the substep cache
//!
//! Defines the data model shared by every component:
//! - Identifier newtypes (session, step, document, record)
//! - [`StepRecord`], the cached state unit for one (session, step) pair
//! - [`StepUpdate`] and [`FieldUpdate`], the partial-save vocabulary
//! - [`SaveRequest`], the full field set sent to the remote store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Borrow;
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw identifier
            #[inline]
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the raw identifier
            #[inline]
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&$name> for $name {
            fn from(value: &$name) -> Self {
                value.clone()
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Owning session of a set of step records
    SessionId
);

string_id!(
    /// Pipeline stage identifier, unique within a session
    StepName
);

string_id!(
    /// Identifier of a source document
    DocumentId
);

string_id!(
    /// Opaque record identifier assigned by the remote store on first save
    RecordId
);

/// Lifecycle status of a step
///
/// `Completed` and `Skipped` are terminal for normal pipeline flow, but any
/// status may be set directly so a step can always be re-opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Default after a save that sets no status
    #[default]
    Pending,
    /// Step result accepted
    Completed,
    /// Step intentionally bypassed
    Skipped,
}

impl StepStatus {
    /// Check if status ends normal pipeline flow for the step
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    /// Wire name of the status
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cached state for one (session, step) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    /// Assigned by the remote store; absent until the first successful save
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RecordId>,
    /// Owning session
    pub session_id: SessionId,
    /// Map key within the session
    pub step_name: StepName,
    /// Cached output of the expensive analysis call
    #[serde(default)]
    pub analysis_result: Option<Value>,
    /// User selections scoped to this step
    #[serde(default)]
    pub user_inputs: Option<Value>,
    /// Full document text produced at this step
    #[serde(default)]
    pub modified_text: Option<String>,
    /// Step status
    #[serde(default)]
    pub status: StepStatus,
    /// Refreshed by the remote store on every successful save
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    /// Create an empty pending record
    #[must_use]
    pub fn new(session_id: impl Into<SessionId>, step_name: impl Into<StepName>) -> Self {
        Self {
            id: None,
            session_id: session_id.into(),
            step_name: step_name.into(),
            analysis_result: None,
            user_inputs: None,
            modified_text: None,
            status: StepStatus::Pending,
            updated_at: None,
        }
    }

    /// With analysis result
    #[must_use]
    pub fn with_analysis_result(mut self, result: Value) -> Self {
        self.analysis_result = Some(result);
        self
    }

    /// With user inputs
    #[must_use]
    pub fn with_user_inputs(mut self, inputs: Value) -> Self {
        self.user_inputs = Some(inputs);
        self
    }

    /// With modified text
    #[must_use]
    pub fn with_modified_text(mut self, text: impl Into<String>) -> Self {
        self.modified_text = Some(text.into());
        self
    }

    /// With status
    #[must_use]
    pub fn with_status(mut self, status: StepStatus) -> Self {
        self.status = status;
        self
    }

    /// True iff the step's analysis has a cached non-null result
    #[inline]
    #[must_use]
    pub fn has_analysis(&self) -> bool {
        self.analysis_result.as_ref().is_some_and(|v| !v.is_null())
    }

    /// True iff the step produced a new document version
    #[inline]
    #[must_use]
    pub fn has_modified_text(&self) -> bool {
        self.modified_text.is_some()
    }
}

/// Change to one optional field of a step record
#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate<T> {
    /// Round-trip the currently known value
    Keep,
    /// Replace the value
    Set(T),
    /// Explicitly null the value
    Clear,
}

impl<T> Default for FieldUpdate<T> {
    fn default() -> Self {
        Self::Keep
    }
}

impl<T> FieldUpdate<T> {
    /// Resolve against the currently known value
    #[inline]
    pub fn resolve(self, current: Option<T>) -> Option<T> {
        match self {
            Self::Keep => current,
            Self::Set(value) => Some(value),
            Self::Clear => None,
        }
    }

    /// Check if the update leaves the field untouched
    #[inline]
    #[must_use]
    pub fn is_keep(&self) -> bool {
        matches!(self, Self::Keep)
    }
}

/// Partial save for one step
///
/// Fields left at [`FieldUpdate::Keep`] (and a `None` status) are filled from
/// the step's current known record when the save is merged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepUpdate {
    /// Analysis result change
    pub analysis_result: FieldUpdate<Value>,
    /// User inputs change
    pub user_inputs: FieldUpdate<Value>,
    /// Modified text change
    pub modified_text: FieldUpdate<String>,
    /// New status, if any
    pub status: Option<StepStatus>,
}

impl StepUpdate {
    /// Create an update that changes nothing
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the analysis result
    #[must_use]
    pub fn analysis_result(mut self, result: Value) -> Self {
        self.analysis_result = FieldUpdate::Set(result);
        self
    }

    /// Null the analysis result
    #[must_use]
    pub fn clear_analysis_result(mut self) -> Self {
        self.analysis_result = FieldUpdate::Clear;
        self
    }

    /// Set the user inputs
    #[must_use]
    pub fn user_inputs(mut self, inputs: Value) -> Self {
        self.user_inputs = FieldUpdate::Set(inputs);
        self
    }

    /// Null the user inputs
    #[must_use]
    pub fn clear_user_inputs(mut self) -> Self {
        self.user_inputs = FieldUpdate::Clear;
        self
    }

    /// Set the modified text
    #[must_use]
    pub fn modified_text(mut self, text: impl Into<String>) -> Self {
        self.modified_text = FieldUpdate::Set(text.into());
        self
    }

    /// Null the modified text
    #[must_use]
    pub fn clear_modified_text(mut self) -> Self {
        self.modified_text = FieldUpdate::Clear;
        self
    }

    /// Set the status
    #[must_use]
    pub fn status(mut self, status: StepStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Merge onto the step's current known record, producing a full write
    ///
    /// Untouched fields round-trip from `existing`; without a record they
    /// default to null and `Pending`.
    #[must_use]
    pub fn merge_onto(
        self,
        session_id: &SessionId,
        step_name: &StepName,
        existing: Option<&StepRecord>,
    ) -> SaveRequest {
        SaveRequest {
            session_id: session_id.clone(),
            step_name: step_name.clone(),
            analysis_result: self
                .analysis_result
                .resolve(existing.and_then(|r| r.analysis_result.clone()))
                .filter(|v| !v.is_null()),
            user_inputs: self
                .user_inputs
                .resolve(existing.and_then(|r| r.user_inputs.clone()))
                .filter(|v| !v.is_null()),
            modified_text: self
                .modified_text
                .resolve(existing.and_then(|r| r.modified_text.clone())),
            status: self
                .status
                .or_else(|| existing.map(|r| r.status))
                .unwrap_or_default(),
        }
    }
}

/// Full field set sent to the remote upsert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveRequest {
    /// Owning session
    pub session_id: SessionId,
    /// Step key
    pub step_name: StepName,
    /// Analysis result
    pub analysis_result: Option<Value>,
    /// User inputs
    pub user_inputs: Option<Value>,
    /// Modified text
    pub modified_text: Option<String>,
    /// Status
    pub status: StepStatus,
}

impl SaveRequest {
    /// Materialize as a stored record with store-assigned metadata
    #[must_use]
    pub fn into_record(self, id: RecordId, updated_at: DateTime<Utc>) -> StepRecord {
        StepRecord {
            id: Some(id),
            session_id: self.session_id,
            step_name: self.step_name,
            analysis_result: self.analysis_result,
            user_inputs: self.user_inputs,
            modified_text: self.modified_text,
            status: self.status,
            updated_at: Some(updated_at),
        }
    }
}
