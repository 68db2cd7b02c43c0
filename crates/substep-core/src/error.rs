//! Error types for the substep cache
//!
//! Provides error handling for:
//! - Remote persistence calls (transport contract)
//! - External collaborators (analysis, suggestion, modify workflow)
//! - Engine operations (session, save, clear, reload)
//! - Configuration loading

use crate::types::{DocumentId, SessionId, StepName};
use std::path::PathBuf;

/// Errors reported by the remote persistence and document APIs
///
/// `NotFound` is kept distinct from transport and server failures so callers
/// can normalize it to "no cached state".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// Requested key does not exist
    #[error("not found")]
    NotFound,

    /// Request never reached the store
    #[error("transport error: {0}")]
    Transport(String),

    /// Store rejected the request
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
}

impl RemoteError {
    /// Create transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Create server error
    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status,
            message: message.into(),
        }
    }

    /// Check if error means "key does not exist"
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Errors raised by external collaborators
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    /// Analysis call failed
    #[error("analysis failed: {0}")]
    Analysis(String),

    /// Suggestion lookup failed
    #[error("suggestion failed: {0}")]
    Suggestion(String),

    /// Modify workflow failed
    #[error("modify workflow failed: {0}")]
    Modify(String),
}

/// Main engine error type
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Per-step operation issued before a successful `init_session`
    #[error("no active session")]
    NoActiveSession,

    /// Bulk load failed
    #[error("failed to load session {session}: {source}")]
    Load {
        session: SessionId,
        #[source]
        source: RemoteError,
    },

    /// Upsert failed
    #[error("failed to save step '{step}': {source}")]
    Save {
        step: StepName,
        #[source]
        source: RemoteError,
    },

    /// Single-step delete failed
    #[error("failed to clear step '{step}': {source}")]
    Clear {
        step: StepName,
        #[source]
        source: RemoteError,
    },

    /// Session-wide delete failed
    #[error("failed to clear session {session}: {source}")]
    ClearAll {
        session: SessionId,
        #[source]
        source: RemoteError,
    },

    /// Single-step fetch failed
    #[error("failed to reload step '{step}': {source}")]
    Reload {
        step: StepName,
        #[source]
        source: RemoteError,
    },

    /// Original document fetch failed
    #[error("failed to fetch document {document}: {source}")]
    Document {
        document: DocumentId,
        #[source]
        source: RemoteError,
    },

    /// Collaborator call failed
    #[error("step '{step}': {source}")]
    Collaborator {
        step: StepName,
        #[source]
        source: CollaboratorError,
    },

    /// Operation outlived the session it was issued for
    #[error("{operation} superseded by a session change")]
    Superseded { operation: String },

    /// Queued write never reported back
    #[error("write for step '{step}' was dropped before completing")]
    Dropped { step: StepName },

    /// No async runtime available to run the step writer
    #[error("no async runtime: {0}")]
    Runtime(String),

    /// Caller-supplied regeneration budget exhausted
    #[error("regeneration limit reached ({max})")]
    RegenerationLimit { max: u32 },
}

impl CacheError {
    /// Check if a retry action makes sense
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Load { source, .. }
            | Self::Save { source, .. }
            | Self::Clear { source, .. }
            | Self::ClearAll { source, .. }
            | Self::Reload { source, .. }
            | Self::Document { source, .. } => !source.is_not_found(),
            Self::Collaborator { .. } | Self::Dropped { .. } => true,
            Self::NoActiveSession
            | Self::Superseded { .. }
            | Self::Runtime(_)
            | Self::RegenerationLimit { .. } => false,
        }
    }

    /// Create superseded error for an operation label
    pub fn superseded(operation: impl Into<String>) -> Self {
        Self::Superseded {
            operation: operation.into(),
        }
    }
}

/// Errors while loading configuration or installing logging
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// IO error reading a config file
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed TOML
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Log filter directive rejected
    #[error("invalid log filter '{filter}': {message}")]
    LogFilter { filter: String, message: String },

    /// Global subscriber already installed
    #[error("logging already initialized: {0}")]
    Logging(String),
}

/// Result type alias for engine operations
pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_error_display() {
        let err = CacheError::Save {
            step: StepName::from("stepX"),
            source: RemoteError::transport("connection reset"),
        };
        assert_eq!(
            err.to_string(),
            "failed to save step 'stepX': transport error: connection reset"
        );
    }

    #[test]
    fn not_found_is_not_retryable() {
        let err = CacheError::Reload {
            step: StepName::from("a"),
            source: RemoteError::NotFound,
        };
        assert!(!err.is_retryable());

        let err = CacheError::Load {
            session: SessionId::from("s1"),
            source: RemoteError::server(503, "unavailable"),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn no_session_is_not_retryable() {
        assert!(!CacheError::NoActiveSession.is_retryable());
        assert_eq!(CacheError::NoActiveSession.to_string(), "no active session");
    }
}
