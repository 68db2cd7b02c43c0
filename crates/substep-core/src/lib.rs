//! Substep Core - step state cache and document-version resolution
//!
//! Keeps the per-step state of a multi-step document pipeline:
//! - Caches one record per (session, step) in memory, backed by a remote store
//! - Serializes writes per step so partial saves never lose updates
//! - Memoizes expensive analysis so it runs at most once per step
//! - Resolves which document version a step operates on
//! - Caches per-issue suggestions for a mounted step
//!
//! # Example
//!
//! ```rust,ignore
//! use substep_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let controller = SessionCacheController::new(Arc::new(InMemoryStateClient::new()));
//! controller.init_session("s1").await?;
//!
//! controller.save_modified_text("step1-0", "EDITED").await?;
//! let text = controller.resolve_input_text(&["step1-1", "step1-0"], || "original".into());
//! assert_eq!(text, "EDITED");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod analysis;
pub mod collaborators;
pub mod config;
pub mod controller;
pub mod error;
pub mod remote;
pub mod resolver;
pub mod step;
pub mod store;
pub mod suggestion;
pub mod telemetry;
pub mod types;

pub use analysis::{AnalysisGuard, AnalysisOutcome};
pub use collaborators::{Analyzer, ModifyMode, ModifyWorkflow, Suggester};
pub use config::EngineConfig;
pub use controller::{SessionCacheController, WriteTicket};
pub use error::{CacheError, CacheResult, CollaboratorError, ConfigError, RemoteError};
pub use remote::{DocumentSource, InMemoryStateClient, RemoteStateClient, StaticDocumentSource};
pub use resolver::{InputVersion, VersionResolver, VersionSource};
pub use step::{RegenerationBudget, StepContext};
pub use store::StepRecordStore;
pub use suggestion::SuggestionCache;
pub use telemetry::init_tracing;
pub use types::{
    DocumentId, FieldUpdate, RecordId, SaveRequest, SessionId, StepName, StepRecord, StepStatus,
    StepUpdate,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with Substep Core
    pub use crate::{
        AnalysisOutcome, Analyzer, CacheError, CacheResult, DocumentId, DocumentSource,
        EngineConfig, InMemoryStateClient, ModifyMode, ModifyWorkflow, RegenerationBudget,
        RemoteStateClient, SessionCacheController, SessionId, StaticDocumentSource, StepContext,
        StepName, StepRecord, StepStatus, StepUpdate, Suggester, SuggestionCache,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
