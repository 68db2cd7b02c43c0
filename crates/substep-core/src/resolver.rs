//! Document version resolution
//!
//! A step's input text is the modified text of its most recent predecessor
//! that produced one, or the original document when none did. Predecessor
//! chains are caller-supplied and ordered most-recent-first; the resolver has
//! no notion of pipeline topology.

use crate::types::StepName;
use std::future::Future;

/// Lookup of per-step modified text
pub trait VersionSource {
    /// Modified text of a step, if it produced one
    fn modified_text(&self, step: &str) -> Option<String>;
}

/// Which version a step should operate on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputVersion {
    /// Modified text produced by a predecessor
    Modified {
        /// Predecessor that produced the text
        step: StepName,
        /// The text
        text: String,
    },
    /// No predecessor produced a version
    Original,
}

impl InputVersion {
    /// Step that produced the version, if any
    #[inline]
    #[must_use]
    pub fn source_step(&self) -> Option<&StepName> {
        match self {
            Self::Modified { step, .. } => Some(step),
            Self::Original => None,
        }
    }
}

/// Resolves input text against a [`VersionSource`]
#[derive(Debug, Clone, Copy)]
pub struct VersionResolver<'a, S: ?Sized> {
    source: &'a S,
}

impl<'a, S: VersionSource + ?Sized> VersionResolver<'a, S> {
    /// Create resolver over a source
    #[inline]
    #[must_use]
    pub fn new(source: &'a S) -> Self {
        Self { source }
    }

    /// Scan predecessors in order and stop at the first modified version
    ///
    /// Steps with no record and steps with no modified text are both skipped.
    #[must_use]
    pub fn locate<P: AsRef<str>>(&self, predecessors: &[P]) -> InputVersion {
        predecessors
            .iter()
            .find_map(|step| {
                let step = step.as_ref();
                self.source
                    .modified_text(step)
                    .map(|text| InputVersion::Modified {
                        step: StepName::from(step),
                        text,
                    })
            })
            .unwrap_or(InputVersion::Original)
    }

    /// Resolve input text, calling `fallback` only when no predecessor matched
    pub fn resolve_input_text<P, F>(&self, predecessors: &[P], fallback: F) -> String
    where
        P: AsRef<str>,
        F: FnOnce() -> String,
    {
        match self.locate(predecessors) {
            InputVersion::Modified { step, text } => {
                tracing::debug!(step = %step, "resolved input from modified version");
                text
            }
            InputVersion::Original => {
                tracing::debug!("no modified predecessor, using original");
                fallback()
            }
        }
    }

    /// Resolve input text with a fallible async fallback
    pub async fn try_resolve_input_text<P, E, F, Fut>(
        &self,
        predecessors: &[P],
        fallback: F,
    ) -> Result<String, E>
    where
        P: AsRef<str>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, E>>,
    {
        match self.locate(predecessors) {
            InputVersion::Modified { text, .. } => Ok(text),
            InputVersion::Original => fallback().await,
        }
    }
}
