//! Error types for the avoidzones pipeline.
//!
//! Every failure before the engine swap leaves the previously-serving graph
//! untouched; the variants below carry enough context (stage name, captured
//! process output, artifact name) to diagnose a failed rebuild without
//! rerunning it.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed zone configuration or geometry. Raised synchronously,
    /// before anything is written.
    #[error("invalid configuration: {0}")]
    Validation(String),

    /// A version lookup that resolved to nothing.
    #[error("version {0} not found")]
    NotFound(String),

    /// I/O failure in the version store or state files. The caller must not
    /// assume the write happened.
    #[error("storage failure while {context}: {source}")]
    Storage {
        context: String,
        #[source]
        source: io::Error,
    },

    /// Another rebuild job holds the exclusive slot. Callers retry; jobs are
    /// never queued.
    #[error("a rebuild job is already running")]
    Busy,

    /// An external compilation stage exited non-zero, timed out, or the
    /// tagging pass failed to read or write its dataset.
    #[error("stage '{stage}' failed: {detail}")]
    Stage {
        stage: String,
        detail: String,
        /// Combined stdout/stderr captured from the stage process, empty for
        /// tagging-phase failures.
        output: String,
    },

    /// Post-stage verification found an expected artifact missing or empty.
    #[error("expected artifact missing or empty: {0}")]
    ArtifactMissing(String),

    /// The routing engine did not come back up serving the new graph.
    #[error("routing engine restart failed: {0}")]
    Engine(String),
}

impl Error {
    pub(crate) fn storage(context: impl Into<String>, source: io::Error) -> Self {
        Error::Storage {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn stage(stage: &str, detail: impl Into<String>) -> Self {
        Error::Stage {
            stage: stage.to_string(),
            detail: detail.into(),
            output: String::new(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
