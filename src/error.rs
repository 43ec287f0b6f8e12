//! Error taxonomy for the question-answering pipeline.
//!
//! Every component returns a [`PipelineError`]. The orchestrator wraps the
//! first error it sees in a [`PipelineFailure`] tagged with the [`Stage`]
//! that produced it, and aborts the request. Nothing is retried and nothing
//! is swallowed.
//!
//! "No answer determinable from the evidence" is **not** an error: it is a
//! successful [`Answer`](crate::models::Answer) carrying the refusal text.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Result alias used by the pipeline components.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error produced by a single pipeline component.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The input file type or its internal structure cannot be parsed.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// The embedding backend failed, or an input was rejected by the length policy.
    #[error("embedding failed: {0}")]
    Embedding(String),

    /// An index was requested over zero addressable vectors.
    #[error("cannot build an index from zero embedded chunks")]
    EmptyIndex,

    /// The language-model backend failed or returned nothing usable.
    #[error("generation failed: {0}")]
    Generation(String),

    /// A backend call did not finish within the stage timeout.
    #[error("{stage} stage timed out after {after:?}")]
    Timeout { stage: Stage, after: Duration },

    /// Invalid configuration detected while constructing a component.
    #[error("config error: {0}")]
    Config(String),
}

/// Machine-readable error kind, stable across messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UnsupportedFormat,
    Embedding,
    EmptyIndex,
    Generation,
    Timeout,
    Config,
}

impl ErrorKind {
    /// Snake-case code used in HTTP error bodies.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::UnsupportedFormat => "unsupported_format",
            ErrorKind::Embedding => "embedding_error",
            ErrorKind::EmptyIndex => "empty_index",
            ErrorKind::Generation => "generation_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Config => "config_error",
        }
    }
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            PipelineError::Embedding(_) => ErrorKind::Embedding,
            PipelineError::EmptyIndex => ErrorKind::EmptyIndex,
            PipelineError::Generation(_) => ErrorKind::Generation,
            PipelineError::Timeout { .. } => ErrorKind::Timeout,
            PipelineError::Config(_) => ErrorKind::Config,
        }
    }
}

/// States of a single question-answering request.
///
/// ```text
/// Loading → Embedding → Indexing → Retrieving → Composing → Generating → Done
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Loading,
    Embedding,
    Indexing,
    Retrieving,
    Composing,
    Generating,
    Done,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Loading => "loading",
            Stage::Embedding => "embedding",
            Stage::Indexing => "indexing",
            Stage::Retrieving => "retrieving",
            Stage::Composing => "composing",
            Stage::Generating => "generating",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal `FAILED` state of a request: the stage that failed plus the
/// original component error.
#[derive(Debug, Error)]
#[error("{stage} failed: {error}")]
pub struct PipelineFailure {
    pub stage: Stage,
    #[source]
    pub error: PipelineError,
}

impl PipelineFailure {
    pub fn new(stage: Stage, error: PipelineError) -> Self {
        Self { stage, error }
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}
