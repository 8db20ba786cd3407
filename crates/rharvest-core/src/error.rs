//! Error taxonomy shared by every stage of the pipeline.

use std::time::Duration;

use thiserror::Error;

/// Failures decoding or validating batch payloads.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A batch that was already enqueued no longer decodes.
    #[error("corrupt batch: {0}")]
    Corrupt(String),
    /// A payload offered for enqueue was rejected before touching the queue.
    #[error("malformed input: {0}")]
    MalformedInput(String),
}

/// Queue and dedup set failures. Any of these aborts the calling step.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store operation `{op}` timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
}

/// Failure of a single document upsert.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index rejected document {id}: {reason}")]
    Rejected { id: String, reason: String },
    #[error("index unavailable: {0}")]
    Unavailable(String),
    #[error("index upsert of {id} timed out after {after:?}")]
    Timeout { id: String, after: Duration },
}

/// Content source failures.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("content source unavailable: {0}")]
    Unavailable(String),
    #[error("content source throttled the request: {0}")]
    Throttled(String),
    #[error("content source returned an unexpected payload: {0}")]
    Malformed(String),
}

impl StoreError {
    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        Self::Unavailable(err.to_string())
    }
}
