//! Error types for the ingestion pipeline.

use thiserror::Error;

use crate::domain::{ElementId, SessionId, TaskId};

/// Result type alias using the girder error type.
pub type Result<T> = std::result::Result<T, GirderError>;

/// Main error type for the ingestion pipeline.
///
/// Row-level problems (a bad field in one register row) are not errors at this
/// level: they are collected as `RowError` data in batch outcomes and session
/// summaries. This enum covers batch-, session-, and operation-level failures.
#[derive(Error, Debug)]
pub enum GirderError {
    /// Upload session not found
    #[error("Upload session not found: {0}")]
    SessionNotFound(SessionId),

    /// Batch not found within a session
    #[error("Batch {1} not found in session {0}")]
    BatchNotFound(SessionId, u32),

    /// Element not found
    #[error("Element not found: {0}")]
    ElementNotFound(ElementId),

    /// Task not found
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// A retry or cleanup operation raced a conflicting state change
    #[error("Stale state: batch {1} of session {0} is '{2}', expected '{3}'")]
    StaleState(SessionId, u32, String, String),

    /// Cleanup of actively processed work is not supported
    #[error("Batch {1} of session {0} is still processing")]
    StillProcessing(SessionId, u32),

    /// Source file contains no data rows
    #[error("Source file has no data rows: {0}")]
    EmptyFile(String),

    /// Validation error (e.g., invalid configuration, malformed input)
    #[error("Validation error: {0}")]
    Validation(String),

    /// The row source collaborator failed to serve a row range
    #[error("Row source failure: {0}")]
    RowSource(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Daemon is shutting down
    #[error("Daemon is shutting down")]
    Shutdown,

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
