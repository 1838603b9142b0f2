//! Row access for stored register files.
//!
//! Cell-level parsing and column mapping happen upstream; the [`RowSource`]
//! collaborator returns already-mapped rows for a row range. Work units carry
//! only `(session, batch_number)`, so a worker always re-reads its range from
//! the source — re-enqueueing a batch never replays a stale in-memory payload.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{GirderError, Result};

/// Opaque reference to a file in the external file store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileRef(pub String);

impl std::fmt::Display for FileRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FileRef {
    fn from(s: &str) -> Self {
        FileRef(s.to_string())
    }
}

/// One mapped row of a structural element register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRow {
    /// 1-based position in the source file.
    pub row_number: u32,
    pub structure_number: String,
    pub drawing_number: String,
    pub description: Option<String>,
    pub material: Option<String>,
    /// Workflow label, resolved against the workflow catalog during
    /// validation. `None` creates the element with no tasks.
    pub workflow: Option<String>,
}

impl RegisterRow {
    pub fn new(row_number: u32, structure_number: &str, drawing_number: &str) -> Self {
        RegisterRow {
            row_number,
            structure_number: structure_number.to_string(),
            drawing_number: drawing_number.to_string(),
            description: None,
            material: None,
            workflow: None,
        }
    }

    pub fn with_workflow(mut self, label: &str) -> Self {
        self.workflow = Some(label.to_string());
        self
    }
}

/// Trait for reading rows of a stored register file.
///
/// This abstraction keeps the file store out of the pipeline and makes the
/// worker testable without real files.
#[async_trait]
pub trait RowSource: Send + Sync {
    /// Number of data rows in the stored file.
    ///
    /// # Errors
    /// Returns an error if the file is missing or unreadable; the coordinator
    /// surfaces this immediately to the caller rather than via polling.
    async fn row_count(&self, file: &FileRef) -> Result<u32>;

    /// Fetch the inclusive 1-based row range `start_row..=end_row`.
    ///
    /// # Errors
    /// A failure here is a processing-level error: the batch is marked failed
    /// and becomes retryable.
    async fn fetch_rows(
        &self,
        file: &FileRef,
        start_row: u32,
        end_row: u32,
    ) -> Result<Vec<RegisterRow>>;
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Record of a fetch made against the mock row source.
#[derive(Debug, Clone)]
pub struct FetchCall {
    pub file: FileRef,
    pub start_row: u32,
    pub end_row: u32,
}

/// Mock row source for testing.
///
/// Files are loaded up front; fetch failures can be injected per row range to
/// drive batch-level error paths.
///
/// # Example
/// ```ignore
/// let rows = MockRowSource::new();
/// rows.load_file(&file, vec![RegisterRow::new(1, "B-101", "DWG-7")]);
/// rows.inject_fetch_error(&file, 1, "connection timeout");
/// ```
#[derive(Clone, Default)]
pub struct MockRowSource {
    files: Arc<Mutex<HashMap<FileRef, Vec<RegisterRow>>>>,
    fetch_errors: Arc<Mutex<HashMap<(FileRef, u32), Vec<String>>>>,
    calls: Arc<Mutex<Vec<FetchCall>>>,
}

impl MockRowSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load (or replace) a file's rows.
    pub fn load_file(&self, file: &FileRef, rows: Vec<RegisterRow>) {
        self.files.lock().insert(file.clone(), rows);
    }

    /// Queue a processing-level failure for the next fetch starting at
    /// `start_row`. Multiple injected errors for the same range are consumed
    /// in FIFO order; once drained, fetches succeed again.
    pub fn inject_fetch_error(&self, file: &FileRef, start_row: u32, message: &str) {
        self.fetch_errors
            .lock()
            .entry((file.clone(), start_row))
            .or_default()
            .push(message.to_string());
    }

    /// All fetches made against this source.
    pub fn calls(&self) -> Vec<FetchCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl RowSource for MockRowSource {
    async fn row_count(&self, file: &FileRef) -> Result<u32> {
        self.files
            .lock()
            .get(file)
            .map(|rows| rows.len() as u32)
            .ok_or_else(|| GirderError::RowSource(format!("unknown file: {file}")))
    }

    async fn fetch_rows(
        &self,
        file: &FileRef,
        start_row: u32,
        end_row: u32,
    ) -> Result<Vec<RegisterRow>> {
        self.calls.lock().push(FetchCall {
            file: file.clone(),
            start_row,
            end_row,
        });

        let injected = {
            let mut errors = self.fetch_errors.lock();
            match errors.get_mut(&(file.clone(), start_row)) {
                Some(queue) if !queue.is_empty() => Some(queue.remove(0)),
                _ => None,
            }
        };
        if let Some(message) = injected {
            return Err(GirderError::RowSource(message));
        }

        let files = self.files.lock();
        let rows = files
            .get(file)
            .ok_or_else(|| GirderError::RowSource(format!("unknown file: {file}")))?;
        Ok(rows
            .iter()
            .filter(|row| row.row_number >= start_row && row.row_number <= end_row)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_serves_row_ranges() {
        let source = MockRowSource::new();
        let file = FileRef::from("register.xlsx");
        source.load_file(
            &file,
            (1..=5)
                .map(|n| RegisterRow::new(n, &format!("B-{n}"), "DWG-1"))
                .collect(),
        );

        assert_eq!(source.row_count(&file).await.unwrap(), 5);
        let rows = source.fetch_rows(&file, 2, 4).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].row_number, 2);
        assert_eq!(source.call_count(), 1);
    }

    #[tokio::test]
    async fn injected_error_is_consumed_once() {
        let source = MockRowSource::new();
        let file = FileRef::from("register.xlsx");
        source.load_file(&file, vec![RegisterRow::new(1, "B-1", "DWG-1")]);
        source.inject_fetch_error(&file, 1, "connection timeout");

        let err = source.fetch_rows(&file, 1, 1).await.unwrap_err();
        assert!(err.to_string().contains("connection timeout"));

        // Next fetch of the same range succeeds.
        assert_eq!(source.fetch_rows(&file, 1, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_file_is_an_error() {
        let source = MockRowSource::new();
        let file = FileRef::from("missing.xlsx");
        assert!(source.row_count(&file).await.is_err());
    }
}
