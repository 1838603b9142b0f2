//! Upload session records and session-level status derivation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rows::FileRef;

use super::batch::{BatchDetail, BatchStatusKind, RowError};
use super::element::ProjectId;

/// Unique identifier for an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl From<Uuid> for SessionId {
    fn from(uuid: Uuid) -> Self {
        SessionId(uuid)
    }
}

impl std::ops::Deref for SessionId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Lifecycle status of an upload session, derived from its batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Partitioned, nothing attempted yet.
    Queued,
    /// At least one batch claimed or finished, others still outstanding.
    InProgress,
    /// Every batch finished; some succeeded and some failed.
    PartialSuccess,
    /// Every batch succeeded.
    Completed,
    /// Every attempted batch failed, or partitioning itself failed.
    Failed,
}

impl SessionStatus {
    /// Derive the session status from its batches' coarse states.
    ///
    /// An empty batch set derives `Completed` (vacuously; cleanup can delete
    /// every batch of a session). The fail-fast path for unreadable or empty
    /// files sets `Failed` explicitly, before any batch exists.
    pub fn derive<I>(batches: I) -> SessionStatus
    where
        I: IntoIterator<Item = BatchStatusKind>,
    {
        let mut pending = 0u32;
        let mut processing = 0u32;
        let mut succeeded = 0u32;
        let mut failed = 0u32;
        for kind in batches {
            match kind {
                BatchStatusKind::Pending => pending += 1,
                BatchStatusKind::Processing => processing += 1,
                BatchStatusKind::Succeeded => succeeded += 1,
                BatchStatusKind::Failed => failed += 1,
            }
        }

        if pending + processing == 0 {
            if failed == 0 {
                SessionStatus::Completed
            } else if succeeded == 0 {
                SessionStatus::Failed
            } else {
                SessionStatus::PartialSuccess
            }
        } else if processing == 0 && succeeded == 0 && failed == 0 {
            SessionStatus::Queued
        } else {
            SessionStatus::InProgress
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::PartialSuccess | SessionStatus::Completed | SessionStatus::Failed
        )
    }
}

/// Aggregated counters for one upload session.
///
/// Invariant: `successful_batches + failed_batches + pending(derived)` equals
/// the session's `total_batches` at all times after partitioning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub successful_batches: u32,
    pub failed_batches: u32,
    pub total_elements_created: u64,
    pub total_tasks_created: u64,
    pub duplicates_skipped: u64,
}

/// One register file upload.
#[derive(Debug, Clone, Serialize)]
pub struct UploadSession {
    pub id: SessionId,
    pub project_id: ProjectId,
    pub file: FileRef,
    pub file_name: String,
    pub total_batches: u32,
    pub status: SessionStatus,
    pub summary: SessionSummary,
    pub created_at: DateTime<Utc>,
}

impl UploadSession {
    /// Batches not yet in a terminal state, derived from the counters.
    pub fn pending_batches(&self) -> u32 {
        self.total_batches - self.summary.successful_batches - self.summary.failed_batches
    }
}

/// Point-in-time progress snapshot: current summary plus per-batch detail.
/// Produced by a side-effect-free read, safe to poll at any rate.
#[derive(Debug, Clone, Serialize)]
pub struct SessionProgress {
    pub session_id: SessionId,
    pub file_name: String,
    pub status: SessionStatus,
    pub total_batches: u32,
    pub summary: SessionSummary,
    /// Row-level errors across all finished batches, in batch order.
    pub row_errors: Vec<RowError>,
    pub batches: Vec<BatchDetail>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use BatchStatusKind::*;

    #[test]
    fn derive_covers_the_status_table() {
        assert_eq!(
            SessionStatus::derive([Pending, Pending]),
            SessionStatus::Queued
        );
        assert_eq!(
            SessionStatus::derive([Processing, Pending]),
            SessionStatus::InProgress
        );
        assert_eq!(
            SessionStatus::derive([Succeeded, Pending]),
            SessionStatus::InProgress
        );
        assert_eq!(
            SessionStatus::derive([Succeeded, Succeeded]),
            SessionStatus::Completed
        );
        assert_eq!(
            SessionStatus::derive([Succeeded, Failed]),
            SessionStatus::PartialSuccess
        );
        assert_eq!(
            SessionStatus::derive([Failed, Failed]),
            SessionStatus::Failed
        );
    }
}
