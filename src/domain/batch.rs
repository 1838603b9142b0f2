//! Batch work units and their typestate lifecycle.
//!
//! A batch is a contiguous row range of the source file. Its lifecycle is
//! enforced at compile time with the typestate pattern:
//!
//! ```text
//! Batch<Pending> ──claim()──> Batch<Processing> ──succeed()──> BatchOutcome (succeeded)
//!       ▲                           │           ──fail()─────> BatchOutcome (failed)
//!       │                           │
//!       ├──────requeue()────────────┘   (stuck-worker sweep, retry_count unchanged)
//!       │
//! Batch<Failed> ──retry()──> Batch<Pending>   (retry_count + 1)
//! ```
//!
//! `succeed`/`fail` produce a [`BatchOutcome`] event rather than persisting
//! directly: the storage layer applies the outcome transactionally, and
//! idempotently via the `attempt` counter, so replaying an outcome never
//! double-counts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::element::Element;
use super::session::SessionId;
use super::task::{Task, TaskId};
use crate::domain::ElementId;

/// Identifier for a batch worker instance, for claim tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub Uuid);

impl From<Uuid> for WorkerId {
    fn from(uuid: Uuid) -> Self {
        WorkerId(uuid)
    }
}

impl std::ops::Deref for WorkerId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// One rejected register row: recorded as data, never a batch failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    /// 1-based row number in the source file.
    pub row: u32,
    pub message: String,
}

/// Marker trait for valid batch states.
pub trait BatchState: Send + Sync {}

/// Identity and row range of a batch; immutable across state transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchData {
    pub session_id: SessionId,
    /// 1-based; defines processing order within the session.
    pub batch_number: u32,
    /// 1-based inclusive row range in the source file.
    pub start_row: u32,
    pub end_row: u32,
}

/// A batch work unit in state `T`.
#[derive(Debug, Clone, Serialize)]
pub struct Batch<T: BatchState> {
    pub state: T,
    pub data: BatchData,
}

/// Batch is waiting to be claimed by a worker.
#[derive(Debug, Clone, Serialize)]
pub struct Pending {
    /// Number of explicit retries so far (0 = first attempt).
    pub retry_count: u32,
}

impl BatchState for Pending {}

/// Batch has been claimed and its rows are being processed.
#[derive(Debug, Clone, Serialize)]
pub struct Processing {
    pub worker_id: WorkerId,
    pub claimed_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl BatchState for Processing {}

/// Batch finished without a processing-level error.
///
/// Row-level errors may be present; they surface in the session's error list,
/// not as batch failure.
#[derive(Debug, Clone, Serialize)]
pub struct Succeeded {
    pub completed_at: DateTime<Utc>,
    pub retry_count: u32,
    pub elements_created: Vec<ElementId>,
    pub tasks_created: Vec<TaskId>,
    pub duplicates_skipped: u64,
    pub row_errors: Vec<RowError>,
}

impl BatchState for Succeeded {}

/// Batch hit a processing-level error (unreadable range, storage failure).
/// Retryable; `error` is always non-empty.
#[derive(Debug, Clone, Serialize)]
pub struct Failed {
    pub failed_at: DateTime<Utc>,
    pub retry_count: u32,
    pub error: String,
}

impl BatchState for Failed {}

impl Batch<Pending> {
    /// Claim this batch for a worker. The storage layer calls this while
    /// holding its write lock so the pending-to-processing flip is atomic.
    pub fn claim(self, worker_id: WorkerId) -> Batch<Processing> {
        Batch {
            state: Processing {
                worker_id,
                claimed_at: Utc::now(),
                retry_count: self.state.retry_count,
            },
            data: self.data,
        }
    }
}

impl Batch<Processing> {
    /// Emit the success outcome for this attempt. Created elements and their
    /// tasks travel inside the outcome and are committed together with the
    /// status flip, so a partially visible batch state cannot exist.
    pub fn succeed(
        self,
        elements: Vec<(Element, Vec<Task>)>,
        duplicates_skipped: u64,
        row_errors: Vec<RowError>,
    ) -> BatchOutcome {
        BatchOutcome {
            session_id: self.data.session_id,
            batch_number: self.data.batch_number,
            attempt: self.state.retry_count,
            result: OutcomeResult::Succeeded {
                elements,
                duplicates_skipped,
                row_errors,
            },
        }
    }

    /// Emit the failure outcome for this attempt. An empty message is replaced
    /// so that every failed batch carries a diagnosable error.
    pub fn fail(self, error: impl Into<String>) -> BatchOutcome {
        let mut error = error.into();
        if error.is_empty() {
            error = "unspecified processing failure".to_string();
        }
        BatchOutcome {
            session_id: self.data.session_id,
            batch_number: self.data.batch_number,
            attempt: self.state.retry_count,
            result: OutcomeResult::Failed { error },
        }
    }

    /// Return a stuck batch to the queue. Used by the supervisory sweep for
    /// workers that crashed without emitting an outcome; the retry counter is
    /// not incremented because no failure was observed.
    pub fn requeue(self) -> Batch<Pending> {
        Batch {
            state: Pending {
                retry_count: self.state.retry_count,
            },
            data: self.data,
        }
    }
}

impl Batch<Failed> {
    /// Reset a failed batch for another attempt.
    pub fn retry(self) -> Batch<Pending> {
        Batch {
            state: Pending {
                retry_count: self.state.retry_count + 1,
            },
            data: self.data,
        }
    }
}

/// Exactly one outcome event per processing attempt, consumed by the progress
/// tracker. `attempt` makes application idempotent: an outcome only applies
/// while its batch is still processing the same attempt.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub session_id: SessionId,
    pub batch_number: u32,
    pub attempt: u32,
    pub result: OutcomeResult,
}

/// Result payload of a batch processing attempt.
#[derive(Debug, Clone)]
pub enum OutcomeResult {
    Succeeded {
        /// Elements created by this attempt, each with its generated tasks.
        elements: Vec<(Element, Vec<Task>)>,
        duplicates_skipped: u64,
        row_errors: Vec<RowError>,
    },
    Failed {
        error: String,
    },
}

/// Coarse batch state, for filtering and progress reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatusKind {
    Pending,
    Processing,
    Succeeded,
    Failed,
}

impl BatchStatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatusKind::Pending => "pending",
            BatchStatusKind::Processing => "processing",
            BatchStatusKind::Succeeded => "succeeded",
            BatchStatusKind::Failed => "failed",
        }
    }
}

impl std::fmt::Display for BatchStatusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enum that can hold a batch in any state, for storage and queries.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", content = "batch")]
pub enum AnyBatch {
    Pending(Batch<Pending>),
    Processing(Batch<Processing>),
    Succeeded(Batch<Succeeded>),
    Failed(Batch<Failed>),
}

impl AnyBatch {
    pub fn data(&self) -> &BatchData {
        match self {
            AnyBatch::Pending(b) => &b.data,
            AnyBatch::Processing(b) => &b.data,
            AnyBatch::Succeeded(b) => &b.data,
            AnyBatch::Failed(b) => &b.data,
        }
    }

    pub fn status_kind(&self) -> BatchStatusKind {
        match self {
            AnyBatch::Pending(_) => BatchStatusKind::Pending,
            AnyBatch::Processing(_) => BatchStatusKind::Processing,
            AnyBatch::Succeeded(_) => BatchStatusKind::Succeeded,
            AnyBatch::Failed(_) => BatchStatusKind::Failed,
        }
    }

    pub fn retry_count(&self) -> u32 {
        match self {
            AnyBatch::Pending(b) => b.state.retry_count,
            AnyBatch::Processing(b) => b.state.retry_count,
            AnyBatch::Succeeded(b) => b.state.retry_count,
            AnyBatch::Failed(b) => b.state.retry_count,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AnyBatch::Succeeded(_) | AnyBatch::Failed(_))
    }

    /// Per-batch detail row for the progress query.
    pub fn detail(&self) -> BatchDetail {
        let data = self.data();
        let mut detail = BatchDetail {
            batch_number: data.batch_number,
            start_row: data.start_row,
            end_row: data.end_row,
            status: self.status_kind(),
            retry_count: self.retry_count(),
            claimed_at: None,
            error: None,
            elements_created: 0,
            tasks_created: 0,
            duplicates_skipped: 0,
            row_errors: Vec::new(),
        };
        match self {
            AnyBatch::Processing(b) => detail.claimed_at = Some(b.state.claimed_at),
            AnyBatch::Succeeded(b) => {
                detail.elements_created = b.state.elements_created.len() as u64;
                detail.tasks_created = b.state.tasks_created.len() as u64;
                detail.duplicates_skipped = b.state.duplicates_skipped;
                detail.row_errors = b.state.row_errors.clone();
            }
            AnyBatch::Failed(b) => detail.error = Some(b.state.error.clone()),
            AnyBatch::Pending(_) => {}
        }
        detail
    }
}

impl From<Batch<Pending>> for AnyBatch {
    fn from(b: Batch<Pending>) -> Self {
        AnyBatch::Pending(b)
    }
}

impl From<Batch<Processing>> for AnyBatch {
    fn from(b: Batch<Processing>) -> Self {
        AnyBatch::Processing(b)
    }
}

impl From<Batch<Succeeded>> for AnyBatch {
    fn from(b: Batch<Succeeded>) -> Self {
        AnyBatch::Succeeded(b)
    }
}

impl From<Batch<Failed>> for AnyBatch {
    fn from(b: Batch<Failed>) -> Self {
        AnyBatch::Failed(b)
    }
}

/// Per-batch detail exposed by the progress query.
#[derive(Debug, Clone, Serialize)]
pub struct BatchDetail {
    pub batch_number: u32,
    pub start_row: u32,
    pub end_row: u32,
    pub status: BatchStatusKind,
    pub retry_count: u32,
    /// Set while processing; lets pollers spot batches stuck past the timeout.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Set for failed batches; always non-empty.
    pub error: Option<String>,
    pub elements_created: u64,
    pub tasks_created: u64,
    pub duplicates_skipped: u64,
    pub row_errors: Vec<RowError>,
}
