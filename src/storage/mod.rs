//! Persistence seam for sessions, batches, elements, and tasks.
//!
//! The [`Storage`] trait provides the transactional operations the pipeline
//! needs; the concrete persistence technology stays behind it. Claiming a
//! batch doubles as the work queue: workers pull `(session, batch_number)`
//! units with an atomic pending-to-processing flip, which delivers
//! at-least-once semantics without a separate scheduler.

use async_trait::async_trait;

use crate::domain::{
    Batch, BatchOutcome, Element, ElementId, NaturalKey, Processing, SessionId, SessionProgress,
    Task, TaskId, TaskStatus, UploadSession, WorkerId,
};
use crate::error::Result;
use crate::sequencer::OrderKey;

mod memory;

pub use memory::MemoryStore;

/// Storage trait for persisting and querying the ingestion state.
///
/// Every mutation is all-or-nothing within its scope: a batch outcome, a
/// scoped delete, or a sequencer reassignment is either fully visible or not
/// at all. Implementations must also make `apply_outcome` idempotent (keyed on
/// the outcome's attempt counter), so replaying an outcome never double-counts.
#[async_trait]
pub trait Storage: Send + Sync {
    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Persist a new upload session together with its pending batches.
    async fn create_session(
        &self,
        session: UploadSession,
        batches: Vec<Batch<crate::domain::Pending>>,
    ) -> Result<()>;

    /// Get a session by ID.
    async fn get_session(&self, id: SessionId) -> Result<UploadSession>;

    /// Point-in-time progress snapshot. Read-only; safe to poll at any rate.
    async fn session_progress(&self, id: SessionId) -> Result<SessionProgress>;

    /// Delete a session and everything created under it (batches, elements,
    /// tasks). Fails with `StillProcessing` if any batch is mid-flight.
    async fn delete_session(&self, id: SessionId) -> Result<()>;

    // ------------------------------------------------------------------
    // Batch lifecycle (queue + progress tracking)
    // ------------------------------------------------------------------

    /// Atomically claim up to `limit` pending batches for a worker, oldest
    /// sessions first, in batch-number order within a session.
    async fn claim_batches(
        &self,
        limit: usize,
        worker_id: WorkerId,
    ) -> Result<Vec<Batch<Processing>>>;

    /// Apply a batch outcome: flip the batch to its terminal state, commit the
    /// created elements and tasks, and update the session summary — all in one
    /// transaction. A replayed or stale outcome (batch no longer processing
    /// the same attempt) is silently ignored.
    async fn apply_outcome(&self, outcome: BatchOutcome) -> Result<()>;

    /// Reset one failed batch to pending, incrementing its retry counter.
    /// Fails with `StaleState` if the batch is not currently failed.
    async fn retry_batch(&self, session_id: SessionId, batch_number: u32) -> Result<()>;

    /// Reset every failed batch of a session to pending. Returns the number of
    /// batches re-queued.
    async fn retry_failed_batches(&self, session_id: SessionId) -> Result<u32>;

    /// Delete one finished batch and everything it created, reverting the
    /// session summary and decrementing `total_batches`. Fails with
    /// `StillProcessing` for a mid-flight batch and `StaleState` for a
    /// pending one.
    async fn delete_batch(&self, session_id: SessionId, batch_number: u32) -> Result<()>;

    /// Delete every failed batch of a session. Returns the number deleted.
    async fn delete_failed_batches(&self, session_id: SessionId) -> Result<u32>;

    /// Return batches stuck in processing for longer than `older_than` to
    /// pending, without incrementing their retry counters. Returns the
    /// re-queued `(session, batch_number)` pairs. Run by the supervisory
    /// sweep; a crashed worker's batch becomes claimable again.
    async fn requeue_stuck(&self, older_than: chrono::Duration)
        -> Result<Vec<(SessionId, u32)>>;

    // ------------------------------------------------------------------
    // Elements and tasks
    // ------------------------------------------------------------------

    /// Look up an element by its natural key (global, order-independent
    /// deduplication across batches and retries).
    async fn find_element(&self, key: &NaturalKey) -> Result<Option<ElementId>>;

    /// Get an element by ID.
    async fn get_element(&self, id: ElementId) -> Result<Element>;

    /// All tasks of an element, ascending by order key.
    async fn element_tasks(&self, element_id: ElementId) -> Result<Vec<Task>>;

    /// Insert a task, optionally applying a sequencer rebalance in the same
    /// transaction. Readers see either the pre- or post-rebalance ordering,
    /// never an interleaved one.
    async fn insert_task(
        &self,
        task: Task,
        reassign: Option<Vec<(TaskId, OrderKey)>>,
    ) -> Result<()>;

    /// Update a task's completion status.
    async fn set_task_status(&self, id: TaskId, status: TaskStatus) -> Result<()>;

    /// Delete a task. Siblings keep their order keys.
    async fn delete_task(&self, id: TaskId) -> Result<()>;
}
