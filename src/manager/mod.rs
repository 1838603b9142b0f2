//! The exposed operation surface of the ingestion system.
//!
//! [`IngestManager`] covers upload-session creation (partitioning), the
//! poll-safe progress query, retry and cleanup of batches, interactive task
//! insertion through the sequencer, and the derived element status. The
//! background processing itself runs in [`crate::daemon::Daemon`]; manager and
//! daemon share the same storage.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{
    Batch, BatchData, ElementId, ElementStatus, Pending, ProjectId, SessionId, SessionProgress,
    SessionStatus, SessionSummary, Task, TaskId, TaskStatus, UploadSession,
};
use crate::error::{GirderError, Result};
use crate::rows::{FileRef, RowSource};
use crate::sequencer::{Placement, Sequencer};
use crate::storage::Storage;

/// Where to place an interactively inserted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionHint {
    /// Before every existing task.
    Start,
    /// After every existing task.
    End,
    /// Directly after the named task.
    After(TaskId),
}

/// Configuration for upload partitioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Rows per batch.
    pub batch_size: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self { batch_size: 200 }
    }
}

/// Entry point for everything callers do to the ingestion system.
pub struct IngestManager<S, R> {
    storage: Arc<S>,
    rows: Arc<R>,
    config: IngestConfig,
    /// Per-element locks serializing interactive insertions and rebalances.
    /// Different elements are fully independent.
    element_locks: dashmap::DashMap<ElementId, Arc<tokio::sync::Mutex<()>>>,
}

impl<S, R> IngestManager<S, R>
where
    S: Storage,
    R: RowSource,
{
    pub fn new(storage: Arc<S>, rows: Arc<R>) -> Self {
        Self::with_config(storage, rows, IngestConfig::default())
    }

    pub fn with_config(storage: Arc<S>, rows: Arc<R>, config: IngestConfig) -> Self {
        Self {
            storage,
            rows,
            config,
            element_locks: dashmap::DashMap::new(),
        }
    }

    /// Partition an uploaded register into batches and queue them.
    ///
    /// Fails fast — before any batch exists — if the file is unreadable or has
    /// zero data rows; a `Failed` session with no batches is recorded so the
    /// attempt stays visible, and the error is surfaced to the caller
    /// immediately rather than via polling.
    #[tracing::instrument(skip(self), fields(file = %file, project_id = %project_id))]
    pub async fn create_upload_session(
        &self,
        file: FileRef,
        file_name: String,
        project_id: ProjectId,
    ) -> Result<SessionId> {
        let row_count = match self.rows.row_count(&file).await {
            Ok(count) => count,
            Err(e) => {
                self.record_failed_session(file, file_name, project_id).await;
                return Err(e);
            }
        };
        if row_count == 0 {
            let name = file.0.clone();
            self.record_failed_session(file, file_name, project_id).await;
            return Err(GirderError::EmptyFile(name));
        }

        let batch_size = self.config.batch_size.max(1);
        let total_batches = row_count.div_ceil(batch_size);
        let session_id = SessionId::from(Uuid::new_v4());

        let batches: Vec<Batch<Pending>> = (1..=total_batches)
            .map(|number| Batch {
                state: Pending { retry_count: 0 },
                data: BatchData {
                    session_id,
                    batch_number: number,
                    start_row: (number - 1) * batch_size + 1,
                    end_row: (number * batch_size).min(row_count),
                },
            })
            .collect();

        let session = UploadSession {
            id: session_id,
            project_id,
            file,
            file_name,
            total_batches,
            status: SessionStatus::Queued,
            summary: SessionSummary::default(),
            created_at: Utc::now(),
        };
        self.storage.create_session(session, batches).await?;

        tracing::info!(
            session_id = %session_id,
            rows = row_count,
            total_batches,
            "Upload session created"
        );
        Ok(session_id)
    }

    /// Record a zero-batch `Failed` session for an upload that could not be
    /// partitioned. Best effort; the partitioning error wins over any storage
    /// failure here.
    async fn record_failed_session(&self, file: FileRef, file_name: String, project_id: ProjectId) {
        let session = UploadSession {
            id: SessionId::from(Uuid::new_v4()),
            project_id,
            file,
            file_name,
            total_batches: 0,
            status: SessionStatus::Failed,
            summary: SessionSummary::default(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.storage.create_session(session, Vec::new()).await {
            tracing::error!(error = %e, "Failed to record fail-fast session");
        }
    }

    /// Current summary plus per-batch detail. Read-only, safe to poll at any
    /// rate; mutation happens only through the explicit operations below.
    pub async fn session_progress(&self, session_id: SessionId) -> Result<SessionProgress> {
        self.storage.session_progress(session_id).await
    }

    /// Re-queue every failed batch of a session. Returns how many were
    /// re-queued. Safe to invoke more than once.
    #[tracing::instrument(skip(self), fields(session_id = %session_id))]
    pub async fn retry_failed_batches(&self, session_id: SessionId) -> Result<u32> {
        self.storage.retry_failed_batches(session_id).await
    }

    /// Re-queue one failed batch.
    #[tracing::instrument(skip(self), fields(session_id = %session_id, batch_number))]
    pub async fn retry_batch(&self, session_id: SessionId, batch_number: u32) -> Result<()> {
        self.storage.retry_batch(session_id, batch_number).await
    }

    /// Delete one finished batch and everything it created.
    #[tracing::instrument(skip(self), fields(session_id = %session_id, batch_number))]
    pub async fn delete_batch(&self, session_id: SessionId, batch_number: u32) -> Result<()> {
        self.storage.delete_batch(session_id, batch_number).await
    }

    /// Delete every failed batch of a session. Returns how many were deleted.
    #[tracing::instrument(skip(self), fields(session_id = %session_id))]
    pub async fn delete_failed_batches(&self, session_id: SessionId) -> Result<u32> {
        self.storage.delete_failed_batches(session_id).await
    }

    /// Delete the session and everything created under it. Irreversible.
    #[tracing::instrument(skip(self), fields(session_id = %session_id))]
    pub async fn delete_session(&self, session_id: SessionId) -> Result<()> {
        self.storage.delete_session(session_id).await
    }

    /// Insert a custom task at an arbitrary position in an element's list.
    ///
    /// Key assignment goes through the sequencer; if the gap at the insertion
    /// point is exhausted, the whole list is rebalanced and the insertion is
    /// committed atomically with the reassignment. The per-element lock makes
    /// rebalancing mutually exclusive with other insertions on the same
    /// element; other elements are unaffected.
    #[tracing::instrument(skip(self, title), fields(element_id = %element_id))]
    pub async fn insert_task(
        &self,
        element_id: ElementId,
        title: String,
        position: PositionHint,
    ) -> Result<Task> {
        let lock = self.element_lock(element_id);
        let _guard = lock.lock().await;

        let tasks = self.storage.element_tasks(element_id).await?;
        let keys: Vec<_> = tasks.iter().map(|t| t.order_key).collect();
        let index = match position {
            PositionHint::Start => 0,
            PositionHint::End => keys.len(),
            PositionHint::After(task_id) => {
                tasks
                    .iter()
                    .position(|t| t.id == task_id)
                    .ok_or(GirderError::TaskNotFound(task_id))?
                    + 1
            }
        };

        let placement = Sequencer::insert_at(&keys, index);
        let (order_key, reassign) = match placement {
            Placement::Key(key) => (key, None),
            Placement::Rebalanced {
                reassigned,
                new_key,
            } => {
                tracing::debug!(
                    element_id = %element_id,
                    tasks = tasks.len(),
                    "Rebalancing order keys before insertion"
                );
                let plan = tasks
                    .iter()
                    .map(|t| t.id)
                    .zip(reassigned)
                    .collect::<Vec<_>>();
                (new_key, Some(plan))
            }
        };

        let task = Task {
            id: TaskId::from(Uuid::new_v4()),
            element_id,
            title,
            status: TaskStatus::Pending,
            order_key,
            workflow: None,
            created_at: Utc::now(),
        };
        self.storage.insert_task(task.clone(), reassign).await?;
        Ok(task)
    }

    /// Overall status of an element, derived from its current task set.
    pub async fn element_status(&self, element_id: ElementId) -> Result<ElementStatus> {
        let tasks = self.storage.element_tasks(element_id).await?;
        Ok(ElementStatus::from_tasks(tasks.iter().map(|t| &t.status)))
    }

    fn element_lock(&self, element_id: ElementId) -> Arc<tokio::sync::Mutex<()>> {
        self.element_locks
            .entry(element_id)
            .or_default()
            .clone()
    }
}
