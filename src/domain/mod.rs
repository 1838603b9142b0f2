//! Domain records for upload sessions, batches, elements, and tasks.

pub mod batch;
pub mod element;
pub mod session;
pub mod task;

pub use batch::{
    AnyBatch, Batch, BatchData, BatchDetail, BatchOutcome, BatchState, BatchStatusKind, Failed,
    OutcomeResult, Pending, Processing, RowError, Succeeded, WorkerId,
};
pub use element::{Element, ElementId, NaturalKey, ProjectId};
pub use session::{SessionId, SessionProgress, SessionStatus, SessionSummary, UploadSession};
pub use task::{ElementStatus, Task, TaskId, TaskStatus};
