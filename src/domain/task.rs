//! Follow-up tasks and the derived element status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sequencer::OrderKey;
use crate::workflow::WorkflowKind;

use super::element::ElementId;

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl From<Uuid> for TaskId {
    fn from(uuid: Uuid) -> Self {
        TaskId(uuid)
    }
}

impl std::ops::Deref for TaskId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Completion state of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Completed,
    NotApplicable,
}

/// One unit of follow-up work for an element.
///
/// Tasks are bulk-created by the batch worker (a workflow's full list, with
/// evenly spaced order keys) or inserted interactively at an arbitrary
/// position. Deleting a task never renumbers its siblings: order keys are
/// independent of list position.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub element_id: ElementId,
    pub title: String,
    pub status: TaskStatus,
    pub order_key: OrderKey,
    pub workflow: Option<WorkflowKind>,
    pub created_at: DateTime<Utc>,
}

/// Overall status of an element, derived from its current task set.
///
/// Never stored; recomputed from tasks on every query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementStatus {
    /// The element has no tasks at all.
    NoJobs,
    /// At least one task is still pending and none is blocked.
    Active,
    /// Every task is completed.
    Complete,
    /// At least one task is not applicable. Dominates `Complete`: a blocked
    /// task keeps the element from clearing even if every other task is done.
    NonClearance,
}

impl ElementStatus {
    /// Derive the element status from its task statuses.
    ///
    /// The check order is significant: `not_applicable` is inspected before
    /// completion so that a blocked task dominates a finished one.
    pub fn from_tasks<'a, I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = &'a TaskStatus>,
    {
        let mut any = false;
        let mut any_not_applicable = false;
        let mut all_completed = true;

        for status in statuses {
            any = true;
            match status {
                TaskStatus::NotApplicable => any_not_applicable = true,
                TaskStatus::Completed => {}
                TaskStatus::Pending => all_completed = false,
            }
        }

        if !any {
            ElementStatus::NoJobs
        } else if any_not_applicable {
            ElementStatus::NonClearance
        } else if all_completed {
            ElementStatus::Complete
        } else {
            ElementStatus::Active
        }
    }
}
