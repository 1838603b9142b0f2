//! Batch processing: row validation, deduplication, element and task creation.
//!
//! A worker re-reads its row range from the source on every attempt, validates
//! each row, resolves workflow labels against the catalog, and builds the
//! elements and auto-generated tasks for the batch's outcome event. Nothing is
//! persisted here; the storage layer commits the whole outcome atomically.

use std::collections::HashSet;

use chrono::Utc;
use metrics::counter;
use uuid::Uuid;

use crate::domain::{
    Batch, BatchOutcome, Element, ElementId, NaturalKey, Processing, RowError, Task, TaskId,
    TaskStatus,
};
use crate::error::Result;
use crate::rows::{RegisterRow, RowSource};
use crate::sequencer::Sequencer;
use crate::storage::Storage;
use crate::workflow::WorkflowKind;

struct BatchReport {
    elements: Vec<(Element, Vec<Task>)>,
    duplicates_skipped: u64,
    row_errors: Vec<RowError>,
}

/// Process one claimed batch to its outcome event.
///
/// Row-level problems (missing identifiers, unknown workflow labels) are
/// collected into the outcome as data; only a processing-level failure, such
/// as an unreadable row range, fails the batch.
#[tracing::instrument(
    skip(storage, rows, batch),
    fields(session_id = %batch.data.session_id, batch_number = batch.data.batch_number)
)]
pub async fn process_batch<S: Storage, R: RowSource>(
    storage: &S,
    rows: &R,
    batch: Batch<Processing>,
) -> BatchOutcome {
    match process_rows(storage, rows, &batch).await {
        Ok(report) => {
            counter!("girder_rows_rejected_total").increment(report.row_errors.len() as u64);
            counter!("girder_elements_created_total").increment(report.elements.len() as u64);
            tracing::info!(
                elements = report.elements.len(),
                duplicates = report.duplicates_skipped,
                row_errors = report.row_errors.len(),
                "Batch processed"
            );
            batch.succeed(report.elements, report.duplicates_skipped, report.row_errors)
        }
        Err(e) => {
            tracing::error!(error = %e, "Batch processing failed");
            batch.fail(e.to_string())
        }
    }
}

async fn process_rows<S: Storage, R: RowSource>(
    storage: &S,
    rows: &R,
    batch: &Batch<Processing>,
) -> Result<BatchReport> {
    let session = storage.get_session(batch.data.session_id).await?;
    let fetched = rows
        .fetch_rows(&session.file, batch.data.start_row, batch.data.end_row)
        .await?;

    let mut report = BatchReport {
        elements: Vec::new(),
        duplicates_skipped: 0,
        row_errors: Vec::new(),
    };

    // Rows are processed in file order so that two colliding rows within the
    // same batch deduplicate deterministically (first occurrence wins).
    let mut seen: HashSet<NaturalKey> = HashSet::new();
    for row in fetched {
        let workflow = match validate_row(&row) {
            Ok(workflow) => workflow,
            Err(row_error) => {
                report.row_errors.push(row_error);
                continue;
            }
        };

        let key = NaturalKey::new(session.project_id, &row.structure_number, &row.drawing_number);
        if seen.contains(&key) || storage.find_element(&key).await?.is_some() {
            report.duplicates_skipped += 1;
            continue;
        }
        seen.insert(key.clone());

        let element_id = ElementId::from(Uuid::new_v4());
        let tasks = workflow
            .map(|kind| workflow_tasks(element_id, kind))
            .unwrap_or_default();
        let element = Element {
            id: element_id,
            project_id: session.project_id,
            natural_key: key,
            structure_number: row.structure_number.trim().to_string(),
            drawing_number: row.drawing_number.trim().to_string(),
            description: row.description,
            material: row.material,
            created_at: Utc::now(),
        };
        report.elements.push((element, tasks));
    }

    Ok(report)
}

/// Validate one register row, resolving its workflow label if present.
fn validate_row(row: &RegisterRow) -> std::result::Result<Option<WorkflowKind>, RowError> {
    if row.structure_number.trim().is_empty() {
        return Err(RowError {
            row: row.row_number,
            message: "missing structure number".to_string(),
        });
    }
    if row.drawing_number.trim().is_empty() {
        return Err(RowError {
            row: row.row_number,
            message: "missing drawing number".to_string(),
        });
    }
    match &row.workflow {
        Some(label) => match WorkflowKind::from_label(label) {
            Some(kind) => Ok(Some(kind)),
            None => Err(RowError {
                row: row.row_number,
                message: format!("unknown workflow '{}'", label.trim()),
            }),
        },
        None => Ok(None),
    }
}

/// The workflow's full task list with evenly spaced order keys. Keys come from
/// the sequencer so later interactive insertions compose with bulk creation.
fn workflow_tasks(element_id: ElementId, kind: WorkflowKind) -> Vec<Task> {
    let titles = kind.task_titles();
    let keys = Sequencer::initial_keys(titles.len());
    titles
        .iter()
        .zip(keys)
        .map(|(title, order_key)| Task {
            id: TaskId::from(Uuid::new_v4()),
            element_id,
            title: (*title).to_string(),
            status: TaskStatus::Pending,
            order_key,
            workflow: Some(kind),
            created_at: Utc::now(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_identifiers_are_row_errors() {
        let row = RegisterRow::new(7, "  ", "DWG-1");
        let err = validate_row(&row).unwrap_err();
        assert_eq!(err.row, 7);
        assert!(err.message.contains("structure number"));

        let row = RegisterRow::new(8, "B-1", "");
        let err = validate_row(&row).unwrap_err();
        assert!(err.message.contains("drawing number"));
    }

    #[test]
    fn unknown_workflow_label_is_a_row_error() {
        let row = RegisterRow::new(3, "B-1", "DWG-1").with_workflow("galvanizing");
        let err = validate_row(&row).unwrap_err();
        assert!(err.message.contains("galvanizing"));
    }

    #[test]
    fn row_without_workflow_is_valid() {
        let row = RegisterRow::new(1, "B-1", "DWG-1");
        assert_eq!(validate_row(&row).unwrap(), None);
    }

    #[test]
    fn workflow_tasks_are_ordered_and_pending() {
        let element_id = ElementId::from(Uuid::new_v4());
        let tasks = workflow_tasks(element_id, WorkflowKind::Erection);
        assert_eq!(tasks.len(), WorkflowKind::Erection.task_titles().len());
        assert!(tasks.windows(2).all(|w| w[0].order_key < w[1].order_key));
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Pending));
        assert_eq!(tasks[0].title, "Delivery inspection");
    }
}
