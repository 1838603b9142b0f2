//! In-memory storage backend.
//!
//! A single `RwLock` over the whole state gives every mutation all-or-nothing
//! semantics within its scope: batch commits, scoped deletes, and sequencer
//! reassignments happen entirely under one write guard. Workers hold no lock
//! while processing rows, so progress queries stay servable while batches are
//! mid-flight.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::domain::{
    AnyBatch, Batch, BatchOutcome, BatchStatusKind, Element, ElementId, Failed, NaturalKey,
    OutcomeResult, Pending, Processing, SessionId, SessionProgress, SessionStatus, Succeeded,
    Task, TaskId, TaskStatus, UploadSession, WorkerId,
};
use crate::error::{GirderError, Result};
use crate::sequencer::OrderKey;

use super::Storage;

#[derive(Default)]
struct State {
    sessions: HashMap<SessionId, UploadSession>,
    batches: HashMap<SessionId, BTreeMap<u32, AnyBatch>>,
    elements: HashMap<ElementId, Element>,
    elements_by_key: HashMap<NaturalKey, ElementId>,
    tasks: HashMap<TaskId, Task>,
    tasks_by_element: HashMap<ElementId, Vec<TaskId>>,
}

/// In-memory [`Storage`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn recompute_status(state: &mut State, session_id: SessionId) {
    let kinds: Vec<BatchStatusKind> = state
        .batches
        .get(&session_id)
        .map(|batches| batches.values().map(|b| b.status_kind()).collect())
        .unwrap_or_default();
    if let Some(session) = state.sessions.get_mut(&session_id) {
        // Fail-fast sessions have no batches; their status is already Failed
        // and must not be derived away.
        if !kinds.is_empty() || !matches!(session.status, SessionStatus::Failed) {
            session.status = SessionStatus::derive(kinds);
        }
    }
}

fn remove_element_cascade(state: &mut State, id: ElementId) {
    if let Some(element) = state.elements.remove(&id) {
        state.elements_by_key.remove(&element.natural_key);
        if let Some(task_ids) = state.tasks_by_element.remove(&id) {
            for task_id in task_ids {
                state.tasks.remove(&task_id);
            }
        }
    }
}

/// Delete one finished batch under an already-held write guard.
fn delete_batch_locked(state: &mut State, session_id: SessionId, batch_number: u32) -> Result<()> {
    let batches = state
        .batches
        .get_mut(&session_id)
        .ok_or(GirderError::SessionNotFound(session_id))?;
    match batches.get(&batch_number) {
        None => return Err(GirderError::BatchNotFound(session_id, batch_number)),
        Some(AnyBatch::Processing(_)) => {
            return Err(GirderError::StillProcessing(session_id, batch_number))
        }
        Some(AnyBatch::Pending(_)) => {
            return Err(GirderError::StaleState(
                session_id,
                batch_number,
                BatchStatusKind::Pending.to_string(),
                "succeeded or failed".to_string(),
            ))
        }
        Some(_) => {}
    }
    let Some(removed) = batches.remove(&batch_number) else {
        return Err(GirderError::BatchNotFound(session_id, batch_number));
    };

    if let AnyBatch::Succeeded(batch) = &removed {
        for element_id in &batch.state.elements_created {
            remove_element_cascade(state, *element_id);
        }
    }

    let session = state
        .sessions
        .get_mut(&session_id)
        .ok_or(GirderError::SessionNotFound(session_id))?;
    match &removed {
        AnyBatch::Succeeded(batch) => {
            session.summary.successful_batches -= 1;
            session.summary.total_elements_created -= batch.state.elements_created.len() as u64;
            session.summary.total_tasks_created -= batch.state.tasks_created.len() as u64;
            session.summary.duplicates_skipped -= batch.state.duplicates_skipped;
        }
        AnyBatch::Failed(_) => session.summary.failed_batches -= 1,
        _ => {}
    }
    session.total_batches -= 1;

    recompute_status(state, session_id);
    tracing::info!(
        session_id = %session_id,
        batch_number,
        "Deleted batch and its artifacts"
    );
    Ok(())
}

#[async_trait]
impl Storage for MemoryStore {
    async fn create_session(
        &self,
        session: UploadSession,
        batches: Vec<Batch<Pending>>,
    ) -> Result<()> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let session_id = session.id;
        let map: BTreeMap<u32, AnyBatch> = batches
            .into_iter()
            .map(|b| (b.data.batch_number, AnyBatch::Pending(b)))
            .collect();
        state.batches.insert(session_id, map);
        state.sessions.insert(session_id, session);
        Ok(())
    }

    async fn get_session(&self, id: SessionId) -> Result<UploadSession> {
        let guard = self.state.read().await;
        guard
            .sessions
            .get(&id)
            .cloned()
            .ok_or(GirderError::SessionNotFound(id))
    }

    async fn session_progress(&self, id: SessionId) -> Result<SessionProgress> {
        let guard = self.state.read().await;
        let session = guard
            .sessions
            .get(&id)
            .ok_or(GirderError::SessionNotFound(id))?;
        let batches: Vec<_> = guard
            .batches
            .get(&id)
            .map(|m| m.values().map(|b| b.detail()).collect())
            .unwrap_or_default();
        let row_errors = batches
            .iter()
            .flat_map(|detail| detail.row_errors.iter().cloned())
            .collect();
        Ok(SessionProgress {
            session_id: id,
            file_name: session.file_name.clone(),
            status: session.status,
            total_batches: session.total_batches,
            summary: session.summary.clone(),
            row_errors,
            batches,
        })
    }

    async fn delete_session(&self, id: SessionId) -> Result<()> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if !state.sessions.contains_key(&id) {
            return Err(GirderError::SessionNotFound(id));
        }
        if let Some(batches) = state.batches.get(&id) {
            for batch in batches.values() {
                if let AnyBatch::Processing(b) = batch {
                    return Err(GirderError::StillProcessing(id, b.data.batch_number));
                }
            }
        }

        let element_ids: Vec<ElementId> = state
            .batches
            .get(&id)
            .map(|batches| {
                batches
                    .values()
                    .filter_map(|b| match b {
                        AnyBatch::Succeeded(b) => Some(b.state.elements_created.clone()),
                        _ => None,
                    })
                    .flatten()
                    .collect()
            })
            .unwrap_or_default();
        for element_id in element_ids {
            remove_element_cascade(state, element_id);
        }
        state.batches.remove(&id);
        state.sessions.remove(&id);
        tracing::info!(session_id = %id, "Deleted session and all artifacts");
        Ok(())
    }

    async fn claim_batches(
        &self,
        limit: usize,
        worker_id: WorkerId,
    ) -> Result<Vec<Batch<Processing>>> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        // Oldest sessions first, batch-number order within a session.
        let mut session_order: Vec<(chrono::DateTime<Utc>, SessionId)> = state
            .sessions
            .values()
            .map(|s| (s.created_at, s.id))
            .collect();
        session_order.sort_by_key(|(created_at, _)| *created_at);

        let mut claimed = Vec::new();
        let mut touched = Vec::new();
        'sessions: for (_, session_id) in session_order {
            let Some(batches) = state.batches.get_mut(&session_id) else {
                continue;
            };
            let pending_numbers: Vec<u32> = batches
                .iter()
                .filter(|(_, b)| matches!(b, AnyBatch::Pending(_)))
                .map(|(n, _)| *n)
                .collect();
            for number in pending_numbers {
                if claimed.len() >= limit {
                    break 'sessions;
                }
                match batches.remove(&number) {
                    Some(AnyBatch::Pending(batch)) => {
                        let processing = batch.claim(worker_id);
                        batches.insert(number, AnyBatch::Processing(processing.clone()));
                        claimed.push(processing);
                        touched.push(session_id);
                    }
                    Some(other) => {
                        batches.insert(number, other);
                    }
                    None => {}
                }
            }
        }

        touched.dedup();
        for session_id in touched {
            recompute_status(state, session_id);
        }
        if !claimed.is_empty() {
            tracing::debug!(worker_id = %worker_id, count = claimed.len(), "Claimed batches");
        }
        Ok(claimed)
    }

    async fn apply_outcome(&self, outcome: BatchOutcome) -> Result<()> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let batches = state
            .batches
            .get(&outcome.session_id)
            .ok_or(GirderError::SessionNotFound(outcome.session_id))?;
        let current = batches
            .get(&outcome.batch_number)
            .ok_or(GirderError::BatchNotFound(
                outcome.session_id,
                outcome.batch_number,
            ))?;
        let (data, attempt) = match current {
            AnyBatch::Processing(b) if b.state.retry_count == outcome.attempt => {
                (b.data.clone(), b.state.retry_count)
            }
            other => {
                // Replay of an already-applied outcome, or a late outcome from
                // a worker whose batch was swept back to pending and re-claimed.
                tracing::debug!(
                    session_id = %outcome.session_id,
                    batch_number = outcome.batch_number,
                    state = %other.status_kind(),
                    attempt = outcome.attempt,
                    "Ignoring replayed or stale batch outcome"
                );
                return Ok(());
            }
        };

        match outcome.result {
            OutcomeResult::Succeeded {
                elements,
                duplicates_skipped,
                row_errors,
            } => {
                let mut elements_created = Vec::new();
                let mut tasks_created = Vec::new();
                let mut duplicates = duplicates_skipped;
                for (element, tasks) in elements {
                    // Commit-time dedup: a concurrent batch may have committed
                    // the same natural key since this batch's pre-check.
                    if state.elements_by_key.contains_key(&element.natural_key) {
                        duplicates += 1;
                        continue;
                    }
                    state
                        .elements_by_key
                        .insert(element.natural_key.clone(), element.id);
                    let task_ids: Vec<TaskId> = tasks.iter().map(|t| t.id).collect();
                    for task in tasks {
                        state.tasks.insert(task.id, task);
                    }
                    state.tasks_by_element.insert(element.id, task_ids.clone());
                    tasks_created.extend(task_ids);
                    elements_created.push(element.id);
                    state.elements.insert(element.id, element);
                }

                let succeeded = Batch {
                    data,
                    state: Succeeded {
                        completed_at: Utc::now(),
                        retry_count: attempt,
                        elements_created: elements_created.clone(),
                        tasks_created: tasks_created.clone(),
                        duplicates_skipped: duplicates,
                        row_errors,
                    },
                };
                if let Some(batches) = state.batches.get_mut(&outcome.session_id) {
                    batches.insert(outcome.batch_number, succeeded.into());
                }
                if let Some(session) = state.sessions.get_mut(&outcome.session_id) {
                    session.summary.successful_batches += 1;
                    session.summary.total_elements_created += elements_created.len() as u64;
                    session.summary.total_tasks_created += tasks_created.len() as u64;
                    session.summary.duplicates_skipped += duplicates;
                }
                tracing::info!(
                    session_id = %outcome.session_id,
                    batch_number = outcome.batch_number,
                    elements = elements_created.len(),
                    tasks = tasks_created.len(),
                    duplicates,
                    "Batch succeeded"
                );
            }
            OutcomeResult::Failed { error } => {
                let failed = Batch {
                    data,
                    state: Failed {
                        failed_at: Utc::now(),
                        retry_count: attempt,
                        error: error.clone(),
                    },
                };
                if let Some(batches) = state.batches.get_mut(&outcome.session_id) {
                    batches.insert(outcome.batch_number, failed.into());
                }
                if let Some(session) = state.sessions.get_mut(&outcome.session_id) {
                    session.summary.failed_batches += 1;
                }
                tracing::warn!(
                    session_id = %outcome.session_id,
                    batch_number = outcome.batch_number,
                    error = %error,
                    "Batch failed"
                );
            }
        }

        recompute_status(state, outcome.session_id);
        Ok(())
    }

    async fn retry_batch(&self, session_id: SessionId, batch_number: u32) -> Result<()> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let batches = state
            .batches
            .get_mut(&session_id)
            .ok_or(GirderError::SessionNotFound(session_id))?;
        match batches.get(&batch_number) {
            None => return Err(GirderError::BatchNotFound(session_id, batch_number)),
            Some(AnyBatch::Failed(_)) => {}
            Some(other) => {
                return Err(GirderError::StaleState(
                    session_id,
                    batch_number,
                    other.status_kind().to_string(),
                    BatchStatusKind::Failed.to_string(),
                ))
            }
        }
        if let Some(AnyBatch::Failed(batch)) = batches.remove(&batch_number) {
            batches.insert(batch_number, AnyBatch::Pending(batch.retry()));
        }
        if let Some(session) = state.sessions.get_mut(&session_id) {
            session.summary.failed_batches -= 1;
            session.status = SessionStatus::InProgress;
        }
        tracing::info!(session_id = %session_id, batch_number, "Batch re-queued for retry");
        Ok(())
    }

    async fn retry_failed_batches(&self, session_id: SessionId) -> Result<u32> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let batches = state
            .batches
            .get_mut(&session_id)
            .ok_or(GirderError::SessionNotFound(session_id))?;
        let failed_numbers: Vec<u32> = batches
            .iter()
            .filter(|(_, b)| matches!(b, AnyBatch::Failed(_)))
            .map(|(n, _)| *n)
            .collect();
        for number in &failed_numbers {
            if let Some(AnyBatch::Failed(batch)) = batches.remove(number) {
                batches.insert(*number, AnyBatch::Pending(batch.retry()));
            }
        }
        let count = failed_numbers.len() as u32;
        if count > 0 {
            if let Some(session) = state.sessions.get_mut(&session_id) {
                session.summary.failed_batches -= count;
                session.status = SessionStatus::InProgress;
            }
            tracing::info!(session_id = %session_id, count, "Re-queued all failed batches");
        }
        Ok(count)
    }

    async fn delete_batch(&self, session_id: SessionId, batch_number: u32) -> Result<()> {
        let mut guard = self.state.write().await;
        delete_batch_locked(&mut guard, session_id, batch_number)
    }

    async fn delete_failed_batches(&self, session_id: SessionId) -> Result<u32> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let failed_numbers: Vec<u32> = state
            .batches
            .get(&session_id)
            .ok_or(GirderError::SessionNotFound(session_id))?
            .iter()
            .filter(|(_, b)| matches!(b, AnyBatch::Failed(_)))
            .map(|(n, _)| *n)
            .collect();
        for number in &failed_numbers {
            delete_batch_locked(state, session_id, *number)?;
        }
        Ok(failed_numbers.len() as u32)
    }

    async fn requeue_stuck(
        &self,
        older_than: chrono::Duration,
    ) -> Result<Vec<(SessionId, u32)>> {
        let cutoff = Utc::now() - older_than;
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let mut requeued = Vec::new();
        let session_ids: Vec<SessionId> = state.batches.keys().copied().collect();
        for session_id in session_ids {
            let Some(batches) = state.batches.get_mut(&session_id) else {
                continue;
            };
            let stuck: Vec<u32> = batches
                .iter()
                .filter(|(_, b)| {
                    matches!(b, AnyBatch::Processing(p) if p.state.claimed_at < cutoff)
                })
                .map(|(n, _)| *n)
                .collect();
            for number in stuck {
                match batches.remove(&number) {
                    Some(AnyBatch::Processing(batch)) => {
                        batches.insert(number, AnyBatch::Pending(batch.requeue()));
                        requeued.push((session_id, number));
                    }
                    Some(other) => {
                        batches.insert(number, other);
                    }
                    None => {}
                }
            }
        }
        let touched: Vec<SessionId> = requeued.iter().map(|(s, _)| *s).collect();
        for session_id in touched {
            recompute_status(state, session_id);
        }
        Ok(requeued)
    }

    async fn find_element(&self, key: &NaturalKey) -> Result<Option<ElementId>> {
        let guard = self.state.read().await;
        Ok(guard.elements_by_key.get(key).copied())
    }

    async fn get_element(&self, id: ElementId) -> Result<Element> {
        let guard = self.state.read().await;
        guard
            .elements
            .get(&id)
            .cloned()
            .ok_or(GirderError::ElementNotFound(id))
    }

    async fn element_tasks(&self, element_id: ElementId) -> Result<Vec<Task>> {
        let guard = self.state.read().await;
        if !guard.elements.contains_key(&element_id) {
            return Err(GirderError::ElementNotFound(element_id));
        }
        let mut tasks: Vec<Task> = guard
            .tasks_by_element
            .get(&element_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| guard.tasks.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        tasks.sort_by_key(|t| t.order_key);
        Ok(tasks)
    }

    async fn insert_task(
        &self,
        task: Task,
        reassign: Option<Vec<(TaskId, OrderKey)>>,
    ) -> Result<()> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if !state.elements.contains_key(&task.element_id) {
            return Err(GirderError::ElementNotFound(task.element_id));
        }
        if let Some(reassignments) = &reassign {
            // Validate everything before touching anything, so the rebalance
            // plus insertion stays all-or-nothing.
            for (task_id, _) in reassignments {
                if !state.tasks.contains_key(task_id) {
                    return Err(GirderError::TaskNotFound(*task_id));
                }
            }
            for (task_id, key) in reassignments {
                if let Some(existing) = state.tasks.get_mut(task_id) {
                    existing.order_key = *key;
                }
            }
        }
        state
            .tasks_by_element
            .entry(task.element_id)
            .or_default()
            .push(task.id);
        state.tasks.insert(task.id, task);
        Ok(())
    }

    async fn set_task_status(&self, id: TaskId, status: TaskStatus) -> Result<()> {
        let mut guard = self.state.write().await;
        let task = guard
            .tasks
            .get_mut(&id)
            .ok_or(GirderError::TaskNotFound(id))?;
        task.status = status;
        Ok(())
    }

    async fn delete_task(&self, id: TaskId) -> Result<()> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let task = state.tasks.remove(&id).ok_or(GirderError::TaskNotFound(id))?;
        if let Some(ids) = state.tasks_by_element.get_mut(&task.element_id) {
            ids.retain(|task_id| *task_id != id);
        }
        Ok(())
    }
}
