//! End-to-end tests for the ingestion pipeline: upload partitioning, daemon
//! processing, partial failure and retry, cleanup, and interactive task
//! insertion, all against the in-memory store and the mock row source.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use girder::{
    Daemon, DaemonConfig, ElementStatus, FileRef, GirderError, IngestConfig, IngestManager,
    MemoryStore, MockRowSource, NaturalKey, PositionHint, ProjectId, RegisterRow, SessionId,
    SessionProgress, SessionStatus, Storage, TaskStatus, WorkerId, WorkflowKind,
};

fn harness() -> (
    Arc<MemoryStore>,
    Arc<MockRowSource>,
    IngestManager<MemoryStore, MockRowSource>,
) {
    let storage = Arc::new(MemoryStore::new());
    let rows = Arc::new(MockRowSource::new());
    let manager = IngestManager::with_config(
        storage.clone(),
        rows.clone(),
        IngestConfig { batch_size: 2 },
    );
    (storage, rows, manager)
}

fn spawn_daemon(
    storage: Arc<MemoryStore>,
    rows: Arc<MockRowSource>,
) -> (
    CancellationToken,
    tokio::task::JoinHandle<girder::Result<()>>,
) {
    let token = CancellationToken::new();
    let config = DaemonConfig {
        claim_batch_size: 4,
        claim_interval_ms: 10,
        worker_concurrency: 4,
        processing_timeout_ms: 60_000,
        sweep_interval_ms: 60_000,
        status_log_interval_ms: None,
    };
    let daemon = Arc::new(Daemon::new(storage, rows, config, token.clone()));
    let handle = daemon.start();
    (token, handle)
}

async fn wait_for_terminal(
    manager: &IngestManager<MemoryStore, MockRowSource>,
    session_id: SessionId,
) -> SessionProgress {
    for _ in 0..500 {
        let progress = manager.session_progress(session_id).await.unwrap();
        if progress.status.is_terminal() {
            return progress;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session {session_id} did not reach a terminal status");
}

#[test_log::test(tokio::test)]
async fn full_upload_creates_elements_and_workflow_tasks() {
    let (storage, rows, manager) = harness();
    let file = FileRef::from("register.xlsx");
    let project = ProjectId::from(uuid::Uuid::new_v4());
    rows.load_file(
        &file,
        vec![
            RegisterRow::new(1, "B-101", "DWG-1").with_workflow("fabrication"),
            RegisterRow::new(2, "B-102", "DWG-1").with_workflow("erection"),
            RegisterRow::new(3, "C-201", "DWG-2"),
            RegisterRow::new(4, "C-202", "DWG-2"),
            RegisterRow::new(5, "G-301", "DWG-3"),
        ],
    );

    let (token, handle) = spawn_daemon(storage.clone(), rows.clone());
    let session_id = manager
        .create_upload_session(file.clone(), "register.xlsx".to_string(), project)
        .await
        .unwrap();

    let progress = wait_for_terminal(&manager, session_id).await;
    assert_eq!(progress.status, SessionStatus::Completed);
    assert_eq!(progress.total_batches, 3);
    assert_eq!(progress.summary.successful_batches, 3);
    assert_eq!(progress.summary.failed_batches, 0);
    assert_eq!(progress.summary.total_elements_created, 5);
    let expected_tasks = (WorkflowKind::Fabrication.task_titles().len()
        + WorkflowKind::Erection.task_titles().len()) as u64;
    assert_eq!(progress.summary.total_tasks_created, expected_tasks);
    assert_eq!(progress.summary.duplicates_skipped, 0);
    assert!(progress.row_errors.is_empty());

    // The fabrication element got its full ordered task list.
    let element_id = storage
        .find_element(&NaturalKey::new(project, "B-101", "DWG-1"))
        .await
        .unwrap()
        .unwrap();
    let tasks = storage.element_tasks(element_id).await.unwrap();
    assert_eq!(tasks.len(), WorkflowKind::Fabrication.task_titles().len());
    assert!(tasks.windows(2).all(|w| w[0].order_key < w[1].order_key));
    assert_eq!(tasks[0].title, "Material receipt check");

    // A row without a workflow creates an element with no tasks.
    let bare = storage
        .find_element(&NaturalKey::new(project, "G-301", "DWG-3"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        manager.element_status(bare).await.unwrap(),
        ElementStatus::NoJobs
    );

    token.cancel();
    handle.await.unwrap().unwrap();
}

#[test_log::test(tokio::test)]
async fn failed_batch_is_isolated_and_retryable() {
    let (storage, rows, manager) = harness();
    let file = FileRef::from("register.xlsx");
    let project = ProjectId::from(uuid::Uuid::new_v4());
    rows.load_file(
        &file,
        (1..=6)
            .map(|n| RegisterRow::new(n, &format!("B-{n}"), "DWG-1"))
            .collect(),
    );
    // Batch 2 covers rows 3..=4; its first fetch fails at the source.
    rows.inject_fetch_error(&file, 3, "connection timeout");

    let (token, handle) = spawn_daemon(storage.clone(), rows.clone());
    let session_id = manager
        .create_upload_session(file.clone(), "register.xlsx".to_string(), project)
        .await
        .unwrap();

    let progress = wait_for_terminal(&manager, session_id).await;
    assert_eq!(progress.status, SessionStatus::PartialSuccess);
    assert_eq!(progress.summary.successful_batches, 2);
    assert_eq!(progress.summary.failed_batches, 1);
    assert_eq!(progress.summary.total_elements_created, 4);

    let failed = progress
        .batches
        .iter()
        .find(|b| b.batch_number == 2)
        .unwrap();
    assert!(failed.error.as_deref().unwrap().contains("connection timeout"));

    // Rows of the other batches landed despite the failure.
    assert!(storage
        .find_element(&NaturalKey::new(project, "B-1", "DWG-1"))
        .await
        .unwrap()
        .is_some());
    assert!(storage
        .find_element(&NaturalKey::new(project, "B-3", "DWG-1"))
        .await
        .unwrap()
        .is_none());

    manager.retry_batch(session_id, 2).await.unwrap();
    let progress = wait_for_terminal(&manager, session_id).await;
    assert_eq!(progress.status, SessionStatus::Completed);
    assert_eq!(progress.summary.successful_batches, 3);
    assert_eq!(progress.summary.failed_batches, 0);
    assert_eq!(progress.summary.total_elements_created, 6);
    let retried = progress
        .batches
        .iter()
        .find(|b| b.batch_number == 2)
        .unwrap();
    assert_eq!(retried.retry_count, 1);

    token.cancel();
    handle.await.unwrap().unwrap();
}

#[test_log::test(tokio::test)]
async fn replayed_outcome_is_applied_once() {
    let (storage, rows, manager) = harness();
    let file = FileRef::from("register.xlsx");
    let project = ProjectId::from(uuid::Uuid::new_v4());
    rows.load_file(
        &file,
        vec![
            RegisterRow::new(1, "B-1", "DWG-1"),
            RegisterRow::new(2, "B-2", "DWG-1"),
        ],
    );
    let session_id = manager
        .create_upload_session(file, "register.xlsx".to_string(), project)
        .await
        .unwrap();

    let worker_id = WorkerId::from(uuid::Uuid::new_v4());
    let mut claimed = storage.claim_batches(10, worker_id).await.unwrap();
    assert_eq!(claimed.len(), 1);
    let batch = claimed.remove(0);

    let outcome =
        girder::daemon::worker::process_batch(storage.as_ref(), rows.as_ref(), batch).await;
    storage.apply_outcome(outcome.clone()).await.unwrap();
    // A worker that lost its ack may deliver the same outcome again.
    storage.apply_outcome(outcome).await.unwrap();

    let progress = manager.session_progress(session_id).await.unwrap();
    assert_eq!(progress.status, SessionStatus::Completed);
    assert_eq!(progress.summary.successful_batches, 1);
    assert_eq!(progress.summary.total_elements_created, 2);
}

#[test_log::test(tokio::test)]
async fn reupload_of_same_register_skips_every_row() {
    let (storage, rows, manager) = harness();
    let file = FileRef::from("register.xlsx");
    let project = ProjectId::from(uuid::Uuid::new_v4());
    rows.load_file(
        &file,
        (1..=4)
            .map(|n| RegisterRow::new(n, &format!("b-{n} "), "DWG-1"))
            .collect(),
    );

    let (token, handle) = spawn_daemon(storage.clone(), rows.clone());
    let first = manager
        .create_upload_session(file.clone(), "register.xlsx".to_string(), project)
        .await
        .unwrap();
    let progress = wait_for_terminal(&manager, first).await;
    assert_eq!(progress.summary.total_elements_created, 4);

    // Same content, different formatting of the identifiers.
    rows.load_file(
        &file,
        (1..=4)
            .map(|n| RegisterRow::new(n, &format!("B-{n}"), "dwg-1"))
            .collect(),
    );
    let second = manager
        .create_upload_session(file.clone(), "register.xlsx".to_string(), project)
        .await
        .unwrap();
    let progress = wait_for_terminal(&manager, second).await;
    assert_eq!(progress.status, SessionStatus::Completed);
    assert_eq!(progress.summary.total_elements_created, 0);
    assert_eq!(progress.summary.duplicates_skipped, 4);

    token.cancel();
    handle.await.unwrap().unwrap();
}

#[test_log::test(tokio::test)]
async fn rejected_rows_surface_as_data_not_batch_failure() {
    let (storage, rows, manager) = harness();
    let file = FileRef::from("register.xlsx");
    let project = ProjectId::from(uuid::Uuid::new_v4());
    rows.load_file(
        &file,
        vec![
            RegisterRow::new(1, "B-1", "DWG-1"),
            RegisterRow::new(2, "  ", "DWG-1"),
            RegisterRow::new(3, "B-3", "DWG-1").with_workflow("galvanizing"),
            RegisterRow::new(4, "B-4", "DWG-1"),
        ],
    );

    let (token, handle) = spawn_daemon(storage.clone(), rows.clone());
    let session_id = manager
        .create_upload_session(file, "register.xlsx".to_string(), project)
        .await
        .unwrap();

    let progress = wait_for_terminal(&manager, session_id).await;
    assert_eq!(progress.status, SessionStatus::Completed);
    assert_eq!(progress.summary.failed_batches, 0);
    assert_eq!(progress.summary.total_elements_created, 2);
    assert_eq!(progress.row_errors.len(), 2);
    assert!(progress.row_errors.iter().any(|e| e.row == 2));
    assert!(progress
        .row_errors
        .iter()
        .any(|e| e.row == 3 && e.message.contains("galvanizing")));

    token.cancel();
    handle.await.unwrap().unwrap();
}

#[test_log::test(tokio::test)]
async fn deleting_a_batch_removes_exactly_its_artifacts() {
    let (storage, rows, manager) = harness();
    let file = FileRef::from("register.xlsx");
    let project = ProjectId::from(uuid::Uuid::new_v4());
    rows.load_file(
        &file,
        vec![
            RegisterRow::new(1, "B-1", "DWG-1").with_workflow("fabrication"),
            RegisterRow::new(2, "B-2", "DWG-1").with_workflow("fabrication"),
            RegisterRow::new(3, "C-1", "DWG-2"),
            RegisterRow::new(4, "C-2", "DWG-2"),
        ],
    );

    let (token, handle) = spawn_daemon(storage.clone(), rows.clone());
    let session_id = manager
        .create_upload_session(file, "register.xlsx".to_string(), project)
        .await
        .unwrap();
    wait_for_terminal(&manager, session_id).await;
    token.cancel();
    handle.await.unwrap().unwrap();

    manager.delete_batch(session_id, 1).await.unwrap();

    let progress = manager.session_progress(session_id).await.unwrap();
    assert_eq!(progress.total_batches, 1);
    assert_eq!(progress.summary.successful_batches, 1);
    assert_eq!(progress.summary.total_elements_created, 2);
    assert_eq!(progress.summary.total_tasks_created, 0);

    // Batch 1's elements (and their tasks) are gone, batch 2's remain.
    assert!(storage
        .find_element(&NaturalKey::new(project, "B-1", "DWG-1"))
        .await
        .unwrap()
        .is_none());
    assert!(storage
        .find_element(&NaturalKey::new(project, "C-1", "DWG-2"))
        .await
        .unwrap()
        .is_some());
}

#[test_log::test(tokio::test)]
async fn failed_batch_cleanup_and_session_delete() {
    let (storage, rows, manager) = harness();
    let file = FileRef::from("register.xlsx");
    let project = ProjectId::from(uuid::Uuid::new_v4());
    rows.load_file(
        &file,
        (1..=4)
            .map(|n| RegisterRow::new(n, &format!("B-{n}"), "DWG-1"))
            .collect(),
    );
    rows.inject_fetch_error(&file, 1, "range unreadable");
    rows.inject_fetch_error(&file, 3, "range unreadable");

    let (token, handle) = spawn_daemon(storage.clone(), rows.clone());
    let session_id = manager
        .create_upload_session(file, "register.xlsx".to_string(), project)
        .await
        .unwrap();
    let progress = wait_for_terminal(&manager, session_id).await;
    assert_eq!(progress.status, SessionStatus::Failed);
    token.cancel();
    handle.await.unwrap().unwrap();

    let deleted = manager.delete_failed_batches(session_id).await.unwrap();
    assert_eq!(deleted, 2);
    let progress = manager.session_progress(session_id).await.unwrap();
    assert_eq!(progress.total_batches, 0);
    assert_eq!(progress.status, SessionStatus::Failed);

    manager.delete_session(session_id).await.unwrap();
    assert!(matches!(
        manager.session_progress(session_id).await,
        Err(GirderError::SessionNotFound(_))
    ));
}

#[test_log::test(tokio::test)]
async fn in_flight_batches_block_cleanup() {
    let (storage, rows, manager) = harness();
    let file = FileRef::from("register.xlsx");
    let project = ProjectId::from(uuid::Uuid::new_v4());
    rows.load_file(&file, vec![RegisterRow::new(1, "B-1", "DWG-1")]);
    let session_id = manager
        .create_upload_session(file, "register.xlsx".to_string(), project)
        .await
        .unwrap();

    let worker_id = WorkerId::from(uuid::Uuid::new_v4());
    let claimed = storage.claim_batches(10, worker_id).await.unwrap();
    assert_eq!(claimed.len(), 1);

    assert!(matches!(
        manager.delete_batch(session_id, 1).await,
        Err(GirderError::StillProcessing(_, 1))
    ));
    assert!(matches!(
        manager.delete_session(session_id).await,
        Err(GirderError::StillProcessing(_, 1))
    ));
}

#[test_log::test(tokio::test)]
async fn retry_of_a_non_failed_batch_is_stale() {
    let (_storage, rows, manager) = harness();
    let file = FileRef::from("register.xlsx");
    let project = ProjectId::from(uuid::Uuid::new_v4());
    rows.load_file(&file, vec![RegisterRow::new(1, "B-1", "DWG-1")]);
    let session_id = manager
        .create_upload_session(file, "register.xlsx".to_string(), project)
        .await
        .unwrap();

    assert!(matches!(
        manager.retry_batch(session_id, 1).await,
        Err(GirderError::StaleState(_, 1, _, _))
    ));
}

#[test_log::test(tokio::test)]
async fn stuck_batch_returns_to_queue_without_a_retry() {
    let (storage, rows, manager) = harness();
    let file = FileRef::from("register.xlsx");
    let project = ProjectId::from(uuid::Uuid::new_v4());
    rows.load_file(&file, vec![RegisterRow::new(1, "B-1", "DWG-1")]);
    let session_id = manager
        .create_upload_session(file, "register.xlsx".to_string(), project)
        .await
        .unwrap();

    let worker_id = WorkerId::from(uuid::Uuid::new_v4());
    let claimed = storage.claim_batches(10, worker_id).await.unwrap();
    assert_eq!(claimed.len(), 1);

    // Zero timeout: anything claimed before now counts as stuck.
    let requeued = storage
        .requeue_stuck(chrono::Duration::zero())
        .await
        .unwrap();
    assert_eq!(requeued, vec![(session_id, 1)]);

    let reclaimed = storage.claim_batches(10, worker_id).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].state.retry_count, 0);
}

#[test_log::test(tokio::test)]
async fn unreadable_or_empty_files_fail_before_partitioning() {
    let (_storage, rows, manager) = harness();
    let project = ProjectId::from(uuid::Uuid::new_v4());

    let missing = FileRef::from("missing.xlsx");
    assert!(matches!(
        manager
            .create_upload_session(missing, "missing.xlsx".to_string(), project)
            .await,
        Err(GirderError::RowSource(_))
    ));

    let empty = FileRef::from("empty.xlsx");
    rows.load_file(&empty, Vec::new());
    assert!(matches!(
        manager
            .create_upload_session(empty, "empty.xlsx".to_string(), project)
            .await,
        Err(GirderError::EmptyFile(_))
    ));
}

#[test_log::test(tokio::test)]
async fn element_status_follows_task_completion() {
    let (storage, rows, manager) = harness();
    let file = FileRef::from("register.xlsx");
    let project = ProjectId::from(uuid::Uuid::new_v4());
    rows.load_file(
        &file,
        vec![RegisterRow::new(1, "B-1", "DWG-1").with_workflow("coating_survey")],
    );

    let (token, handle) = spawn_daemon(storage.clone(), rows.clone());
    let session_id = manager
        .create_upload_session(file, "register.xlsx".to_string(), project)
        .await
        .unwrap();
    wait_for_terminal(&manager, session_id).await;
    token.cancel();
    handle.await.unwrap().unwrap();

    let element_id = storage
        .find_element(&NaturalKey::new(project, "B-1", "DWG-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        manager.element_status(element_id).await.unwrap(),
        ElementStatus::Active
    );

    let tasks = storage.element_tasks(element_id).await.unwrap();
    for task in &tasks {
        storage
            .set_task_status(task.id, TaskStatus::Completed)
            .await
            .unwrap();
    }
    assert_eq!(
        manager.element_status(element_id).await.unwrap(),
        ElementStatus::Complete
    );

    // One blocked task dominates every completed one.
    storage
        .set_task_status(tasks[3].id, TaskStatus::NotApplicable)
        .await
        .unwrap();
    assert_eq!(
        manager.element_status(element_id).await.unwrap(),
        ElementStatus::NonClearance
    );
}

#[test_log::test(tokio::test)]
async fn interactive_insertion_orders_by_position_hint() {
    let (storage, rows, manager) = harness();
    let file = FileRef::from("register.xlsx");
    let project = ProjectId::from(uuid::Uuid::new_v4());
    rows.load_file(&file, vec![RegisterRow::new(1, "B-1", "DWG-1")]);

    let (token, handle) = spawn_daemon(storage.clone(), rows.clone());
    let session_id = manager
        .create_upload_session(file, "register.xlsx".to_string(), project)
        .await
        .unwrap();
    wait_for_terminal(&manager, session_id).await;
    token.cancel();
    handle.await.unwrap().unwrap();

    let element_id = storage
        .find_element(&NaturalKey::new(project, "B-1", "DWG-1"))
        .await
        .unwrap()
        .unwrap();

    let site_weld = manager
        .insert_task(element_id, "Site weld check".to_string(), PositionHint::End)
        .await
        .unwrap();
    manager
        .insert_task(element_id, "Hold point".to_string(), PositionHint::Start)
        .await
        .unwrap();
    manager
        .insert_task(
            element_id,
            "Touch-up survey".to_string(),
            PositionHint::After(site_weld.id),
        )
        .await
        .unwrap();

    let tasks = storage.element_tasks(element_id).await.unwrap();
    let titles: Vec<&str> = tasks.iter().map(|t| t.title.as_str()).collect();
    assert_eq!(titles, ["Hold point", "Site weld check", "Touch-up survey"]);
    assert!(tasks.windows(2).all(|w| w[0].order_key < w[1].order_key));
    assert_eq!(
        manager.element_status(element_id).await.unwrap(),
        ElementStatus::Active
    );

    // Deleting a task never renumbers its siblings.
    let keys_before: Vec<_> = tasks.iter().map(|t| (t.id, t.order_key)).collect();
    storage.delete_task(site_weld.id).await.unwrap();
    let remaining = storage.element_tasks(element_id).await.unwrap();
    assert_eq!(remaining.len(), 2);
    for task in &remaining {
        let before = keys_before.iter().find(|(id, _)| *id == task.id).unwrap();
        assert_eq!(task.order_key, before.1);
    }
}
