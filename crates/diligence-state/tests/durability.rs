//! On-disk store: a session written through `surrealkv://` reads back intact,
//! including from a fresh handle after the first one is dropped.

use std::path::Path;

use chrono::{Duration, Utc};
use diligence_state::*;

/// The engine shuts down in the background once the last handle is dropped.
async fn reopen(path: &Path) -> SurrealSessionStore {
    for _ in 0..50 {
        if let Ok(store) = SurrealSessionStore::open_local(path).await {
            return store;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    panic!("store at {} did not reopen", path.display());
}

#[tokio::test]
async fn test_local_store_round_trips_session_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");
    let store = SurrealSessionStore::open_local(&path).await.unwrap();
    assert!(path.exists());

    let summary = TaskRecord::new(TaskId::from(AgentKind::Summary), AgentKind::Summary, vec![]);
    let sid = store
        .create(NewSession {
            profile: StartupProfile::new("Acme", "robotics", "acme-deck"),
            questions: vec![],
            tasks: vec![summary],
            deadline_at: Utc::now() + Duration::minutes(5),
            max_concurrent: 1,
        })
        .await
        .unwrap();

    let writer = WriterId::new();
    store
        .acquire_writer(&sid, &writer, Utc::now() + Duration::minutes(1))
        .await
        .unwrap();
    let task_id = TaskId::from(AgentKind::Summary);
    store
        .update(
            &sid,
            &writer,
            TaskUpdate::transition(AttemptId::new(task_id.clone(), 0), TaskState::Ready),
        )
        .await
        .unwrap();
    store
        .update(
            &sid,
            &writer,
            TaskUpdate::transition(AttemptId::new(task_id, 1), TaskState::Running),
        )
        .await
        .unwrap();
    store
        .store_report(&sid, serde_json::json!({"status": "partial"}))
        .await
        .unwrap();

    let record = store.read(&sid).await.unwrap();
    assert_eq!(record.tasks[0].state, TaskState::Running);
    assert_eq!(record.tasks[0].attempts, 1);
    assert_eq!(record.applied.len(), 2);
    assert_eq!(record.report, Some(serde_json::json!({"status": "partial"})));
    assert_eq!(
        store.list(Some(SessionStatus::Running)).await.unwrap(),
        vec![sid]
    );
}

#[tokio::test]
async fn test_reopened_store_keeps_sessions_and_leases() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");
    let task_id = TaskId::from(AgentKind::Summary);
    let writer = WriterId::new();

    let sid = {
        let store = SurrealSessionStore::open_local(&path).await.unwrap();
        let sid = store
            .create(NewSession {
                profile: StartupProfile::new("Acme", "robotics", "acme-deck"),
                questions: vec!["What is the monthly burn?".to_string()],
                tasks: vec![TaskRecord::new(task_id.clone(), AgentKind::Summary, vec![])],
                deadline_at: Utc::now() + Duration::minutes(5),
                max_concurrent: 1,
            })
            .await
            .unwrap();
        store
            .acquire_writer(&sid, &writer, Utc::now() + Duration::minutes(1))
            .await
            .unwrap();
        store
            .update(
                &sid,
                &writer,
                TaskUpdate::transition(AttemptId::new(task_id.clone(), 0), TaskState::Ready),
            )
            .await
            .unwrap();
        sid
    };

    let store = reopen(&path).await;
    let record = store.read(&sid).await.unwrap();
    assert_eq!(record.tasks[0].state, TaskState::Ready);
    assert_eq!(record.questions, vec!["What is the monthly burn?".to_string()]);
    assert_eq!(record.lease.as_ref().map(|l| &l.writer), Some(&writer));

    // The live lease survived the restart, so another writer is refused.
    let err = store
        .acquire_writer(&sid, &WriterId::new(), Utc::now() + Duration::minutes(1))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::WriterConflict { .. }));

    // Replaying an applied update is recognised as a duplicate.
    let outcome = store
        .update(
            &sid,
            &writer,
            TaskUpdate::transition(AttemptId::new(task_id, 0), TaskState::Ready),
        )
        .await
        .unwrap();
    assert_eq!(outcome, UpdateOutcome::Duplicate);
}
