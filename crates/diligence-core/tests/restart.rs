//! Process restart against the on-disk store: a session interrupted mid-task
//! is picked up by a new service over a reopened store and finished.

mod common;

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use common::*;
use diligence_core::{
    AgentKind, AgentRegistry, InMemoryVectorStore, OrchestratorConfig, SessionStatus,
    TaskGraphBuilder, TaskId, TaskState,
};
use diligence_state::{
    AttemptId, NewSession, SessionStore, SurrealSessionStore, TaskUpdate, WriterId,
};

async fn reopen(path: &Path) -> Arc<dyn SessionStore> {
    for _ in 0..50 {
        if let Ok(store) = SurrealSessionStore::open_local(path).await {
            return Arc::new(store);
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    panic!("store at {} did not reopen", path.display());
}

#[tokio::test]
async fn test_session_survives_store_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sessions");
    let registry = AgentRegistry::extractive();

    let sid = {
        let store = SurrealSessionStore::open_local(&path).await.unwrap();
        let tasks = TaskGraphBuilder::new(&registry)
            .build(&["summary", "qa"])
            .unwrap()
            .into_tasks();
        let sid = store
            .create(NewSession {
                profile: profile(),
                questions: vec!["What is the monthly burn?".to_string()],
                tasks,
                deadline_at: Utc::now() + chrono::Duration::minutes(10),
                max_concurrent: 2,
            })
            .await
            .unwrap();

        // The crashed process had started Summary; its lease has lapsed.
        let crashed = WriterId::new();
        store
            .acquire_writer(&sid, &crashed, Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap();
        let summary = TaskId::from(AgentKind::Summary);
        store
            .update(
                &sid,
                &crashed,
                TaskUpdate::transition(AttemptId::new(summary.clone(), 0), TaskState::Ready),
            )
            .await
            .unwrap();
        store
            .update(
                &sid,
                &crashed,
                TaskUpdate::transition(AttemptId::new(summary, 1), TaskState::Running),
            )
            .await
            .unwrap();
        sid
    };

    let store = reopen(&path).await;
    let before = store.read(&sid).await.unwrap();
    assert_eq!(before.status, SessionStatus::Running);
    assert_eq!(
        before.task_by_kind(AgentKind::Summary).unwrap().state,
        TaskState::Running
    );

    let svc = service_with(
        Arc::clone(&store),
        Arc::new(InMemoryVectorStore::new(chunks())),
        registry,
        OrchestratorConfig::default(),
    );
    svc.resume(&sid).await.unwrap();
    let report = svc.wait(&sid).await.unwrap();

    assert_eq!(report.status, SessionStatus::Completed);
    let record = store.read(&sid).await.unwrap();
    let summary = record.task_by_kind(AgentKind::Summary).unwrap();
    assert_eq!(summary.state, TaskState::Succeeded);
    assert_eq!(summary.attempts, 2);
    assert_eq!(record.task_by_kind(AgentKind::Qa).unwrap().state, TaskState::Succeeded);
    assert!(record.lease.is_none());
    assert!(record.report.is_some());
}
