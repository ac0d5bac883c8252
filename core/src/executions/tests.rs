use super::*;
use crate::catalog::SqlProcessCatalog;
use crate::db::test_helpers::test_pool;
use crate::processes::ProcessService;
use crate::types::*;
use crate::workflow_state::{
    LocalWorkflowStates, WorkflowPhase, WorkflowState, WorkflowStateError,
};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde_json::{json, Value as JsonValue};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

struct Harness {
    pool: SqlitePool,
    service: ExecutionService,
    states: Arc<LocalWorkflowStates>,
    scope: Scope,
    process_id: String,
}

fn new_step(id: &str, position: i64, is_active: bool) -> NewStep {
    NewStep {
        id: Some(id.to_string()),
        parent_step_id: None,
        name: format!("Step {}", id),
        step_type: "manual_task".to_string(),
        position,
        config: JsonMap::new(),
        is_active,
    }
}

/// Migrated database with one active process of three steps, the last inactive
async fn harness() -> Harness {
    harness_on(test_pool().await).await
}

async fn harness_on(pool: SqlitePool) -> Harness {
    let scope = Scope::project("proj-1");

    let processes = ProcessService::new(pool.clone());
    let process = processes
        .create_definition(
            &scope,
            "Incident response",
            vec![
                new_step("triage", 1, true),
                new_step("resolve", 2, true),
                new_step("postmortem", 3, false),
            ],
        )
        .await
        .unwrap();
    processes.activate(&scope, &process.id).await.unwrap();

    let states = Arc::new(LocalWorkflowStates::new());
    let service = ExecutionService::new(
        pool.clone(),
        Arc::new(SqlProcessCatalog::new(pool.clone())),
        states.clone(),
        EngineConfig::default(),
    );

    Harness {
        pool,
        service,
        states,
        scope,
        process_id: process.id,
    }
}

impl Harness {
    async fn start(&self, actor_id: &str) -> Execution {
        self.service
            .create(
                &self.scope,
                CreateExecution {
                    actor_id: actor_id.to_string(),
                    process_id: self.process_id.clone(),
                    input_data: Some(json!({"ticket": "INC-42"})),
                    metadata: Some(
                        json!({"source": "pager"})
                            .as_object()
                            .cloned()
                            .unwrap(),
                    ),
                },
            )
            .await
            .unwrap()
    }

    async fn audit_count(&self, execution_id: &str) -> i64 {
        db::audit_log::count_for_execution(&self.pool, execution_id)
            .await
            .unwrap()
    }

    async fn execution_count(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM executions")
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }

    async fn fail(&self, execution_id: &str) -> Execution {
        self.service
            .update(
                &self.scope,
                execution_id,
                ExecutionPatch {
                    status: Some(ExecutionStatus::Failed),
                    error_message: Some("step timed out".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
    }
}

/// Wait for the fire-and-forget workflow-state signal to land
async fn wait_for_phase(states: &LocalWorkflowStates, handle: &str, phase: WorkflowPhase) {
    let handle = WorkflowHandle(handle.to_string());
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(state) = states.get_state(&handle).await.unwrap() {
                if state.phase == phase {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("workflow state never reached the expected phase");
}

/// Wait for the fire-and-forget release to drop the handle
async fn wait_for_release(states: &LocalWorkflowStates, handle: &str) {
    let handle = WorkflowHandle(handle.to_string());
    tokio::time::timeout(Duration::from_secs(2), async {
        while states.get_state(&handle).await.unwrap().is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("workflow state was never released");
}

fn assert_completed_at_matches_status(execution: &Execution) {
    assert_eq!(
        execution.completed_at.is_some(),
        execution.status.is_terminal(),
        "completed_at must be set exactly for terminal executions: {:?}",
        execution
    );
}

fn execution_at(scope: &Scope, process_id: &str, id: &str, created_at: DateTime<Utc>) -> Execution {
    Execution {
        id: id.to_string(),
        project_id: scope.project_id.clone(),
        process_id: process_id.to_string(),
        process_version: 1,
        status: ExecutionStatus::Pending,
        actor_id: "seed".to_string(),
        input_data: json!({}),
        output_data: None,
        error_message: None,
        metadata: JsonMap::new(),
        retry_of: None,
        revision: 0,
        started_at: None,
        completed_at: None,
        created_at,
        updated_at: created_at,
    }
}

#[tokio::test]
async fn test_create_starts_running_execution() {
    let h = harness().await;

    let execution = h.start("user-1").await;

    assert_eq!(execution.status, ExecutionStatus::Running);
    assert_eq!(execution.actor_id, "user-1");
    assert_eq!(execution.process_version, 1);
    assert_eq!(execution.input_data, json!({"ticket": "INC-42"}));
    assert_eq!(execution.metadata["source"], json!("pager"));
    assert!(execution.started_at.is_some());
    assert_completed_at_matches_status(&execution);

    let handle = execution.workflow_state_id().unwrap();
    assert!(handle.starts_with("wfs_"));
    let state = h
        .states
        .get_state(&WorkflowHandle(handle.to_string()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.process_id, h.process_id);
    assert_eq!(state.initialized_by, "user-1");

    let stored = h.service.get_one_or_throw(&h.scope, &execution.id).await.unwrap();
    assert_eq!(stored, execution);

    let audit = h
        .service
        .list_audit_entries(
            &h.scope,
            &AuditFilter {
                entity: Some(AuditEntity::Execution(execution.id.clone())),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].action, AuditAction::Execute);
    assert_eq!(audit[0].metadata["workflowStateId"], json!(handle));
}

#[tokio::test]
async fn test_create_ignores_caller_bookkeeping_metadata() {
    let h = harness().await;

    let execution = h
        .service
        .create(
            &h.scope,
            CreateExecution {
                actor_id: "user-1".to_string(),
                process_id: h.process_id.clone(),
                input_data: None,
                metadata: json!({"isRetry": true, "retryAttempt": 7, "team": "sre"})
                    .as_object()
                    .cloned(),
            },
        )
        .await
        .unwrap();

    assert_eq!(execution.input_data, json!({}));
    assert_eq!(execution.metadata.get(meta::IS_RETRY), None);
    assert_eq!(execution.retry_attempt(), 0);
    assert_eq!(execution.metadata["team"], json!("sre"));
}

#[tokio::test]
async fn test_create_requires_runnable_process() {
    let h = harness().await;
    let request = |process_id: &str| CreateExecution {
        actor_id: "user-1".to_string(),
        process_id: process_id.to_string(),
        ..Default::default()
    };

    let missing = assert_err!(h.service.create(&h.scope, request("nope")).await);
    assert!(matches!(missing, EngineError::NotFound { .. }));

    let other_project = Scope::project("proj-2");
    let hidden = assert_err!(h.service.create(&other_project, request(&h.process_id)).await);
    assert!(matches!(hidden, EngineError::NotFound { .. }));

    let processes = ProcessService::new(h.pool.clone());
    let draft = processes
        .create_definition(&h.scope, "Draft", vec![new_step("a", 1, true)])
        .await
        .unwrap();
    let not_active = assert_err!(h.service.create(&h.scope, request(&draft.id)).await);
    assert!(matches!(not_active, EngineError::PreconditionFailed(_)));

    processes.archive(&h.scope, &h.process_id).await.unwrap();
    let archived = assert_err!(h.service.create(&h.scope, request(&h.process_id)).await);
    assert!(matches!(archived, EngineError::PreconditionFailed(_)));

    let blank_actor = CreateExecution {
        actor_id: " ".to_string(),
        process_id: h.process_id.clone(),
        ..Default::default()
    };
    let invalid = assert_err!(h.service.create(&h.scope, blank_actor).await);
    assert!(matches!(invalid, EngineError::Validation(_)));

    assert_eq!(h.execution_count().await, 0);
}

#[tokio::test]
async fn test_create_cancel_retry_scenario() {
    let h = harness().await;
    let original = h.start("user-1").await;

    let cancelled = assert_ok!(h.service.cancel(&h.scope, &original.id, "user-2").await);
    assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
    assert_eq!(cancelled.error_message.as_deref(), Some("cancelled by user-2"));
    assert!(cancelled.completed_at.is_some());
    assert_eq!(h.audit_count(&original.id).await, 2);

    wait_for_phase(
        &h.states,
        original.workflow_state_id().unwrap(),
        WorkflowPhase::Cancelled,
    )
    .await;

    let retried = assert_ok!(h.service.retry(&h.scope, &original.id, "user-3").await);
    assert_ne!(retried.id, original.id);
    assert_eq!(retried.status, ExecutionStatus::Running);
    assert_eq!(retried.actor_id, "user-3");
    assert_eq!(retried.input_data, original.input_data);
    assert_eq!(retried.retry_of.as_deref(), Some(original.id.as_str()));
    assert_eq!(retried.metadata[meta::IS_RETRY], json!(true));
    assert_eq!(retried.metadata[meta::ORIGINAL_EXECUTION_ID], json!(original.id));
    assert_eq!(retried.retry_attempt(), 1);
    assert_eq!(retried.metadata["source"], json!("pager"));
    assert_ne!(retried.workflow_state_id(), original.workflow_state_id());
    assert_eq!(h.audit_count(&retried.id).await, 1);

    let retry_audit = h
        .service
        .list_audit_entries(
            &h.scope,
            &AuditFilter {
                action: Some(AuditAction::Retry),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(retry_audit.len(), 1);
    assert_eq!(retry_audit[0].execution_id.as_deref(), Some(retried.id.as_str()));
    assert_eq!(retry_audit[0].metadata["originalExecutionId"], json!(original.id));

    // The original is never touched by a retry
    let original_now = h.service.get_one_or_throw(&h.scope, &original.id).await.unwrap();
    assert_eq!(original_now, cancelled);
}

#[tokio::test]
async fn test_cancel_only_from_pending_or_running() {
    let h = harness().await;
    let execution = h.start("user-1").await;
    let completed = h
        .service
        .update(
            &h.scope,
            &execution.id,
            ExecutionPatch {
                status: Some(ExecutionStatus::Completed),
                output_data: Some(json!({"resolved": true})),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let err = assert_err!(h.service.cancel(&h.scope, &execution.id, "user-2").await);
    match err {
        EngineError::InvalidStateTransition { from, to, .. } => {
            assert_eq!(from, ExecutionStatus::Completed);
            assert_eq!(to, ExecutionStatus::Cancelled);
        }
        other => panic!("expected InvalidStateTransition, got {:?}", other),
    }

    let unchanged = h.service.get_one_or_throw(&h.scope, &execution.id).await.unwrap();
    assert_eq!(unchanged, completed);
    assert_eq!(h.audit_count(&execution.id).await, 2);
}

#[tokio::test]
async fn test_cancel_pending_execution() {
    let h = harness().await;
    let seeded = execution_at(&h.scope, &h.process_id, "pending-1", now());
    db::executions::insert_execution(&h.pool, &seeded).await.unwrap();

    let cancelled = h.service.cancel(&h.scope, "pending-1", "user-2").await.unwrap();
    assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
    assert_eq!(cancelled.revision, 1);
    assert_completed_at_matches_status(&cancelled);
}

#[tokio::test]
async fn test_concurrent_cancels_only_one_succeeds() {
    let h = harness().await;
    let execution = h.start("user-1").await;

    let (first, second) = tokio::join!(
        h.service.cancel(&h.scope, &execution.id, "user-a"),
        h.service.cancel(&h.scope, &execution.id, "user-b"),
    );

    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    let loser = outcomes.into_iter().find_map(Result::err).unwrap();
    assert!(matches!(
        loser,
        EngineError::InvalidStateTransition { .. } | EngineError::Conflict(_)
    ));

    // execute + exactly one cancel
    assert_eq!(h.audit_count(&execution.id).await, 2);
}

/// Migrated database file served by several connections
async fn file_pool() -> (SqlitePool, std::path::PathBuf) {
    let path = std::env::temp_dir().join(format!("sopline-{}.db", uuid::Uuid::new_v4()));
    let config = crate::config::DatabaseConfig {
        url: Some(format!("sqlite://{}", path.display())),
        max_connections: 5,
        min_connections: 1,
        acquire_timeout_secs: 10,
        idle_timeout_secs: 60,
        max_lifetime_secs: 60,
    };
    let pool = db::create_pool(&config).await.unwrap();
    db::migrate(&pool).await.unwrap();
    (pool, path)
}

#[tokio::test]
async fn test_concurrent_cancels_across_connections() {
    let (pool, path) = file_pool().await;
    let h = harness_on(pool).await;

    for _ in 0..10 {
        let execution = h.start("user-1").await;
        let (first, second) = tokio::join!(
            h.service.cancel(&h.scope, &execution.id, "user-a"),
            h.service.cancel(&h.scope, &execution.id, "user-b"),
        );

        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        let loser = outcomes.into_iter().find_map(Result::err).unwrap();
        assert!(
            matches!(
                loser,
                EngineError::InvalidStateTransition { .. } | EngineError::Conflict(_)
            ),
            "unexpected error {:?}",
            loser
        );
        assert_eq!(h.audit_count(&execution.id).await, 2);
    }

    h.pool.close().await;
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{}", path.display(), suffix));
    }
}

#[tokio::test]
async fn test_retry_requires_failed_or_cancelled() {
    let h = harness().await;
    let execution = h.start("user-1").await;

    let err = assert_err!(h.service.retry(&h.scope, &execution.id, "user-1").await);
    match err {
        EngineError::InvalidStateTransition { from, .. } => {
            assert_eq!(from, ExecutionStatus::Running)
        }
        other => panic!("expected InvalidStateTransition, got {:?}", other),
    }
    assert_eq!(h.execution_count().await, 1);

    let missing = assert_err!(h.service.retry(&h.scope, "nope", "user-1").await);
    assert!(matches!(missing, EngineError::NotFound { .. }));
}

#[tokio::test]
async fn test_retry_attempts_chain() {
    let h = harness().await;
    let first = h.start("user-1").await;
    h.fail(&first.id).await;

    let second = h.service.retry(&h.scope, &first.id, "user-1").await.unwrap();
    assert_eq!(second.retry_attempt(), 1);
    h.fail(&second.id).await;

    let third = h.service.retry(&h.scope, &second.id, "user-1").await.unwrap();
    assert_eq!(third.retry_attempt(), 2);
    assert_eq!(third.metadata[meta::ORIGINAL_EXECUTION_ID], json!(second.id));
}

#[tokio::test]
async fn test_execution_is_retried_at_most_once() {
    let h = harness().await;
    let execution = h.start("user-1").await;
    h.fail(&execution.id).await;

    h.service.retry(&h.scope, &execution.id, "user-1").await.unwrap();
    let err = assert_err!(h.service.retry(&h.scope, &execution.id, "user-2").await);
    assert!(matches!(err, EngineError::Conflict(_)));
    assert_eq!(h.execution_count().await, 2);
}

#[tokio::test]
async fn test_retry_uniqueness_holds_in_the_store() {
    let h = harness().await;
    let original = execution_at(&h.scope, &h.process_id, "orig", now());
    db::executions::insert_execution(&h.pool, &original).await.unwrap();

    let mut first = execution_at(&h.scope, &h.process_id, "retry-a", now());
    first.retry_of = Some("orig".to_string());
    db::executions::insert_execution(&h.pool, &first).await.unwrap();

    let mut second = execution_at(&h.scope, &h.process_id, "retry-b", now());
    second.retry_of = Some("orig".to_string());
    let err = db::executions::insert_execution(&h.pool, &second)
        .await
        .map_err(|err| conflict_on_unique(err, || "already retried".to_string()))
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
}

#[tokio::test]
async fn test_update_completes_with_output() {
    let h = harness().await;
    let execution = h.start("user-1").await;

    let completed = h
        .service
        .update(
            &h.scope,
            &execution.id,
            ExecutionPatch {
                status: Some(ExecutionStatus::Completed),
                output_data: Some(json!({"resolution": "rebooted"})),
                metadata: json!({"reviewedBy": "lead"}).as_object().cloned(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(completed.status, ExecutionStatus::Completed);
    assert_eq!(completed.output_data, Some(json!({"resolution": "rebooted"})));
    assert_completed_at_matches_status(&completed);
    // merged, not replaced
    assert_eq!(completed.metadata["source"], json!("pager"));
    assert_eq!(completed.metadata["reviewedBy"], json!("lead"));
    assert_eq!(completed.workflow_state_id(), execution.workflow_state_id());
    assert_eq!(completed.revision, execution.revision + 1);

    let entries = h
        .service
        .list_audit_entries(
            &h.scope,
            &AuditFilter {
                action: Some(AuditAction::Update),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        entries[0].metadata["changedFields"],
        json!(["status", "outputData", "metadata"])
    );
}

#[tokio::test]
async fn test_update_rejects_illegal_patches() {
    let h = harness().await;
    let execution = h.start("user-1").await;

    let empty = assert_err!(
        h.service
            .update(&h.scope, &execution.id, ExecutionPatch::default())
            .await
    );
    assert!(matches!(empty, EngineError::Validation(_)));

    let backwards = assert_err!(
        h.service
            .update(
                &h.scope,
                &execution.id,
                ExecutionPatch {
                    status: Some(ExecutionStatus::Pending),
                    ..Default::default()
                },
            )
            .await
    );
    assert!(matches!(
        backwards,
        EngineError::InvalidStateTransition {
            from: ExecutionStatus::Running,
            to: ExecutionStatus::Pending,
            ..
        }
    ));

    let output_on_failure = assert_err!(
        h.service
            .update(
                &h.scope,
                &execution.id,
                ExecutionPatch {
                    status: Some(ExecutionStatus::Failed),
                    output_data: Some(json!({"partial": true})),
                    ..Default::default()
                },
            )
            .await
    );
    assert!(matches!(output_on_failure, EngineError::Validation(_)));

    let missing = assert_err!(
        h.service
            .update(
                &h.scope,
                "nope",
                ExecutionPatch {
                    error_message: Some("x".to_string()),
                    ..Default::default()
                },
            )
            .await
    );
    assert!(matches!(missing, EngineError::NotFound { .. }));

    let unchanged = h.service.get_one_or_throw(&h.scope, &execution.id).await.unwrap();
    assert_eq!(unchanged, execution);
    assert_eq!(h.audit_count(&execution.id).await, 1);
}

#[tokio::test]
async fn test_update_on_terminal_execution() {
    let h = harness().await;
    let execution = h.start("user-1").await;
    let failed = h.fail(&execution.id).await;
    assert_completed_at_matches_status(&failed);

    let annotated = h
        .service
        .update(
            &h.scope,
            &execution.id,
            ExecutionPatch {
                status: Some(ExecutionStatus::Failed),
                metadata: json!({"ticketClosed": true}).as_object().cloned(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(annotated.status, ExecutionStatus::Failed);
    assert_eq!(annotated.completed_at, failed.completed_at);
    assert_eq!(annotated.metadata["ticketClosed"], json!(true));

    let reopen = assert_err!(
        h.service
            .update(
                &h.scope,
                &execution.id,
                ExecutionPatch {
                    status: Some(ExecutionStatus::Running),
                    ..Default::default()
                },
            )
            .await
    );
    assert!(matches!(reopen, EngineError::InvalidStateTransition { .. }));

    let rewrite_error = assert_err!(
        h.service
            .update(
                &h.scope,
                &execution.id,
                ExecutionPatch {
                    error_message: Some("something else".to_string()),
                    ..Default::default()
                },
            )
            .await
    );
    assert!(matches!(rewrite_error, EngineError::InvalidStateTransition { .. }));
}

#[tokio::test]
async fn test_update_to_cancelled_signals_workflow_state() {
    let h = harness().await;
    let execution = h.start("user-1").await;

    let cancelled = h
        .service
        .update(
            &h.scope,
            &execution.id,
            ExecutionPatch {
                status: Some(ExecutionStatus::Cancelled),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_completed_at_matches_status(&cancelled);

    wait_for_phase(
        &h.states,
        execution.workflow_state_id().unwrap(),
        WorkflowPhase::Cancelled,
    )
    .await;
}

#[tokio::test]
async fn test_failed_audit_write_rolls_back_state() {
    let h = harness().await;
    let execution = h.start("user-1").await;

    sqlx::query("DROP TABLE audit_log")
        .execute(&h.pool)
        .await
        .unwrap();

    let err = assert_err!(h.service.cancel(&h.scope, &execution.id, "user-2").await);
    assert!(matches!(err, EngineError::Store(_)));
    let after_cancel = h.service.get_one_or_throw(&h.scope, &execution.id).await.unwrap();
    assert_eq!(after_cancel, execution);

    let err = assert_err!(
        h.service
            .update(
                &h.scope,
                &execution.id,
                ExecutionPatch {
                    metadata: json!({"note": "x"}).as_object().cloned(),
                    ..Default::default()
                },
            )
            .await
    );
    assert!(matches!(err, EngineError::Store(_)));
    assert_eq!(
        h.service.get_one_or_throw(&h.scope, &execution.id).await.unwrap(),
        execution
    );

    let err = assert_err!(
        h.service
            .create(
                &h.scope,
                CreateExecution {
                    actor_id: "user-1".to_string(),
                    process_id: h.process_id.clone(),
                    ..Default::default()
                },
            )
            .await
    );
    assert!(matches!(err, EngineError::Store(_)));
    assert_eq!(h.execution_count().await, 1);
    // only the committed run keeps a handle
    assert_eq!(h.states.len().await, 1);
    assert!(h
        .states
        .get_state(&WorkflowHandle(execution.workflow_state_id().unwrap().to_string()))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_failed_audit_write_leaves_workflow_step_unchanged() {
    let h = harness().await;
    let execution = h.start("user-1").await;
    let handle = WorkflowHandle(execution.workflow_state_id().unwrap().to_string());

    sqlx::query("DROP TABLE audit_log")
        .execute(&h.pool)
        .await
        .unwrap();

    let err = assert_err!(
        h.service
            .advance(&h.scope, &execution.id, "user-1", "resolve")
            .await
    );
    assert!(matches!(err, EngineError::Store(_)));

    let state = h.states.get_state(&handle).await.unwrap().unwrap();
    assert_eq!(state.current_step_id, None);
    assert!(state.history.is_empty());
    assert_eq!(
        h.service.get_one_or_throw(&h.scope, &execution.id).await.unwrap(),
        execution
    );
}

#[tokio::test]
async fn test_finished_runs_release_workflow_state() {
    let h = harness().await;
    let completed = h.start("user-1").await;
    let failed = h.start("user-1").await;

    h.service
        .update(
            &h.scope,
            &completed.id,
            ExecutionPatch {
                status: Some(ExecutionStatus::Completed),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    h.fail(&failed.id).await;

    for execution in [&completed, &failed] {
        wait_for_release(&h.states, execution.workflow_state_id().unwrap()).await;
    }
    assert_eq!(h.states.len().await, 0);
}

#[tokio::test]
async fn test_get_is_scoped_and_stable() {
    let h = harness().await;
    let execution = h.start("user-1").await;

    let first = h.service.get_one_or_throw(&h.scope, &execution.id).await.unwrap();
    let second = h.service.get_one_or_throw(&h.scope, &execution.id).await.unwrap();
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );

    let other = Scope::project("proj-2");
    let err = assert_err!(h.service.get_one_or_throw(&other, &execution.id).await);
    assert!(matches!(err, EngineError::NotFound { .. }));
    let err = assert_err!(h.service.cancel(&other, &execution.id, "user-2").await);
    assert!(matches!(err, EngineError::NotFound { .. }));
}

#[tokio::test]
async fn test_list_paginates_by_creation_time() {
    let h = harness().await;
    let base = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
    for (i, id) in ["oldest", "middle", "newest"].iter().enumerate() {
        let execution =
            execution_at(&h.scope, &h.process_id, id, base + ChronoDuration::minutes(i as i64));
        db::executions::insert_execution(&h.pool, &execution).await.unwrap();
    }

    let mut filters = ExecutionFilters {
        limit: Some(2),
        ..Default::default()
    };
    let page = h
        .service
        .list(&h.scope, &filters, SortDirection::Desc)
        .await
        .unwrap();
    let ids: Vec<&str> = page.items.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["newest", "middle"]);
    let next = page.next.clone().unwrap();
    assert_eq!(next.created_at, base);
    assert_eq!(next.id, "oldest");

    filters.cursor = page.next;
    let page = h
        .service
        .list(&h.scope, &filters, SortDirection::Desc)
        .await
        .unwrap();
    let ids: Vec<&str> = page.items.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["oldest"]);
    assert_eq!(page.next, None);

    let ascending = h
        .service
        .list(
            &h.scope,
            &ExecutionFilters {
                limit: Some(2),
                ..Default::default()
            },
            SortDirection::Asc,
        )
        .await
        .unwrap();
    let ids: Vec<&str> = ascending.items.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["oldest", "middle"]);
    assert_eq!(
        ascending.next.map(|cursor| cursor.created_at),
        Some(base + ChronoDuration::minutes(2))
    );
}

/// Follow `next` until the last page, returning ids in page order
async fn walk_pages(h: &Harness, limit: u32, direction: SortDirection) -> Vec<String> {
    let mut filters = ExecutionFilters {
        limit: Some(limit),
        ..Default::default()
    };
    let mut seen = Vec::new();
    for _ in 0..10 {
        let page = h.service.list(&h.scope, &filters, direction).await.unwrap();
        seen.extend(page.items.into_iter().map(|e| e.id));
        match page.next {
            Some(next) => filters.cursor = Some(next),
            None => return seen,
        }
    }
    panic!("pagination did not terminate, saw {:?}", seen);
}

#[tokio::test]
async fn test_list_pages_through_rows_created_in_the_same_millisecond() {
    let h = harness().await;
    let created_at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
    for id in ["a", "b", "c"] {
        let execution = execution_at(&h.scope, &h.process_id, id, created_at);
        db::executions::insert_execution(&h.pool, &execution).await.unwrap();
    }

    assert_eq!(walk_pages(&h, 1, SortDirection::Desc).await, vec!["c", "b", "a"]);
    assert_eq!(walk_pages(&h, 1, SortDirection::Asc).await, vec!["a", "b", "c"]);
    assert_eq!(walk_pages(&h, 2, SortDirection::Desc).await, vec!["c", "b", "a"]);
}

#[tokio::test]
async fn test_list_filters_and_limits() {
    let h = harness().await;
    let running = h.start("user-1").await;
    let failed = h.start("user-2").await;
    h.fail(&failed.id).await;

    let by_status = h
        .service
        .list(
            &h.scope,
            &ExecutionFilters {
                statuses: vec![ExecutionStatus::Failed, ExecutionStatus::Cancelled],
                ..Default::default()
            },
            SortDirection::Desc,
        )
        .await
        .unwrap();
    assert_eq!(by_status.items.len(), 1);
    assert_eq!(by_status.items[0].id, failed.id);

    let by_actor = h
        .service
        .list(
            &h.scope,
            &ExecutionFilters {
                actor_id: Some("user-1".to_string()),
                process_id: Some(h.process_id.clone()),
                ..Default::default()
            },
            SortDirection::Desc,
        )
        .await
        .unwrap();
    assert_eq!(by_actor.items.len(), 1);
    assert_eq!(by_actor.items[0].id, running.id);

    let other = h
        .service
        .list(&Scope::project("proj-2"), &ExecutionFilters::default(), SortDirection::Desc)
        .await
        .unwrap();
    assert!(other.items.is_empty());

    for limit in [0, 101] {
        let err = assert_err!(
            h.service
                .list(
                    &h.scope,
                    &ExecutionFilters {
                        limit: Some(limit),
                        ..Default::default()
                    },
                    SortDirection::Desc,
                )
                .await
        );
        assert!(matches!(err, EngineError::Validation(_)));
    }
}

#[tokio::test]
async fn test_advance_moves_to_active_step() {
    let h = harness().await;
    let execution = h.start("user-1").await;

    let advanced = h
        .service
        .advance(&h.scope, &execution.id, "user-1", "resolve")
        .await
        .unwrap();
    assert_eq!(advanced.status, ExecutionStatus::Running);
    assert_eq!(advanced.metadata[meta::CURRENT_STEP_ID], json!("resolve"));

    let state = h
        .states
        .get_state(&WorkflowHandle(execution.workflow_state_id().unwrap().to_string()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.current_step_id.as_deref(), Some("resolve"));

    let step_entries = h
        .service
        .list_audit_entries(
            &h.scope,
            &AuditFilter {
                entity: Some(AuditEntity::Step("resolve".to_string())),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(step_entries.len(), 1);
    assert_eq!(step_entries[0].action, AuditAction::Advance);

    let inactive = assert_err!(
        h.service
            .advance(&h.scope, &execution.id, "user-1", "postmortem")
            .await
    );
    assert!(matches!(inactive, EngineError::Validation(_)));
    let unknown = assert_err!(
        h.service
            .advance(&h.scope, &execution.id, "user-1", "nope")
            .await
    );
    assert!(matches!(unknown, EngineError::Validation(_)));

    h.service.cancel(&h.scope, &execution.id, "user-1").await.unwrap();
    let stopped = assert_err!(
        h.service
            .advance(&h.scope, &execution.id, "user-1", "triage")
            .await
    );
    assert!(matches!(stopped, EngineError::InvalidStateTransition { .. }));
}

#[tokio::test]
async fn test_get_logs_merges_audit_and_workflow_state() {
    let h = harness().await;
    let execution = h.start("user-1").await;
    h.service
        .advance(&h.scope, &execution.id, "user-1", "resolve")
        .await
        .unwrap();
    h.service.cancel(&h.scope, &execution.id, "user-2").await.unwrap();
    wait_for_phase(
        &h.states,
        execution.workflow_state_id().unwrap(),
        WorkflowPhase::Cancelled,
    )
    .await;

    let logs = h
        .service
        .get_logs(&h.scope, &execution.id, None, 0)
        .await
        .unwrap();

    // execute, advance, cancel + initialization and last transition
    assert_eq!(logs.total, 5);
    assert!(logs
        .logs
        .windows(2)
        .all(|pair| pair[0].timestamp >= pair[1].timestamp));

    let audit_actions: Vec<&str> = logs
        .logs
        .iter()
        .filter(|entry| entry.source == LogSource::AuditLog)
        .map(|entry| entry.action.as_str())
        .collect();
    assert_eq!(audit_actions.len(), 3);
    for action in ["execute", "advance", "cancel"] {
        assert!(audit_actions.contains(&action));
    }

    let cancelled = logs
        .logs
        .iter()
        .find(|entry| entry.action == "workflow_cancelled")
        .unwrap();
    assert_eq!(cancelled.level, LogLevel::Warn);
    assert_eq!(cancelled.source, LogSource::WorkflowState);
    assert_eq!(cancelled.actor_id.as_deref(), Some("user-2"));
    assert!(logs
        .logs
        .iter()
        .any(|entry| entry.action == "workflow_initialized" && entry.level == LogLevel::Info));

    let page = h
        .service
        .get_logs(&h.scope, &execution.id, Some(2), 1)
        .await
        .unwrap();
    assert_eq!(page.total, 5);
    assert_eq!(page.logs, logs.logs[1..3].to_vec());

    let err = assert_err!(
        h.service
            .get_logs(&h.scope, &execution.id, Some(1001), 0)
            .await
    );
    assert!(matches!(err, EngineError::Validation(_)));
    let err = assert_err!(h.service.get_logs(&h.scope, "nope", None, 0).await);
    assert!(matches!(err, EngineError::NotFound { .. }));
}

/// Provider whose state can be created but never read back
struct UnreadableStates;

#[async_trait]
impl WorkflowStateProvider for UnreadableStates {
    async fn initialize(
        &self,
        _process_id: &str,
        _actor_id: &str,
        _input_data: &JsonValue,
    ) -> Result<WorkflowHandle, WorkflowStateError> {
        Ok(WorkflowHandle("wfs_unreadable".to_string()))
    }

    async fn advance(&self, _: &WorkflowHandle, _: &str) -> Result<(), WorkflowStateError> {
        Ok(())
    }

    async fn cancel(&self, _: &WorkflowHandle, _: &str, _: &str) -> Result<(), WorkflowStateError> {
        Ok(())
    }

    async fn get_state(
        &self,
        _: &WorkflowHandle,
    ) -> Result<Option<WorkflowState>, WorkflowStateError> {
        Err(WorkflowStateError::Unavailable("connection refused".to_string()))
    }

    async fn release(&self, _: &WorkflowHandle) -> Result<(), WorkflowStateError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_get_logs_falls_back_to_audit_entries() {
    let h = harness().await;
    let service = ExecutionService::new(
        h.pool.clone(),
        Arc::new(SqlProcessCatalog::new(h.pool.clone())),
        Arc::new(UnreadableStates),
        EngineConfig::default(),
    );

    let execution = service
        .create(
            &h.scope,
            CreateExecution {
                actor_id: "user-1".to_string(),
                process_id: h.process_id.clone(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    service
        .update(
            &h.scope,
            &execution.id,
            ExecutionPatch {
                status: Some(ExecutionStatus::Failed),
                error_message: Some("validation_error in step".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let logs = service
        .get_logs(&h.scope, &execution.id, None, 0)
        .await
        .unwrap();
    assert_eq!(logs.total, 2);
    assert!(logs
        .logs
        .iter()
        .all(|entry| entry.source == LogSource::AuditLog));
}

#[tokio::test]
async fn test_completed_at_tracks_terminal_status() {
    let h = harness().await;

    let running = h.start("user-1").await;
    assert_completed_at_matches_status(&running);

    let failed = h.fail(&running.id).await;
    assert_completed_at_matches_status(&failed);

    let retried = h.service.retry(&h.scope, &running.id, "user-1").await.unwrap();
    assert_completed_at_matches_status(&retried);

    let cancelled = h.service.cancel(&h.scope, &retried.id, "user-1").await.unwrap();
    assert_completed_at_matches_status(&cancelled);

    let page = h
        .service
        .list(&h.scope, &ExecutionFilters::default(), SortDirection::Desc)
        .await
        .unwrap();
    for execution in &page.items {
        assert_completed_at_matches_status(execution);
    }
}
