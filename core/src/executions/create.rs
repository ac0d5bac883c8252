use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use super::{conflict_on_unique, json_object, log_failure, validate_retry, ExecutionService};
use crate::db;
use crate::error::{EngineError, EngineResult};
use crate::steps::StepTree;
use crate::types::{
    meta, now, AuditAction, AuditEntity, Execution, ExecutionStatus, JsonMap, NewAuditEntry,
    ProcessDefinition, ProcessStatus, Scope,
};
use crate::workflow_state::WorkflowHandle;

/// Parameters for starting a run of a process definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateExecution {
    pub actor_id: String,
    pub process_id: String,
    #[serde(default)]
    pub input_data: Option<JsonValue>,
    #[serde(default)]
    pub metadata: Option<JsonMap>,
}

/// Everything `start_run` needs besides the scope
struct NewRun {
    process: ProcessDefinition,
    actor_id: String,
    input_data: JsonValue,
    metadata: JsonMap,
    retry_of: Option<String>,
    action: AuditAction,
    description: String,
    audit_metadata: JsonMap,
}

/// Caller-owned metadata, without the keys describing a particular run
fn user_metadata(metadata: &JsonMap) -> JsonMap {
    metadata
        .iter()
        .filter(|(key, _)| !meta::RUN_BOOKKEEPING.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

impl ExecutionService {
    /// Start a run of an active process definition
    ///
    /// The execution is inserted as `pending`, gets a workflow-state handle and
    /// is moved to `running` in the same transaction as its `execute` audit
    /// entry. If anything after initialization fails the handle is released.
    pub async fn create(&self, scope: &Scope, request: CreateExecution) -> EngineResult<Execution> {
        let process_id = request.process_id.clone();
        self.create_execution(scope, request).await.inspect_err(|err| {
            tracing::warn!(
                operation = "create",
                process_id = %process_id,
                project_id = %scope.project_id,
                error = %err,
                "execution operation failed"
            )
        })
    }

    async fn create_execution(
        &self,
        scope: &Scope,
        request: CreateExecution,
    ) -> EngineResult<Execution> {
        if request.actor_id.trim().is_empty() {
            return Err(EngineError::validation("actorId must not be empty"));
        }
        if request.process_id.trim().is_empty() {
            return Err(EngineError::validation("processId must not be empty"));
        }

        let process = self.runnable_process(scope, &request.process_id).await?;
        let description = format!(
            "Started execution of process '{}' (version {})",
            process.name, process.version
        );
        let audit_metadata = json_object(json!({
            "processId": process.id,
            "processVersion": process.version,
        }));

        self.start_run(
            scope,
            NewRun {
                process,
                actor_id: request.actor_id,
                input_data: request.input_data.unwrap_or_else(|| json!({})),
                metadata: request.metadata.as_ref().map(user_metadata).unwrap_or_default(),
                retry_of: None,
                action: AuditAction::Execute,
                description,
                audit_metadata,
            },
        )
        .await
    }

    /// Start a new run from a failed or cancelled one
    ///
    /// The original is left untouched. Each execution can be retried once; the
    /// retry carries the original's input and caller metadata plus lineage.
    pub async fn retry(
        &self,
        scope: &Scope,
        execution_id: &str,
        actor_id: &str,
    ) -> EngineResult<Execution> {
        self.retry_execution(scope, execution_id, actor_id)
            .await
            .inspect_err(|err| log_failure("retry", execution_id, err))
    }

    async fn retry_execution(
        &self,
        scope: &Scope,
        execution_id: &str,
        actor_id: &str,
    ) -> EngineResult<Execution> {
        let original = self.fetch_execution(scope, execution_id).await?;
        validate_retry(&original.id, original.status)?;

        if let Some(existing) = db::executions::find_retry_of(&self.pool, &original.id).await? {
            return Err(EngineError::Conflict(format!(
                "execution {} has already been retried as {}",
                original.id, existing
            )));
        }

        let process = self.runnable_process(scope, &original.process_id).await?;
        let attempt = original.retry_attempt() + 1;

        let mut metadata = user_metadata(&original.metadata);
        metadata.insert(meta::IS_RETRY.to_string(), json!(true));
        metadata.insert(meta::ORIGINAL_EXECUTION_ID.to_string(), json!(original.id));
        metadata.insert(meta::RETRY_ATTEMPT.to_string(), json!(attempt));

        let audit_metadata = json_object(json!({
            "processId": process.id,
            "processVersion": process.version,
            "originalExecutionId": original.id,
            "originalStatus": original.status.as_str(),
            "retryAttempt": attempt,
        }));

        self.start_run(
            scope,
            NewRun {
                process,
                actor_id: actor_id.to_string(),
                input_data: original.input_data.clone(),
                metadata,
                retry_of: Some(original.id.clone()),
                action: AuditAction::Retry,
                description: format!("Retried execution {} (attempt {})", original.id, attempt),
                audit_metadata,
            },
        )
        .await
    }

    /// Definition for a new run; must be active with at least one active step
    async fn runnable_process(
        &self,
        scope: &Scope,
        process_id: &str,
    ) -> EngineResult<ProcessDefinition> {
        let process = self
            .catalog
            .find_process(scope, process_id)
            .await?
            .ok_or_else(|| EngineError::not_found("process definition", process_id))?;

        if process.status != ProcessStatus::Active {
            return Err(EngineError::PreconditionFailed(format!(
                "Process {} is {} and cannot be executed",
                process.id,
                process.status.as_str()
            )));
        }
        if StepTree::build(process.steps.clone())?.active_steps().is_empty() {
            return Err(EngineError::PreconditionFailed(format!(
                "Process {} has no active steps",
                process.id
            )));
        }

        Ok(process)
    }

    async fn start_run(&self, scope: &Scope, run: NewRun) -> EngineResult<Execution> {
        let NewRun {
            process,
            actor_id,
            input_data,
            metadata,
            retry_of,
            action,
            description,
            mut audit_metadata,
        } = run;

        let created_at = now();
        let mut execution = Execution {
            id: Uuid::new_v4().to_string(),
            project_id: scope.project_id.clone(),
            process_id: process.id,
            process_version: process.version,
            status: ExecutionStatus::Pending,
            actor_id,
            input_data,
            output_data: None,
            error_message: None,
            metadata,
            retry_of,
            revision: 0,
            started_at: None,
            completed_at: None,
            created_at,
            updated_at: created_at,
        };

        let mut tx = self.pool.begin().await?;
        db::executions::insert_execution(&mut *tx, &execution)
            .await
            .map_err(|err| {
                conflict_on_unique(err, || {
                    format!(
                        "execution {} has already been retried",
                        execution.retry_of.as_deref().unwrap_or_default()
                    )
                })
            })?;

        let handle = self
            .states
            .initialize(
                &execution.process_id,
                &execution.actor_id,
                &execution.input_data,
            )
            .await?;

        let result: EngineResult<()> = async {
            let started_at = now();
            execution.status = ExecutionStatus::Running;
            execution.started_at = Some(started_at);
            execution.updated_at = started_at;
            execution
                .metadata
                .insert(meta::WORKFLOW_STATE_ID.to_string(), json!(handle.as_str()));

            let mut tx = self
                .write_revision(
                    tx,
                    &mut execution,
                    ExecutionStatus::Pending,
                    ExecutionStatus::Running,
                )
                .await?;

            audit_metadata.insert(meta::WORKFLOW_STATE_ID.to_string(), json!(handle.as_str()));
            db::audit_log::insert_entry(
                &mut *tx,
                NewAuditEntry {
                    entity: AuditEntity::Execution(execution.id.clone()),
                    action,
                    actor_id: execution.actor_id.clone(),
                    project_id: execution.project_id.clone(),
                    execution_id: Some(execution.id.clone()),
                    description,
                    metadata: audit_metadata,
                },
                started_at,
            )
            .await?;

            tx.commit().await?;
            Ok(())
        }
        .await;

        if let Err(err) = result {
            self.release_handle(&handle, &execution).await;
            return Err(err);
        }

        tracing::info!(
            execution_id = %execution.id,
            process_id = %execution.process_id,
            project_id = %execution.project_id,
            action = action.as_str(),
            "execution started"
        );
        Ok(execution)
    }

    /// Drop a handle whose execution never committed
    async fn release_handle(&self, handle: &WorkflowHandle, execution: &Execution) {
        if let Err(err) = self.states.release(handle).await {
            tracing::warn!(
                execution_id = %execution.id,
                %handle,
                error = %err,
                "failed to release workflow state"
            );
        }
    }
}
