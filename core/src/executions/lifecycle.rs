use serde_json::json;

use super::{json_object, log_failure, validate_transition, ExecutionService};
use crate::db;
use crate::error::{EngineError, EngineResult};
use crate::steps::StepTree;
use crate::types::{
    meta, now, AuditAction, AuditEntity, Execution, ExecutionPatch, ExecutionStatus,
    NewAuditEntry, Scope,
};
use crate::workflow_state::WorkflowHandle;

impl ExecutionService {
    /// Apply a partial update to an execution
    ///
    /// A status in the patch must be a legal successor of the current one;
    /// repeating the current status is a no-op for that field. Metadata is
    /// merged key by key. `outputData` is only accepted when the resulting
    /// status is `completed`. Terminal executions take metadata-only patches.
    pub async fn update(
        &self,
        scope: &Scope,
        execution_id: &str,
        patch: ExecutionPatch,
    ) -> EngineResult<Execution> {
        self.update_execution(scope, execution_id, patch)
            .await
            .inspect_err(|err| log_failure("update", execution_id, err))
    }

    async fn update_execution(
        &self,
        scope: &Scope,
        execution_id: &str,
        patch: ExecutionPatch,
    ) -> EngineResult<Execution> {
        if patch.is_empty() {
            return Err(EngineError::validation(
                "Update must change at least one of status, outputData, errorMessage, metadata",
            ));
        }

        let mut tx = self.pool.begin().await?;
        let mut execution = Self::load_for_update(&mut tx, scope, execution_id).await?;
        let observed = execution.status;

        let target = patch.status.filter(|status| *status != observed);
        if let Some(to) = target {
            validate_transition(&execution.id, observed, to)?;
        } else if observed.is_terminal()
            && (patch.output_data.is_some() || patch.error_message.is_some())
        {
            return Err(EngineError::InvalidStateTransition {
                execution_id: execution.id,
                from: observed,
                to: observed,
            });
        }

        let resulting = target.unwrap_or(observed);
        if patch.output_data.is_some() && resulting != ExecutionStatus::Completed {
            return Err(EngineError::validation(format!(
                "outputData can only be set on a completed execution, status would be {}",
                resulting
            )));
        }

        let updated_at = now();
        let mut changed_fields = Vec::new();

        if let Some(to) = target {
            execution.status = to;
            if to.is_terminal() {
                execution.completed_at = Some(updated_at);
            }
            changed_fields.push("status");
        }
        if let Some(output) = patch.output_data {
            execution.output_data = Some(output);
            changed_fields.push("outputData");
        }
        if let Some(message) = patch.error_message {
            execution.error_message = Some(message);
            changed_fields.push("errorMessage");
        }
        if let Some(metadata) = patch.metadata {
            execution.metadata.extend(metadata);
            changed_fields.push("metadata");
        }
        execution.updated_at = updated_at;

        let mut tx = self
            .write_revision(tx, &mut execution, observed, resulting)
            .await?;

        let description = match target {
            Some(to) => format!("Updated execution: status {} -> {}", observed, to),
            None => format!("Updated execution: {}", changed_fields.join(", ")),
        };
        db::audit_log::insert_entry(
            &mut *tx,
            NewAuditEntry {
                entity: AuditEntity::Execution(execution.id.clone()),
                action: AuditAction::Update,
                actor_id: execution.actor_id.clone(),
                project_id: execution.project_id.clone(),
                execution_id: Some(execution.id.clone()),
                description,
                metadata: json_object(json!({
                    "changedFields": changed_fields,
                    "previousStatus": observed.as_str(),
                    "status": execution.status.as_str(),
                })),
            },
            updated_at,
        )
        .await?;
        tx.commit().await?;

        match target {
            Some(ExecutionStatus::Cancelled) => self.signal_cancel(
                &execution,
                "execution cancelled by update".to_string(),
                execution.actor_id.clone(),
            ),
            Some(ExecutionStatus::Completed | ExecutionStatus::Failed) => {
                self.signal_release(&execution)
            }
            _ => {}
        }

        tracing::info!(
            execution_id = %execution.id,
            status = execution.status.as_str(),
            fields = ?changed_fields,
            "execution updated"
        );
        Ok(execution)
    }

    /// Cancel a pending or running execution
    ///
    /// The record is cancelled synchronously; the workflow state is signalled
    /// after commit and may stop later or not at all.
    pub async fn cancel(
        &self,
        scope: &Scope,
        execution_id: &str,
        actor_id: &str,
    ) -> EngineResult<Execution> {
        self.cancel_execution(scope, execution_id, actor_id)
            .await
            .inspect_err(|err| log_failure("cancel", execution_id, err))
    }

    async fn cancel_execution(
        &self,
        scope: &Scope,
        execution_id: &str,
        actor_id: &str,
    ) -> EngineResult<Execution> {
        let mut tx = self.pool.begin().await?;
        let mut execution = Self::load_for_update(&mut tx, scope, execution_id).await?;
        let observed = execution.status;
        validate_transition(&execution.id, observed, ExecutionStatus::Cancelled)?;

        let cancelled_at = now();
        let reason = format!("cancelled by {}", actor_id);
        execution.status = ExecutionStatus::Cancelled;
        execution.error_message = Some(reason.clone());
        execution.completed_at = Some(cancelled_at);
        execution.updated_at = cancelled_at;

        let mut tx = self
            .write_revision(tx, &mut execution, observed, ExecutionStatus::Cancelled)
            .await?;

        db::audit_log::insert_entry(
            &mut *tx,
            NewAuditEntry {
                entity: AuditEntity::Execution(execution.id.clone()),
                action: AuditAction::Cancel,
                actor_id: actor_id.to_string(),
                project_id: execution.project_id.clone(),
                execution_id: Some(execution.id.clone()),
                description: format!("Execution {}", reason),
                metadata: json_object(json!({
                    "previousStatus": observed.as_str(),
                    "workflowStateId": execution.workflow_state_id(),
                })),
            },
            cancelled_at,
        )
        .await?;
        tx.commit().await?;

        self.signal_cancel(&execution, reason, actor_id.to_string());

        tracing::info!(
            execution_id = %execution.id,
            actor_id,
            previous_status = observed.as_str(),
            "execution cancelled"
        );
        Ok(execution)
    }

    /// Move a running execution to another step of its process
    ///
    /// The step must exist and be active in the definition's tree. The
    /// workflow state is advanced once the record and its audit entry are
    /// written, right before commit; a refused advance rolls both back.
    pub async fn advance(
        &self,
        scope: &Scope,
        execution_id: &str,
        actor_id: &str,
        step_id: &str,
    ) -> EngineResult<Execution> {
        self.advance_execution(scope, execution_id, actor_id, step_id)
            .await
            .inspect_err(|err| log_failure("advance", execution_id, err))
    }

    async fn advance_execution(
        &self,
        scope: &Scope,
        execution_id: &str,
        actor_id: &str,
        step_id: &str,
    ) -> EngineResult<Execution> {
        let snapshot = self.fetch_execution(scope, execution_id).await?;
        let process = self
            .catalog
            .find_process(scope, &snapshot.process_id)
            .await?
            .ok_or_else(|| EngineError::not_found("process definition", &snapshot.process_id))?;
        let tree = StepTree::build(process.steps)?;
        let step = tree.get(step_id).ok_or_else(|| {
            EngineError::validation(format!(
                "Step {} does not belong to process {}",
                step_id, snapshot.process_id
            ))
        })?;
        if !tree.active_steps().iter().any(|active| active.id == step.id) {
            return Err(EngineError::validation(format!(
                "Step {} is not active",
                step_id
            )));
        }
        let step_name = step.name.clone();

        let mut tx = self.pool.begin().await?;
        let mut execution = Self::load_for_update(&mut tx, scope, execution_id).await?;
        let observed = execution.status;
        if observed != ExecutionStatus::Running {
            return Err(EngineError::InvalidStateTransition {
                execution_id: execution.id,
                from: observed,
                to: ExecutionStatus::Running,
            });
        }

        let handle = execution
            .workflow_state_id()
            .map(|id| WorkflowHandle(id.to_string()))
            .ok_or_else(|| {
                EngineError::PreconditionFailed(format!(
                    "Execution {} has no workflow state",
                    execution.id
                ))
            })?;

        let advanced_at = now();
        let previous_step = execution.metadata.get(meta::CURRENT_STEP_ID).cloned();
        execution
            .metadata
            .insert(meta::CURRENT_STEP_ID.to_string(), json!(step_id));
        execution.updated_at = advanced_at;

        let mut tx = self
            .write_revision(tx, &mut execution, observed, observed)
            .await?;

        db::audit_log::insert_entry(
            &mut *tx,
            NewAuditEntry {
                entity: AuditEntity::Step(step_id.to_string()),
                action: AuditAction::Advance,
                actor_id: actor_id.to_string(),
                project_id: execution.project_id.clone(),
                execution_id: Some(execution.id.clone()),
                description: format!("Advanced to step '{}'", step_name),
                metadata: json_object(json!({
                    "previousStepId": previous_step,
                    "stepId": step_id,
                    "workflowStateId": handle.as_str(),
                })),
            },
            advanced_at,
        )
        .await?;

        self.states.advance(&handle, step_id).await?;
        tx.commit().await?;

        tracing::info!(execution_id = %execution.id, step_id, "execution advanced");
        Ok(execution)
    }
}
