// Execution lifecycle management
//
// Every state-changing operation writes the execution row and exactly one
// audit entry inside a single transaction:
// - create / retry start a run and initialize its workflow state
// - update / cancel / advance move an existing run
// - queries read executions and their merged logs

mod create;
mod lifecycle;
mod query;
mod transitions;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::catalog::ProcessCatalog;
use crate::config::EngineConfig;
use crate::db;
use crate::error::{EngineError, EngineResult};
use crate::types::{Execution, ExecutionStatus, Scope};
use crate::workflow_state::{WorkflowHandle, WorkflowStateProvider};

pub use create::CreateExecution;
pub use transitions::{can_retry, can_transition, validate_retry, validate_transition};

/// Entry point for everything that reads or moves executions
#[derive(Clone)]
pub struct ExecutionService {
    pool: SqlitePool,
    catalog: Arc<dyn ProcessCatalog>,
    states: Arc<dyn WorkflowStateProvider>,
    limits: EngineConfig,
}

impl ExecutionService {
    pub fn new(
        pool: SqlitePool,
        catalog: Arc<dyn ProcessCatalog>,
        states: Arc<dyn WorkflowStateProvider>,
        limits: EngineConfig,
    ) -> Self {
        Self {
            pool,
            catalog,
            states,
            limits,
        }
    }

    /// Load an execution inside a transaction, NotFound if absent or out of scope
    async fn load_for_update(
        tx: &mut Transaction<'_, Sqlite>,
        scope: &Scope,
        execution_id: &str,
    ) -> EngineResult<Execution> {
        db::executions::get_execution(&mut **tx, scope, execution_id)
            .await?
            .ok_or_else(|| EngineError::not_found("execution", execution_id))
    }

    /// Compare-and-set write of `execution`, bumping its revision
    ///
    /// When another writer moved the row first, the transaction is rolled back
    /// and the error reflects the row as it is now: `InvalidStateTransition` if
    /// its new status rules out `observed -> attempted`, `Conflict` otherwise.
    async fn write_revision<'c>(
        &self,
        mut tx: Transaction<'c, Sqlite>,
        execution: &mut Execution,
        observed: ExecutionStatus,
        attempted: ExecutionStatus,
    ) -> EngineResult<Transaction<'c, Sqlite>> {
        let expected = execution.revision;
        execution.revision += 1;

        if db::executions::update_execution(&mut *tx, execution, expected).await? {
            return Ok(tx);
        }

        tx.rollback().await?;
        let scope = Scope::project(execution.project_id.clone());
        let current = db::executions::get_execution(&self.pool, &scope, &execution.id)
            .await?
            .ok_or_else(|| EngineError::not_found("execution", execution.id.clone()))?;

        if current.status != observed && !can_transition(current.status, attempted) {
            return Err(EngineError::InvalidStateTransition {
                execution_id: current.id,
                from: current.status,
                to: attempted,
            });
        }
        Err(EngineError::Conflict(format!(
            "execution {} changed while it was being written",
            execution.id
        )))
    }

    /// Ask the workflow state to stop without waiting for it
    fn signal_cancel(&self, execution: &Execution, reason: String, actor_id: String) {
        let Some(handle) = execution.workflow_state_id() else {
            return;
        };
        let handle = WorkflowHandle(handle.to_string());
        let states = Arc::clone(&self.states);
        let execution_id = execution.id.clone();

        tokio::spawn(async move {
            match states.cancel(&handle, &reason, &actor_id).await {
                Ok(()) => tracing::debug!(%execution_id, %handle, "workflow state cancelled"),
                Err(err) => tracing::warn!(
                    %execution_id,
                    %handle,
                    error = %err,
                    "failed to cancel workflow state"
                ),
            }
        });
    }

    /// Let the provider drop the state of a run that completed or failed
    fn signal_release(&self, execution: &Execution) {
        let Some(handle) = execution.workflow_state_id() else {
            return;
        };
        let handle = WorkflowHandle(handle.to_string());
        let states = Arc::clone(&self.states);
        let execution_id = execution.id.clone();

        tokio::spawn(async move {
            if let Err(err) = states.release(&handle).await {
                tracing::warn!(
                    %execution_id,
                    %handle,
                    error = %err,
                    "failed to release workflow state"
                );
            }
        });
    }
}

fn json_object(value: serde_json::Value) -> crate::types::JsonMap {
    match value {
        serde_json::Value::Object(map) => map,
        _ => crate::types::JsonMap::new(),
    }
}

fn log_failure(operation: &'static str, execution_id: &str, err: &EngineError) {
    if err.is_expected() {
        tracing::warn!(operation, execution_id, error = %err, "execution operation rejected");
    } else {
        tracing::warn!(operation, execution_id, error = %err, "execution operation failed");
    }
}

/// Map a unique-index violation on insert to `Conflict`
fn conflict_on_unique(err: EngineError, message: impl FnOnce() -> String) -> EngineError {
    let unique_violation = matches!(
        &err,
        EngineError::Store(sqlx::Error::Database(db_err)) if db_err.is_unique_violation()
    );
    if unique_violation {
        EngineError::Conflict(message())
    } else {
        err
    }
}
