use std::cmp::Reverse;

use serde_json::json;

use super::{json_object, log_failure, ExecutionService};
use crate::db;
use crate::error::{EngineError, EngineResult};
use crate::types::{
    AuditFilter, AuditLogEntry, Execution, ExecutionFilters, ExecutionLogEntry, ExecutionLogs,
    ExecutionPage, LogLevel, LogSource, PageCursor, Scope, SortDirection,
};
use crate::workflow_state::{WorkflowHandle, WorkflowState};

/// Reject a page size outside `1..=max`
fn check_limit(limit: u32, max: u32, what: &str) -> EngineResult<u32> {
    if limit == 0 || limit > max {
        return Err(EngineError::validation(format!(
            "{} limit must be between 1 and {}, got {}",
            what, max, limit
        )));
    }
    Ok(limit)
}

fn audit_log_entry(entry: AuditLogEntry) -> ExecutionLogEntry {
    let action = entry.action.as_str();
    ExecutionLogEntry {
        id: entry.id,
        timestamp: entry.created_at,
        level: LogLevel::from_action(action),
        action: action.to_string(),
        message: entry.description,
        actor_id: Some(entry.actor_id),
        source: LogSource::AuditLog,
        metadata: entry.metadata,
    }
}

/// Initialization event and last transition of a workflow state
fn workflow_log_entries(state: &WorkflowState) -> Vec<ExecutionLogEntry> {
    let mut entries = vec![ExecutionLogEntry {
        id: format!("{}:initialized", state.handle),
        timestamp: state.initialized_at,
        level: LogLevel::Info,
        action: "workflow_initialized".to_string(),
        message: format!("Workflow state initialized for process {}", state.process_id),
        actor_id: Some(state.initialized_by.clone()),
        source: LogSource::WorkflowState,
        metadata: json_object(json!({ "workflowStateId": state.handle.as_str() })),
    }];

    if let Some(transition) = state.last_transition() {
        let action = if transition.event.starts_with("workflow_") {
            transition.event.clone()
        } else {
            format!("workflow_{}", transition.event)
        };
        let message = match (&transition.reason, &transition.step_id) {
            (Some(reason), _) => reason.clone(),
            (None, Some(step_id)) => format!("Workflow moved to step {}", step_id),
            (None, None) => format!("Workflow event {}", transition.event),
        };

        entries.push(ExecutionLogEntry {
            id: format!("{}:transition:{}", state.handle, state.history.len()),
            timestamp: transition.at,
            level: LogLevel::from_action(&action),
            action,
            message,
            actor_id: transition.actor_id.clone(),
            source: LogSource::WorkflowState,
            metadata: json_object(json!({
                "workflowStateId": state.handle.as_str(),
                "stepId": transition.step_id,
                "phase": state.phase,
            })),
        });
    }

    entries
}

impl ExecutionService {
    /// Execution by id, without failure logging
    pub(super) async fn fetch_execution(
        &self,
        scope: &Scope,
        execution_id: &str,
    ) -> EngineResult<Execution> {
        db::executions::get_execution(&self.pool, scope, execution_id)
            .await?
            .ok_or_else(|| EngineError::not_found("execution", execution_id))
    }

    /// Get an execution, NotFound if it does not exist in `scope`
    pub async fn get_one_or_throw(&self, scope: &Scope, execution_id: &str) -> EngineResult<Execution> {
        self.fetch_execution(scope, execution_id)
            .await
            .inspect_err(|err| log_failure("get", execution_id, err))
    }

    /// One page of executions
    ///
    /// `next` points at the first row past this page; passing it back as
    /// `cursor` resumes there. Inserts never shift a page boundary, since rows
    /// are ordered by creation time and then id.
    pub async fn list(
        &self,
        scope: &Scope,
        filters: &ExecutionFilters,
        direction: SortDirection,
    ) -> EngineResult<ExecutionPage> {
        let limit = check_limit(
            filters.limit.unwrap_or(self.limits.default_page_size),
            self.limits.max_page_size,
            "List",
        )
        .inspect_err(|err| log_failure("list", "-", err))?;

        let mut items =
            db::executions::list_executions(&self.pool, scope, filters, direction, limit + 1)
                .await
                .inspect_err(|err| log_failure("list", "-", err))?;

        let next = if items.len() > limit as usize {
            let next = PageCursor::at(&items[limit as usize]);
            items.truncate(limit as usize);
            Some(next)
        } else {
            None
        };

        Ok(ExecutionPage { items, next })
    }

    /// Audit entries of an execution merged with its workflow-state events,
    /// newest first
    ///
    /// `total` counts all merged entries before `offset`/`limit` apply. If the
    /// workflow state cannot be read, only audit entries are returned.
    pub async fn get_logs(
        &self,
        scope: &Scope,
        execution_id: &str,
        limit: Option<u32>,
        offset: u32,
    ) -> EngineResult<ExecutionLogs> {
        self.execution_logs(scope, execution_id, limit, offset)
            .await
            .inspect_err(|err| log_failure("get_logs", execution_id, err))
    }

    async fn execution_logs(
        &self,
        scope: &Scope,
        execution_id: &str,
        limit: Option<u32>,
        offset: u32,
    ) -> EngineResult<ExecutionLogs> {
        let limit = check_limit(
            limit.unwrap_or(self.limits.max_log_page_size),
            self.limits.max_log_page_size,
            "Log",
        )?;
        let execution = self.fetch_execution(scope, execution_id).await?;

        let mut logs: Vec<ExecutionLogEntry> =
            db::audit_log::list_for_execution(&self.pool, scope, &execution.id)
                .await?
                .into_iter()
                .map(audit_log_entry)
                .collect();

        if let Some(handle) = execution.workflow_state_id() {
            let handle = WorkflowHandle(handle.to_string());
            match self.states.get_state(&handle).await {
                Ok(Some(state)) => logs.extend(workflow_log_entries(&state)),
                Ok(None) => {
                    tracing::debug!(execution_id, %handle, "workflow state no longer exists")
                }
                Err(err) => tracing::warn!(
                    execution_id,
                    %handle,
                    error = %err,
                    "workflow state unavailable, returning audit entries only"
                ),
            }
        }

        logs.sort_by_key(|entry| Reverse(entry.timestamp));
        let total = logs.len();
        let logs = logs
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();

        Ok(ExecutionLogs { logs, total })
    }

    /// Audit entries of the project, newest first
    pub async fn list_audit_entries(
        &self,
        scope: &Scope,
        filter: &AuditFilter,
    ) -> EngineResult<Vec<AuditLogEntry>> {
        let limit = check_limit(
            filter.limit.unwrap_or(self.limits.default_page_size),
            self.limits.max_log_page_size,
            "Audit",
        )?;

        db::audit_log::list_entries(&self.pool, scope, filter, limit)
            .await
            .inspect_err(|err| log_failure("list_audit_entries", "-", err))
    }
}
