//! Process definition authoring
//!
//! Definitions start as `draft`, where steps may be added. Activation freezes
//! the step tree; a version bump returns the definition to `draft` so it can be
//! edited again while earlier executions keep the version they ran against.

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db;
use crate::error::{EngineError, EngineResult};
use crate::steps::StepTree;
use crate::types::{now, NewStep, ProcessDefinition, ProcessStatus, Scope, Step};

#[derive(Clone)]
pub struct ProcessService {
    pool: SqlitePool,
}

fn step_from_new(process_id: &str, new_step: NewStep) -> EngineResult<Step> {
    if new_step.name.trim().is_empty() {
        return Err(EngineError::validation("Step name must not be empty"));
    }
    if new_step.step_type.trim().is_empty() {
        return Err(EngineError::validation("Step type must not be empty"));
    }

    Ok(Step {
        id: new_step.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        process_id: process_id.to_string(),
        parent_step_id: new_step.parent_step_id,
        name: new_step.name,
        step_type: new_step.step_type,
        position: new_step.position,
        config: new_step.config,
        is_active: new_step.is_active,
    })
}

impl ProcessService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a draft definition with an initial set of steps
    pub async fn create_definition(
        &self,
        scope: &Scope,
        name: &str,
        steps: Vec<NewStep>,
    ) -> EngineResult<ProcessDefinition> {
        if name.trim().is_empty() {
            return Err(EngineError::validation("Process name must not be empty"));
        }

        let process_id = Uuid::new_v4().to_string();
        let steps = steps
            .into_iter()
            .map(|s| step_from_new(&process_id, s))
            .collect::<EngineResult<Vec<_>>>()?;
        StepTree::build(steps.clone())?;

        let created_at = now();
        let process = ProcessDefinition {
            id: process_id,
            project_id: scope.project_id.clone(),
            name: name.to_string(),
            version: 1,
            status: ProcessStatus::Draft,
            steps,
            created_at,
            updated_at: created_at,
        };

        let mut tx = self.pool.begin().await?;
        db::process_definitions::insert_process(&mut *tx, &process).await?;
        for step in &process.steps {
            db::process_definitions::insert_step(&mut *tx, step).await?;
        }
        tx.commit().await?;

        tracing::info!(
            process_id = %process.id,
            project_id = %scope.project_id,
            steps = process.steps.len(),
            "process definition created"
        );
        Ok(process)
    }

    pub async fn get_definition(
        &self,
        scope: &Scope,
        process_id: &str,
    ) -> EngineResult<ProcessDefinition> {
        let mut conn = self.pool.acquire().await?;
        db::process_definitions::load_process(&mut *conn, scope, process_id)
            .await?
            .ok_or_else(|| EngineError::not_found("process definition", process_id))
    }

    /// Validated step tree of a definition
    pub async fn step_tree(&self, scope: &Scope, process_id: &str) -> EngineResult<StepTree> {
        let process = self.get_definition(scope, process_id).await?;
        StepTree::build(process.steps)
    }

    /// Add one step to a draft definition
    pub async fn add_step(
        &self,
        scope: &Scope,
        process_id: &str,
        new_step: NewStep,
    ) -> EngineResult<Step> {
        let step = step_from_new(process_id, new_step)?;

        let mut tx = self.pool.begin().await?;
        let process = db::process_definitions::load_process(&mut *tx, scope, process_id)
            .await?
            .ok_or_else(|| EngineError::not_found("process definition", process_id))?;
        if process.status != ProcessStatus::Draft {
            return Err(EngineError::PreconditionFailed(format!(
                "Process {} is {} and cannot be edited; bump its version first",
                process_id,
                process.status.as_str()
            )));
        }

        StepTree::build(process.steps)?.validate_insert(&step)?;
        db::process_definitions::insert_step(&mut *tx, &step).await?;
        tx.commit().await?;

        tracing::debug!(process_id, step_id = %step.id, "step added");
        Ok(step)
    }

    /// Make a draft definition runnable
    pub async fn activate(&self, scope: &Scope, process_id: &str) -> EngineResult<ProcessDefinition> {
        self.change_status(scope, process_id, |process| {
            if process.status != ProcessStatus::Draft {
                return Err(EngineError::PreconditionFailed(format!(
                    "Only draft processes can be activated, {} is {}",
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
            process.status = ProcessStatus::Active;
            Ok(())
        })
        .await
    }

    pub async fn archive(&self, scope: &Scope, process_id: &str) -> EngineResult<ProcessDefinition> {
        self.change_status(scope, process_id, |process| {
            process.status = ProcessStatus::Archived;
            Ok(())
        })
        .await
    }

    /// Return an active or archived definition to draft under a new version
    pub async fn bump_version(
        &self,
        scope: &Scope,
        process_id: &str,
    ) -> EngineResult<ProcessDefinition> {
        self.change_status(scope, process_id, |process| {
            if process.status == ProcessStatus::Draft {
                return Err(EngineError::PreconditionFailed(format!(
                    "Process {} is already an editable draft",
                    process.id
                )));
            }
            process.version += 1;
            process.status = ProcessStatus::Draft;
            Ok(())
        })
        .await
    }

    async fn change_status<F>(
        &self,
        scope: &Scope,
        process_id: &str,
        apply: F,
    ) -> EngineResult<ProcessDefinition>
    where
        F: FnOnce(&mut ProcessDefinition) -> EngineResult<()> + Send,
    {
        let mut tx = self.pool.begin().await?;
        let mut process = db::process_definitions::load_process(&mut *tx, scope, process_id)
            .await?
            .ok_or_else(|| EngineError::not_found("process definition", process_id))?;

        apply(&mut process)?;
        process.updated_at = now();

        if !db::process_definitions::update_process_status(&mut *tx, &process).await? {
            return Err(EngineError::not_found("process definition", process_id));
        }
        tx.commit().await?;

        tracing::info!(
            process_id,
            status = process.status.as_str(),
            version = process.version,
            "process definition status changed"
        );
        Ok(process)
    }
}
