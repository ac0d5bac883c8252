//! Process definition and step storage

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqliteConnection};

use crate::db::{from_millis, to_millis};
use crate::error::{decode_error, EngineResult};
use crate::types::{ProcessDefinition, ProcessStatus, Scope, Step};

fn process_from_row(row: &SqliteRow) -> EngineResult<ProcessDefinition> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<ProcessStatus>()
        .map_err(|e| decode_error(e.to_string()))?;

    Ok(ProcessDefinition {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        name: row.try_get("name")?,
        version: row.try_get("version")?,
        status,
        steps: Vec::new(),
        created_at: from_millis(row.try_get("created_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
    })
}

fn step_from_row(row: &SqliteRow) -> EngineResult<Step> {
    let config: String = row.try_get("config")?;

    Ok(Step {
        id: row.try_get("id")?,
        process_id: row.try_get("process_id")?,
        parent_step_id: row.try_get("parent_step_id")?,
        name: row.try_get("name")?,
        step_type: row.try_get("step_type")?,
        position: row.try_get("position")?,
        config: serde_json::from_str(&config)?,
        is_active: row.try_get("is_active")?,
    })
}

/// Insert the definition row (steps are inserted separately)
pub async fn insert_process<'e, E>(executor: E, process: &ProcessDefinition) -> EngineResult<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO process_definitions (id, project_id, name, version, status, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&process.id)
    .bind(&process.project_id)
    .bind(&process.name)
    .bind(process.version)
    .bind(process.status.as_str())
    .bind(to_millis(process.created_at))
    .bind(to_millis(process.updated_at))
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn insert_step<'e, E>(executor: E, step: &Step) -> EngineResult<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO steps (id, process_id, parent_step_id, name, step_type, position, config, is_active)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&step.id)
    .bind(&step.process_id)
    .bind(&step.parent_step_id)
    .bind(&step.name)
    .bind(&step.step_type)
    .bind(step.position)
    .bind(serde_json::to_string(&step.config)?)
    .bind(step.is_active)
    .execute(executor)
    .await?;

    Ok(())
}

/// Persist a new status and version; returns false if the definition is gone
pub async fn update_process_status<'e, E>(
    executor: E,
    process: &ProcessDefinition,
) -> EngineResult<bool>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        UPDATE process_definitions
        SET status = ?, version = ?, updated_at = ?
        WHERE id = ? AND project_id = ?
        "#,
    )
    .bind(process.status.as_str())
    .bind(process.version)
    .bind(to_millis(process.updated_at))
    .bind(&process.id)
    .bind(&process.project_id)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Load a definition with all of its steps
pub async fn load_process(
    conn: &mut SqliteConnection,
    scope: &Scope,
    process_id: &str,
) -> EngineResult<Option<ProcessDefinition>> {
    let row = sqlx::query(
        r#"
        SELECT id, project_id, name, version, status, created_at, updated_at
        FROM process_definitions
        WHERE id = ? AND project_id = ?
        "#,
    )
    .bind(process_id)
    .bind(&scope.project_id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let mut process = process_from_row(&row)?;

    let step_rows = sqlx::query(
        r#"
        SELECT id, process_id, parent_step_id, name, step_type, position, config, is_active
        FROM steps
        WHERE process_id = ?
        ORDER BY position ASC, id ASC
        "#,
    )
    .bind(process_id)
    .fetch_all(&mut *conn)
    .await?;

    process.steps = step_rows
        .iter()
        .map(step_from_row)
        .collect::<EngineResult<Vec<_>>>()?;

    Ok(Some(process))
}
