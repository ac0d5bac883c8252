//! Execution record store

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};

use crate::db::{from_millis, to_millis};
use crate::error::{decode_error, EngineResult};
use crate::types::{Execution, ExecutionFilters, ExecutionStatus, Scope, SortDirection};

const EXECUTION_COLUMNS: &str = "id, project_id, process_id, process_version, status, actor_id, \
     input_data, output_data, error_message, metadata, retry_of, revision, \
     started_at, completed_at, created_at, updated_at";

fn execution_from_row(row: &SqliteRow) -> EngineResult<Execution> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<ExecutionStatus>()
        .map_err(|_| decode_error(format!("unknown execution status '{}'", status)))?;

    let input_data: String = row.try_get("input_data")?;
    let output_data: Option<String> = row.try_get("output_data")?;
    let metadata: String = row.try_get("metadata")?;

    Ok(Execution {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        process_id: row.try_get("process_id")?,
        process_version: row.try_get("process_version")?,
        status,
        actor_id: row.try_get("actor_id")?,
        input_data: serde_json::from_str(&input_data)?,
        output_data: output_data
            .map(|text| serde_json::from_str(&text))
            .transpose()?,
        error_message: row.try_get("error_message")?,
        metadata: serde_json::from_str(&metadata)?,
        retry_of: row.try_get("retry_of")?,
        revision: row.try_get("revision")?,
        started_at: row
            .try_get::<Option<i64>, _>("started_at")?
            .map(from_millis)
            .transpose()?,
        completed_at: row
            .try_get::<Option<i64>, _>("completed_at")?
            .map(from_millis)
            .transpose()?,
        created_at: from_millis(row.try_get("created_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
    })
}

/// Insert a new execution row
///
/// Fails with a unique violation when another execution already retried the
/// same original (`retry_of`).
pub async fn insert_execution<'e, E>(executor: E, execution: &Execution) -> EngineResult<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let output_data = execution
        .output_data
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    sqlx::query(
        r#"
        INSERT INTO executions (
            id, project_id, process_id, process_version, status, actor_id,
            input_data, output_data, error_message, metadata, retry_of, revision,
            started_at, completed_at, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&execution.id)
    .bind(&execution.project_id)
    .bind(&execution.process_id)
    .bind(execution.process_version)
    .bind(execution.status.as_str())
    .bind(&execution.actor_id)
    .bind(serde_json::to_string(&execution.input_data)?)
    .bind(output_data)
    .bind(&execution.error_message)
    .bind(serde_json::to_string(&execution.metadata)?)
    .bind(&execution.retry_of)
    .bind(execution.revision)
    .bind(execution.started_at.map(to_millis))
    .bind(execution.completed_at.map(to_millis))
    .bind(to_millis(execution.created_at))
    .bind(to_millis(execution.updated_at))
    .execute(executor)
    .await?;

    Ok(())
}

/// Get an execution by id within a scope
pub async fn get_execution<'e, E>(
    executor: E,
    scope: &Scope,
    execution_id: &str,
) -> EngineResult<Option<Execution>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(&format!(
        "SELECT {} FROM executions WHERE id = ? AND project_id = ?",
        EXECUTION_COLUMNS
    ))
    .bind(execution_id)
    .bind(&scope.project_id)
    .fetch_optional(executor)
    .await?;

    row.as_ref().map(execution_from_row).transpose()
}

/// Write the mutable columns of `execution` if the stored revision is still
/// `expected_revision`
///
/// Returns false when another writer got there first. The stored revision
/// becomes `execution.revision`.
pub async fn update_execution<'e, E>(
    executor: E,
    execution: &Execution,
    expected_revision: i64,
) -> EngineResult<bool>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let output_data = execution
        .output_data
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    let result = sqlx::query(
        r#"
        UPDATE executions
        SET status = ?,
            output_data = ?,
            error_message = ?,
            metadata = ?,
            started_at = ?,
            completed_at = ?,
            updated_at = ?,
            revision = ?
        WHERE id = ?
          AND project_id = ?
          AND revision = ?
        "#,
    )
    .bind(execution.status.as_str())
    .bind(output_data)
    .bind(&execution.error_message)
    .bind(serde_json::to_string(&execution.metadata)?)
    .bind(execution.started_at.map(to_millis))
    .bind(execution.completed_at.map(to_millis))
    .bind(to_millis(execution.updated_at))
    .bind(execution.revision)
    .bind(&execution.id)
    .bind(&execution.project_id)
    .bind(expected_revision)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Id of the execution that retried `original_id`, if any
pub async fn find_retry_of<'e, E>(executor: E, original_id: &str) -> EngineResult<Option<String>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let id = sqlx::query_scalar("SELECT id FROM executions WHERE retry_of = ?")
        .bind(original_id)
        .fetch_optional(executor)
        .await?;

    Ok(id)
}

/// List executions with filters, newest first unless `direction` says otherwise
///
/// `fetch_limit` rows at most; callers ask for one extra row to learn whether
/// another page exists. A cursor selects the rows from its `(created_at, id)`
/// position onwards.
pub async fn list_executions<'e, E>(
    executor: E,
    scope: &Scope,
    filters: &ExecutionFilters,
    direction: SortDirection,
    fetch_limit: u32,
) -> EngineResult<Vec<Execution>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
        "SELECT {} FROM executions WHERE project_id = ",
        EXECUTION_COLUMNS
    ));
    query.push_bind(scope.project_id.clone());

    if let Some(process_id) = &filters.process_id {
        query.push(" AND process_id = ").push_bind(process_id.clone());
    }
    if let Some(actor_id) = &filters.actor_id {
        query.push(" AND actor_id = ").push_bind(actor_id.clone());
    }
    if !filters.statuses.is_empty() {
        query.push(" AND status IN (");
        let mut separated = query.separated(", ");
        for status in &filters.statuses {
            separated.push_bind(status.as_str());
        }
        separated.push_unseparated(")");
    }
    if let Some(cursor) = &filters.cursor {
        // rows at or past the cursor in (created_at, id) order
        let (strict, inclusive) = match direction {
            SortDirection::Desc => (" < ", " <= "),
            SortDirection::Asc => (" > ", " >= "),
        };
        let created_at = to_millis(cursor.created_at);
        query.push(" AND (created_at").push(strict).push_bind(created_at);
        query.push(" OR (created_at = ").push_bind(created_at);
        query.push(" AND id").push(inclusive).push_bind(cursor.id.clone());
        query.push("))");
    }

    match direction {
        SortDirection::Desc => query.push(" ORDER BY created_at DESC, id DESC"),
        SortDirection::Asc => query.push(" ORDER BY created_at ASC, id ASC"),
    };
    query.push(" LIMIT ").push_bind(i64::from(fetch_limit));

    let rows = query.build().fetch_all(executor).await?;
    rows.iter().map(execution_from_row).collect()
}

/// Per-status aggregate over a creation window
#[derive(Debug, Clone, PartialEq)]
pub struct StatusAggregate {
    pub status: String,
    pub count: i64,
    /// Mean of `completed_at - started_at` over rows having both, in ms
    pub average_duration_ms: Option<f64>,
}

/// Group executions created in `[since, until]` by status
pub async fn aggregate_by_status<'e, E>(
    executor: E,
    scope: &Scope,
    process_id: Option<&str>,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> EngineResult<Vec<StatusAggregate>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
        r#"
        SELECT status,
               COUNT(*) AS count,
               AVG(CASE
                       WHEN started_at IS NOT NULL AND completed_at IS NOT NULL
                       THEN completed_at - started_at
                   END) AS average_duration_ms
        FROM executions
        WHERE project_id = "#,
    );
    query.push_bind(scope.project_id.clone());
    query.push(" AND created_at >= ").push_bind(to_millis(since));
    query.push(" AND created_at <= ").push_bind(to_millis(until));
    if let Some(process_id) = process_id {
        query.push(" AND process_id = ").push_bind(process_id.to_string());
    }
    query.push(" GROUP BY status ORDER BY status");

    let rows = query.build().fetch_all(executor).await?;
    rows.iter()
        .map(|row| {
            Ok(StatusAggregate {
                status: row.try_get("status")?,
                count: row.try_get("count")?,
                average_duration_ms: row.try_get("average_duration_ms")?,
            })
        })
        .collect()
}

/// Count executions per whole hour since `start`, for `hours` buckets,
/// ignoring rows created after `until`
///
/// Returns `(bucket_index, count)` for non-empty buckets only.
pub async fn hourly_counts<'e, E>(
    executor: E,
    scope: &Scope,
    process_id: Option<&str>,
    start: DateTime<Utc>,
    hours: i64,
    until: DateTime<Utc>,
) -> EngineResult<Vec<(i64, i64)>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    const HOUR_MS: i64 = 3_600_000;
    let start_ms = to_millis(start);

    let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT (created_at - ");
    query.push_bind(start_ms);
    query.push(") / ");
    query.push_bind(HOUR_MS);
    query.push(" AS bucket, COUNT(*) AS count FROM executions WHERE project_id = ");
    query.push_bind(scope.project_id.clone());
    query.push(" AND created_at >= ").push_bind(start_ms);
    query
        .push(" AND created_at < ")
        .push_bind(start_ms + hours * HOUR_MS);
    query.push(" AND created_at <= ").push_bind(to_millis(until));
    if let Some(process_id) = process_id {
        query.push(" AND process_id = ").push_bind(process_id.to_string());
    }
    query.push(" GROUP BY bucket ORDER BY bucket");

    let rows = query.build().fetch_all(executor).await?;
    rows.iter()
        .map(|row| Ok((row.try_get("bucket")?, row.try_get("count")?)))
        .collect()
}
