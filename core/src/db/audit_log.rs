//! Audit log storage
//!
//! Append-only: there is no update or delete here.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use uuid::Uuid;

use crate::db::{from_millis, to_millis};
use crate::error::{decode_error, EngineResult};
use crate::types::{AuditAction, AuditEntity, AuditFilter, AuditLogEntry, NewAuditEntry, Scope};

const AUDIT_COLUMNS: &str = "id, entity_type, entity_id, action, actor_id, project_id, \
     execution_id, description, metadata, created_at";

fn entry_from_row(row: &SqliteRow) -> EngineResult<AuditLogEntry> {
    let entity_type: String = row.try_get("entity_type")?;
    let entity = AuditEntity::from_parts(&entity_type, row.try_get("entity_id")?)
        .map_err(|e| decode_error(e.to_string()))?;
    let action: String = row.try_get("action")?;
    let action = action
        .parse::<AuditAction>()
        .map_err(|e| decode_error(e.to_string()))?;
    let metadata: String = row.try_get("metadata")?;

    Ok(AuditLogEntry {
        id: row.try_get("id")?,
        entity,
        action,
        actor_id: row.try_get("actor_id")?,
        project_id: row.try_get("project_id")?,
        execution_id: row.try_get("execution_id")?,
        description: row.try_get("description")?,
        metadata: serde_json::from_str(&metadata)?,
        created_at: from_millis(row.try_get("created_at")?)?,
    })
}

/// Append an entry
pub async fn insert_entry<'e, E>(
    executor: E,
    entry: NewAuditEntry,
    created_at: DateTime<Utc>,
) -> EngineResult<AuditLogEntry>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let id = Uuid::new_v4().to_string();

    sqlx::query(
        r#"
        INSERT INTO audit_log (
            id, entity_type, entity_id, action, actor_id, project_id,
            execution_id, description, metadata, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(entry.entity.entity_type())
    .bind(entry.entity.entity_id())
    .bind(entry.action.as_str())
    .bind(&entry.actor_id)
    .bind(&entry.project_id)
    .bind(&entry.execution_id)
    .bind(&entry.description)
    .bind(serde_json::to_string(&entry.metadata)?)
    .bind(to_millis(created_at))
    .execute(executor)
    .await?;

    Ok(AuditLogEntry {
        id,
        entity: entry.entity,
        action: entry.action,
        actor_id: entry.actor_id,
        project_id: entry.project_id,
        execution_id: entry.execution_id,
        description: entry.description,
        metadata: entry.metadata,
        created_at,
    })
}

/// All entries recorded against an execution, newest first
pub async fn list_for_execution<'e, E>(
    executor: E,
    scope: &Scope,
    execution_id: &str,
) -> EngineResult<Vec<AuditLogEntry>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(&format!(
        r#"
        SELECT {} FROM audit_log
        WHERE project_id = ? AND execution_id = ?
        ORDER BY created_at DESC, rowid DESC
        "#,
        AUDIT_COLUMNS
    ))
    .bind(&scope.project_id)
    .bind(execution_id)
    .fetch_all(executor)
    .await?;

    rows.iter().map(entry_from_row).collect()
}

/// Entries of a project, optionally narrowed to one entity or action
pub async fn list_entries<'e, E>(
    executor: E,
    scope: &Scope,
    filter: &AuditFilter,
    limit: u32,
) -> EngineResult<Vec<AuditLogEntry>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
        "SELECT {} FROM audit_log WHERE project_id = ",
        AUDIT_COLUMNS
    ));
    query.push_bind(scope.project_id.clone());

    if let Some(entity) = &filter.entity {
        query
            .push(" AND entity_type = ")
            .push_bind(entity.entity_type())
            .push(" AND entity_id = ")
            .push_bind(entity.entity_id().to_string());
    }
    if let Some(action) = filter.action {
        query.push(" AND action = ").push_bind(action.as_str());
    }
    query
        .push(" ORDER BY created_at DESC, rowid DESC LIMIT ")
        .push_bind(i64::from(limit))
        .push(" OFFSET ")
        .push_bind(i64::from(filter.offset));

    let rows = query.build().fetch_all(executor).await?;
    rows.iter().map(entry_from_row).collect()
}

/// Number of entries recorded against an execution
#[cfg(test)]
pub async fn count_for_execution<'e, E>(executor: E, execution_id: &str) -> EngineResult<i64>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM audit_log WHERE execution_id = ?")
        .bind(execution_id)
        .fetch_one(executor)
        .await?;

    Ok(count)
}
