//! Process definition lookup used by the execution service

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::db;
use crate::error::EngineResult;
use crate::types::{ProcessDefinition, Scope};

#[async_trait]
pub trait ProcessCatalog: Send + Sync {
    /// Definition with its steps, or None if absent or outside `scope`
    async fn find_process(
        &self,
        scope: &Scope,
        process_id: &str,
    ) -> EngineResult<Option<ProcessDefinition>>;
}

/// Catalog backed by the engine's own `process_definitions` and `steps` tables
#[derive(Clone)]
pub struct SqlProcessCatalog {
    pool: SqlitePool,
}

impl SqlProcessCatalog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProcessCatalog for SqlProcessCatalog {
    async fn find_process(
        &self,
        scope: &Scope,
        process_id: &str,
    ) -> EngineResult<Option<ProcessDefinition>> {
        let mut conn = self.pool.acquire().await?;
        db::process_definitions::load_process(&mut *conn, scope, process_id).await
    }
}
