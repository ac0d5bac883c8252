//! Database access
//!
//! Functions in the submodules take any `sqlx::Executor` so the same call runs
//! against the pool or inside a transaction (`&mut *tx`). Timestamps are
//! stored as epoch milliseconds and JSON payloads as TEXT.

pub mod audit_log;
pub mod executions;
pub mod process_definitions;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::config::DatabaseConfig;
use crate::error::decode_error;

/// Create a connection pool from configuration
///
/// In-memory databases exist per connection, so they are pinned to a single
/// connection that is never recycled.
pub async fn create_pool(config: &DatabaseConfig) -> Result<SqlitePool> {
    let url = config
        .url
        .as_deref()
        .context("Database URL validated by config loading")?;

    let options = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("Invalid database URL '{}'", url))?
        .create_if_missing(true);

    let pool_options = if url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
    } else {
        SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
    };

    let pool = pool_options
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .connect_with(options)
        .await
        .context("Failed to connect to database")?;

    Ok(pool)
}

/// Run database migrations
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("Failed to run migrations")?;

    Ok(())
}

/// Check whether the engine tables exist
pub async fn check_initialized(pool: &SqlitePool) -> Result<()> {
    sqlx::query("SELECT 1 FROM executions LIMIT 1")
        .fetch_optional(pool)
        .await
        .context("Database has not been initialized")?;

    Ok(())
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, sqlx::Error> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| decode_error(format!("timestamp out of range: {}", ms)))
}
