//! Execution statistics over a creation-time window
//!
//! Everything is aggregated by the database; no execution rows are loaded.
//! Reads run outside any lifecycle transaction.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::db;
use crate::error::{EngineError, EngineResult};
use crate::types::{now, ExecutionStatus, Scope};

/// Histogram never covers more than this many hours
const MAX_HISTOGRAM_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeRange {
    #[serde(rename = "1h")]
    LastHour,
    #[default]
    #[serde(rename = "24h")]
    LastDay,
    #[serde(rename = "7d")]
    LastWeek,
    #[serde(rename = "30d")]
    LastMonth,
}

impl TimeRange {
    pub fn hours(&self) -> i64 {
        match self {
            TimeRange::LastHour => 1,
            TimeRange::LastDay => 24,
            TimeRange::LastWeek => 24 * 7,
            TimeRange::LastMonth => 24 * 30,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeRange::LastHour => "1h",
            TimeRange::LastDay => "24h",
            TimeRange::LastWeek => "7d",
            TimeRange::LastMonth => "30d",
        }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeRange {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1h" => Ok(TimeRange::LastHour),
            "24h" => Ok(TimeRange::LastDay),
            "7d" => Ok(TimeRange::LastWeek),
            "30d" => Ok(TimeRange::LastMonth),
            other => Err(EngineError::validation(format!(
                "Invalid time range: {}. Must be one of: 1h, 24h, 7d, 30d",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HourlyBucket {
    pub hour_start: DateTime<Utc>,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    pub total_executions: i64,
    pub successful_executions: i64,
    pub failed_executions: i64,
    /// Fraction of executions in the window that completed, 0 when empty
    pub success_rate: f64,
    pub failure_rate: f64,
    /// Mean run time of completed executions with both timestamps, 0 when none
    pub average_execution_time_ms: f64,
    /// Every status, including those with no executions
    pub status_counts: BTreeMap<String, i64>,
    /// Oldest bucket first; the last bucket is the current hour
    pub hourly: Vec<HourlyBucket>,
    pub time_range: TimeRange,
    pub window_start: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
}

fn ratio(part: i64, total: i64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

#[derive(Clone)]
pub struct StatsService {
    pool: SqlitePool,
}

impl StatsService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get_stats(
        &self,
        scope: &Scope,
        process_id: Option<&str>,
        time_range: TimeRange,
    ) -> EngineResult<ExecutionStats> {
        self.get_stats_at(scope, process_id, time_range, now())
            .await
            .inspect_err(|err| {
                tracing::warn!(
                    operation = "get_stats",
                    project_id = %scope.project_id,
                    process_id = ?process_id,
                    error = %err,
                    "statistics query failed"
                )
            })
    }

    /// Statistics as seen at `at`
    pub async fn get_stats_at(
        &self,
        scope: &Scope,
        process_id: Option<&str>,
        time_range: TimeRange,
        at: DateTime<Utc>,
    ) -> EngineResult<ExecutionStats> {
        let window_start = at - Duration::hours(time_range.hours());

        let aggregates =
            db::executions::aggregate_by_status(&self.pool, scope, process_id, window_start, at)
                .await?;

        let mut status_counts: BTreeMap<String, i64> = ExecutionStatus::ALL
            .iter()
            .map(|status| (status.as_str().to_string(), 0))
            .collect();
        let mut average_execution_time_ms = 0.0;
        for aggregate in &aggregates {
            *status_counts.entry(aggregate.status.clone()).or_insert(0) += aggregate.count;
            if aggregate.status == ExecutionStatus::Completed.as_str() {
                average_execution_time_ms = aggregate.average_duration_ms.unwrap_or(0.0);
            }
        }

        let total_executions: i64 = status_counts.values().sum();
        let successful_executions = status_counts[ExecutionStatus::Completed.as_str()];
        let failed_executions = status_counts[ExecutionStatus::Failed.as_str()];

        let histogram_hours = time_range.hours().min(MAX_HISTOGRAM_HOURS);
        let current_hour = at
            .duration_trunc(Duration::hours(1))
            .map_err(|e| EngineError::validation(format!("Invalid statistics time: {}", e)))?;
        let histogram_start = current_hour - Duration::hours(histogram_hours - 1);

        let mut hourly: Vec<HourlyBucket> = (0..histogram_hours)
            .map(|i| HourlyBucket {
                hour_start: histogram_start + Duration::hours(i),
                count: 0,
            })
            .collect();
        let counts = db::executions::hourly_counts(
            &self.pool,
            scope,
            process_id,
            histogram_start,
            histogram_hours,
            at,
        )
        .await?;
        for (bucket, count) in counts {
            if let Some(slot) = usize::try_from(bucket).ok().and_then(|i| hourly.get_mut(i)) {
                slot.count = count;
            }
        }

        tracing::debug!(
            project_id = %scope.project_id,
            time_range = time_range.as_str(),
            total_executions,
            "statistics computed"
        );

        Ok(ExecutionStats {
            total_executions,
            successful_executions,
            failed_executions,
            success_rate: ratio(successful_executions, total_executions),
            failure_rate: ratio(failed_executions, total_executions),
            average_execution_time_ms,
            status_counts,
            hourly,
            time_range,
            window_start,
            generated_at: at,
        })
    }
}
