use chrono::{DateTime, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;

pub type JsonMap = Map<String, JsonValue>;

/// Current time at the precision the store keeps (milliseconds)
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Tenant/project boundary every read and write is filtered by
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub project_id: String,
}

impl Scope {
    pub fn project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
        }
    }
}

/* ===================== Executions ===================== */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub const ALL: [ExecutionStatus; 5] = [
        ExecutionStatus::Pending,
        ExecutionStatus::Running,
        ExecutionStatus::Completed,
        ExecutionStatus::Failed,
        ExecutionStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.to_lowercase();
        ExecutionStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == wanted)
            .ok_or_else(|| {
                EngineError::validation(format!(
                    "Invalid status: {}. Must be one of: pending, running, completed, failed, cancelled",
                    s
                ))
            })
    }
}

/// Metadata keys the engine reads and writes on executions
pub mod meta {
    pub const WORKFLOW_STATE_ID: &str = "workflowStateId";
    pub const IS_RETRY: &str = "isRetry";
    pub const ORIGINAL_EXECUTION_ID: &str = "originalExecutionId";
    pub const RETRY_ATTEMPT: &str = "retryAttempt";
    pub const CURRENT_STEP_ID: &str = "currentStepId";

    /// Keys that describe one particular run and are never copied to a retry
    pub const RUN_BOOKKEEPING: [&str; 5] = [
        WORKFLOW_STATE_ID,
        IS_RETRY,
        ORIGINAL_EXECUTION_ID,
        RETRY_ATTEMPT,
        CURRENT_STEP_ID,
    ];
}

/// One run of a process definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: String,
    pub project_id: String,
    pub process_id: String,
    pub process_version: i64,
    pub status: ExecutionStatus,
    pub actor_id: String,

    pub input_data: JsonValue,
    pub output_data: Option<JsonValue>,
    pub error_message: Option<String>,
    pub metadata: JsonMap,

    pub retry_of: Option<String>,
    pub revision: i64,

    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    /// Correlation id of the workflow-state handle owned by this run
    pub fn workflow_state_id(&self) -> Option<&str> {
        self.metadata
            .get(meta::WORKFLOW_STATE_ID)
            .and_then(JsonValue::as_str)
    }

    /// Retry counter carried in metadata, 0 for a first run
    pub fn retry_attempt(&self) -> i64 {
        self.metadata
            .get(meta::RETRY_ATTEMPT)
            .and_then(JsonValue::as_i64)
            .unwrap_or(0)
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some((completed - started).num_milliseconds()),
            _ => None,
        }
    }
}

/// Partial update applied by `ExecutionService::update`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPatch {
    pub status: Option<ExecutionStatus>,
    pub output_data: Option<JsonValue>,
    pub error_message: Option<String>,
    pub metadata: Option<JsonMap>,
}

impl ExecutionPatch {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.output_data.is_none()
            && self.error_message.is_none()
            && self.metadata.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionFilters {
    pub process_id: Option<String>,
    #[serde(default)]
    pub statuses: Vec<ExecutionStatus>,
    pub actor_id: Option<String>,
    /// `next` of the previous page
    pub cursor: Option<PageCursor>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPage {
    pub items: Vec<Execution>,
    pub next: Option<PageCursor>,
}

/// Position of the first row of the following page
///
/// Rows are totally ordered by `(created_at, id)`, so rows created in the same
/// millisecond are neither repeated nor skipped. Rendered as
/// `<created_at millis>.<id>`; callers should treat the string as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PageCursor {
    pub created_at: DateTime<Utc>,
    pub id: String,
}

impl PageCursor {
    pub fn at(execution: &Execution) -> Self {
        Self {
            created_at: execution.created_at,
            id: execution.id.clone(),
        }
    }
}

impl fmt::Display for PageCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.created_at.timestamp_millis(), self.id)
    }
}

impl FromStr for PageCursor {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || EngineError::validation(format!("Invalid page cursor '{}'", s));
        let (millis, id) = s.split_once('.').ok_or_else(invalid)?;
        let millis: i64 = millis.parse().map_err(|_| invalid())?;
        let created_at = Utc.timestamp_millis_opt(millis).single().ok_or_else(invalid)?;
        if id.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            created_at,
            id: id.to_string(),
        })
    }
}

impl TryFrom<String> for PageCursor {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PageCursor> for String {
    fn from(cursor: PageCursor) -> Self {
        cursor.to_string()
    }
}

/* ===================== Process definitions ===================== */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Draft,
    Active,
    Archived,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Draft => "draft",
            ProcessStatus::Active => "active",
            ProcessStatus::Archived => "archived",
        }
    }
}

impl FromStr for ProcessStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(ProcessStatus::Draft),
            "active" => Ok(ProcessStatus::Active),
            "archived" => Ok(ProcessStatus::Archived),
            other => Err(EngineError::validation(format!(
                "Invalid process status: {}",
                other
            ))),
        }
    }
}

/// A unit of work within a process definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    pub process_id: String,
    pub parent_step_id: Option<String>,
    pub name: String,
    /// Free-form tag such as "manual_task", "approval_gate", "decision_point"
    pub step_type: String,
    pub position: i64,
    pub config: JsonMap,
    pub is_active: bool,
}

/// Step supplied when authoring a definition; the id is optional so callers
/// can reference parents declared earlier in the same batch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewStep {
    pub id: Option<String>,
    pub parent_step_id: Option<String>,
    pub name: String,
    pub step_type: String,
    pub position: i64,
    #[serde(default)]
    pub config: JsonMap,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessDefinition {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub version: i64,
    pub status: ProcessStatus,
    pub steps: Vec<Step>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/* ===================== Audit log ===================== */

/// What an audit entry is about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entityType", content = "entityId", rename_all = "lowercase")]
pub enum AuditEntity {
    Execution(String),
    Step(String),
    Project(String),
}

impl AuditEntity {
    pub fn entity_type(&self) -> &'static str {
        match self {
            AuditEntity::Execution(_) => "execution",
            AuditEntity::Step(_) => "step",
            AuditEntity::Project(_) => "project",
        }
    }

    pub fn entity_id(&self) -> &str {
        match self {
            AuditEntity::Execution(id) | AuditEntity::Step(id) | AuditEntity::Project(id) => id,
        }
    }

    pub fn from_parts(entity_type: &str, entity_id: String) -> Result<Self, EngineError> {
        match entity_type {
            "execution" => Ok(AuditEntity::Execution(entity_id)),
            "step" => Ok(AuditEntity::Step(entity_id)),
            "project" => Ok(AuditEntity::Project(entity_id)),
            other => Err(EngineError::validation(format!(
                "Unknown audit entity type: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Create,
    Update,
    Cancel,
    Execute,
    Retry,
    Advance,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "create",
            AuditAction::Update => "update",
            AuditAction::Cancel => "cancel",
            AuditAction::Execute => "execute",
            AuditAction::Retry => "retry",
            AuditAction::Advance => "advance",
        }
    }
}

impl FromStr for AuditAction {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(AuditAction::Create),
            "update" => Ok(AuditAction::Update),
            "cancel" => Ok(AuditAction::Cancel),
            "execute" => Ok(AuditAction::Execute),
            "retry" => Ok(AuditAction::Retry),
            "advance" => Ok(AuditAction::Advance),
            other => Err(EngineError::validation(format!(
                "Unknown audit action: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub id: String,
    #[serde(flatten)]
    pub entity: AuditEntity,
    pub action: AuditAction,
    pub actor_id: String,
    pub project_id: String,
    pub execution_id: Option<String>,
    pub description: String,
    pub metadata: JsonMap,
    pub created_at: DateTime<Utc>,
}

/// Entry to append; id and timestamp are assigned by the store
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub entity: AuditEntity,
    pub action: AuditAction,
    pub actor_id: String,
    pub project_id: String,
    pub execution_id: Option<String>,
    pub description: String,
    pub metadata: JsonMap,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditFilter {
    pub entity: Option<AuditEntity>,
    pub action: Option<AuditAction>,
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: u32,
}

/* ===================== Execution logs ===================== */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Level guessed from an action tag
    pub fn from_action(action: &str) -> Self {
        let action = action.to_lowercase();
        if action.contains("error") || action.contains("failed") {
            LogLevel::Error
        } else if action.contains("warning") || action.contains("cancelled") {
            LogLevel::Warn
        } else if action.contains("debug") {
            LogLevel::Debug
        } else {
            LogLevel::Info
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    AuditLog,
    WorkflowState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub action: String,
    pub message: String,
    pub actor_id: Option<String>,
    pub source: LogSource,
    pub metadata: JsonMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLogs {
    pub logs: Vec<ExecutionLogEntry>,
    pub total: usize,
}
